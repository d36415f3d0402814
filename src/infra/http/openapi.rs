//! Machine-readable description of the management API.

use serde_json::{Value, json};

pub(super) fn document() -> Value {
    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "scudo management API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Seed, purge, and inspect the static-asset interception cache."
        },
        "paths": {
            "/__cache-api/status": {
                "get": {
                    "summary": "Engine configuration and store summary",
                    "responses": { "200": { "description": "Status document" } }
                }
            },
            "/__cache-api/list": {
                "get": {
                    "summary": "Stored cache keys per namespace",
                    "responses": { "200": { "description": "Key listing" } }
                }
            },
            "/__cache-api/seed": {
                "post": {
                    "summary": "Seed assets into the cache",
                    "parameters": [{
                        "name": "dry",
                        "in": "query",
                        "schema": { "type": "string", "enum": ["1", "true"] },
                        "description": "Report what would be seeded without fetching or storing"
                    }],
                    "requestBody": {
                        "content": { "application/json": { "schema": { "$ref": "#/components/schemas/BulkRequest" } } }
                    },
                    "responses": {
                        "200": { "description": "Per-key seed report" },
                        "403": { "description": "Missing or wrong shared secret" }
                    }
                }
            },
            "/__cache-api/purge": {
                "post": {
                    "summary": "Remove stored entries",
                    "parameters": [{
                        "name": "dry",
                        "in": "query",
                        "schema": { "type": "string", "enum": ["1", "true"] },
                        "description": "Report what would be removed without deleting"
                    }],
                    "requestBody": {
                        "content": { "application/json": { "schema": { "$ref": "#/components/schemas/BulkRequest" } } }
                    },
                    "responses": {
                        "200": { "description": "Per-key purge report" },
                        "403": { "description": "Missing or wrong shared secret" }
                    }
                }
            },
            "/__cache-api/metrics": {
                "get": {
                    "summary": "Engine counters",
                    "parameters": [{
                        "name": "format",
                        "in": "query",
                        "schema": { "type": "string", "enum": ["prom", "json", "pretty"] }
                    }],
                    "responses": { "200": { "description": "Counter values" } }
                }
            },
            "/__cache-api/openapi.json": {
                "get": {
                    "summary": "This document",
                    "responses": { "200": { "description": "OpenAPI description" } }
                }
            },
            "/__cache-api/debug": {
                "get": {
                    "summary": "Human-readable debug page",
                    "responses": { "200": { "description": "HTML page" } }
                }
            }
        },
        "components": {
            "schemas": {
                "BulkRequest": {
                    "type": "object",
                    "properties": {
                        "keys": { "type": "array", "items": { "type": "string" } },
                        "prefix": { "type": "string" },
                        "glob": { "type": "string" },
                        "manifest": { "type": "string" },
                        "max": { "type": "integer" }
                    }
                }
            },
            "securitySchemes": {
                "sharedSecret": {
                    "type": "apiKey",
                    "in": "header",
                    "name": "x-cache-secret"
                }
            }
        }
    })
}
