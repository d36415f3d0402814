//! scudo: a request-interception cache for static assets.
//!
//! The engine sits in front of an upstream origin, intercepts GET
//! requests for images and fonts, and serves them from seeded,
//! versioned in-memory stores with background revalidation. A small
//! management API handles bulk seeding, purging, and inspection.

pub mod config;
pub mod engine;
pub mod infra;
pub mod util;
