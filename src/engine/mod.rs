//! The interception cache engine.
//!
//! Everything under this module is transport-agnostic: the HTTP layer
//! in [`crate::infra::http`] adapts axum requests onto [`pipeline`],
//! and the management handlers drive [`ops`] and [`resolver`]. The
//! engine itself only sees URLs, header values, and blobs.

pub mod classify;
pub mod config;
pub mod fetch;
pub mod key;
pub mod metrics;
pub mod ops;
pub mod pipeline;
pub mod resolver;
pub mod store;

pub use config::EngineConfig;
pub use pipeline::Pipeline;
