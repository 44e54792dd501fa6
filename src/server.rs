//! HTTP API server for workspace provisioning.

pub mod api;
pub mod router;

pub use api::AppState;
pub use router::create_router;
pub use router::run;
