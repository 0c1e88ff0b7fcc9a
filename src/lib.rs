// Session Guard - authenticated API resilience layer

pub mod auth;
pub mod config;
pub mod context;
pub mod dedup;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod http_client;
pub mod progress;

pub use context::AuthContext;
pub use error::{ApiError, Result};
