//! External service integrations

pub mod library;
pub mod metadata;
pub mod notify;
pub mod rate_limiter;
