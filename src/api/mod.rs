//! HTTP surface: caller API, auth, rate limiting, request correlation.

pub mod client;
pub mod client_auth;
pub mod health;
pub mod rate_limit;
pub mod request_id;
