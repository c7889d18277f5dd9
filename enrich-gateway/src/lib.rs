pub mod api;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod dlq;
pub mod handlers;
pub mod limiter;
pub mod providers;
pub mod router;
pub mod store;
pub mod transport;
pub mod waterfall;
