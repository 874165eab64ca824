pub mod config;
pub mod connection;
pub mod error;
pub mod error_injector;
pub mod expression;
pub mod handlers;
pub mod health;
pub mod latency;
pub mod middleware;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod statistics;
pub mod summary;
pub mod token_bucket;

pub use config::{Config, ServerConfig};
pub use error::{Error, Result};
pub use server::{create_app, Pipeline, RunningServer, Server};
pub use statistics::Statistics;
