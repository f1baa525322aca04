pub mod admin;
pub mod ca;
pub mod cert;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod middleware;
pub mod proxy;
pub mod transport;

pub use config::Config;
pub use engine::Engine;
pub use error::ProxyError;
