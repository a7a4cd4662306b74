pub mod config;
pub mod error;
pub mod http_client;
pub mod logging;
pub mod providers;
pub mod routing;
pub mod server;
pub mod usage;
