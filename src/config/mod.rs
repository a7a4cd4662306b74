pub mod settings;

pub use settings::{ApiConfig, CorpEndpoint, HttpConfig, KeyLogStrategy, LoggingConfig, ServerConfig, Settings};
