pub mod config;
pub mod log_sink;
pub mod logger;
