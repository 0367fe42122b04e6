/// Engine configuration
pub mod config;
/// Tracing subscriber setup
pub mod logger;

pub use config::EngineConfig;
pub use logger::setup_logger;
