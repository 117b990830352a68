pub mod cli;
pub mod config;
pub mod error;
pub mod logging;

pub use cli::{execute, run_send, Cli};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
