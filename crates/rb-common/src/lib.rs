pub mod config;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use config::ProgramConfig;
pub use error::AppError;
pub use shutdown::Shutdown;
