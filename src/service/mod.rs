pub use app_error::{AppError, AppResult, ErrorContext, ErrorKind};
pub use config::{
    ClientConfig, ConsumerConfig, ProducerConfig, ResetPolicy, SessionConfig, ENV_PREFIX,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
