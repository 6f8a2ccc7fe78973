pub mod apiserver;
pub mod cli;
pub mod config;
pub mod error;
pub mod master;
pub mod metrics;
pub mod registry;
pub mod storage;
pub mod thirdparty;

pub use error::{ApiError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
