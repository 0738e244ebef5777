pub mod browser;
pub mod config;
pub mod error;
pub mod jobs;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{PoolError, Result};
pub use scheduler::BrowserPool;
