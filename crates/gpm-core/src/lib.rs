pub mod config;
pub mod error;

pub use config::GpmConfig;
pub use error::{GpmError, GpmResult};
