pub mod config;
pub mod error;

pub use config::SealfsConfig;
pub use error::{SealfsError, SealfsResult};
