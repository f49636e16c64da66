pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod fs;
pub mod journal;
pub mod recovery;
pub mod snapshot;
pub mod state;
pub mod version;

pub use engine::StorageEngine;
pub use error::{ChronoError, Result};
