pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod retry;
pub mod runner;
pub mod storage;
pub mod target;

pub use error::MigrationError;
pub use runner::{MigrationOutcome, MigrationRunner};
