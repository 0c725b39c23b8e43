pub mod config;
pub mod datum;
pub mod error;
pub mod types;
