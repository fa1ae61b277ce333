pub mod builds;
pub mod config;
pub mod dev;
pub mod docker;
pub mod errors;
