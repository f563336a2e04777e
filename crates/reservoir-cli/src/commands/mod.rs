pub mod config;
pub mod soak;
