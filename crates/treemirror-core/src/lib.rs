pub mod canonical;
pub mod config;
pub mod constants;
pub mod error;
pub mod memory;
pub mod nonce;
pub mod ports;
pub mod signals;
pub mod time;
pub mod types;
