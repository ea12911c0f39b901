pub mod actor;
pub mod http;
pub mod stores;
