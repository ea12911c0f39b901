pub mod db;
pub mod entities;
pub mod mirror;
pub mod schema;
pub mod signals;
