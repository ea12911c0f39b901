pub mod context;
pub mod deletion;
pub mod detector;
pub mod endpoints;
pub mod executor;
pub mod keys;
pub mod normalize;
pub mod poll;
pub mod queue;
pub mod session;

pub use context::SyncContext;
pub use session::SyncSession;
