pub mod sync;
pub mod types;

pub use sync::SyncSession;
pub use types::*;
