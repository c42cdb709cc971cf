//! Built-in emitters.

pub mod debounce;
pub mod stdout;
pub mod store;

pub use debounce::{BulkWriter, Debouncer};
pub use stdout::StdoutEmitter;
pub use store::RecordStore;
