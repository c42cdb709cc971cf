//! Event envelopes, projection statements and the reducer contract.
//!
//! Everything in this crate is pure: reducers turn one envelope into one
//! [`Statement`], and executing that statement is an infrastructure concern.

pub mod envelope;
pub mod event;
pub mod reducer;
pub mod statement;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use reducer::{ReduceError, Reducer, ensure_event};
pub use statement::{Column, ColumnValue, Condition, Execution, Operation, Statement};
