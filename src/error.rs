//! Errors surfaced by cells and mediators.
//!
//! All of these are usage errors: they are returned synchronously from the
//! offending call and nothing is partially applied.

use crate::cell::CellId;
use crate::listener::ListenerId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    /// The listener is already registered with a different scope.
    #[error("Listener already registered with a different activity scope. listener: {listener:?}")]
    ConflictingRegistration { listener: ListenerId },

    /// The upstream cell is already a source of this mediator with another listener.
    #[error("Source already added with a different listener. cell: {cell:?}")]
    ConflictingSource { cell: CellId },

    /// A mutating operation ran outside the cell's coordinating context.
    #[error("Cannot invoke {operation} outside the coordinating context")]
    OffContextMutation { operation: &'static str },
}
