//! Bounded histories and persisted state

pub mod ring;
pub mod store;

pub use ring::{BoundedLog, Traced};
pub use store::{StateSnapshot, StateStore};
