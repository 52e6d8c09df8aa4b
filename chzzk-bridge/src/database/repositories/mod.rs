//! Repository layer for database access.

pub mod credential;
pub mod event;

pub use credential::*;
pub use event::*;
