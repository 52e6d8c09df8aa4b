//! Database models.
//!
//! These map directly to the SQLite schema in `migrations/`.

pub mod credential;
pub mod event;

pub use credential::*;
pub use event::*;
