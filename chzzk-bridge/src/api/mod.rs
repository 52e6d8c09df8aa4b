//! HTTP surface.
//!
//! The public listener only serves the OAuth callback; subscribe,
//! unsubscribe and the event stream live on the internal listener.

pub mod error;
pub mod models;
pub mod openapi;
pub mod routes;
pub mod server;

pub use server::{AppState, BridgeServer};
