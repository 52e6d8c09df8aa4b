//! chzzk-bridge library crate.
//!
//! Bridges a live-streaming platform's chat and donation feed to local
//! subscribers. Owns the per-subscriber credential lifecycle, deduplicates
//! live sessions and serves the persisted event log as a resumable stream.

pub mod api;
pub mod config;
pub mod database;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod intake;
pub mod logging;
pub mod oauth;
pub mod services;
pub mod session;

pub use error::{Error, Result};
