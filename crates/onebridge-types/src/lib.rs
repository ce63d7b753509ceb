//! Core types for the OneBot bridge.
//!
//! This crate defines the shared data structures used by the wire layer and
//! the adapter: the unified message model, chat addressing, send results and
//! configuration. It contains no business logic.

pub mod config;
pub mod error;
pub mod message;
pub mod operation;
