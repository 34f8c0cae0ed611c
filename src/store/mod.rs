//! Durable conversation history
//!
//! SQLite-backed storage for conversations and their messages. This is the
//! source of truth for everything that outlives a process.

mod database;
mod errors;
mod models;

pub use database::*;
pub use errors::*;
pub use models::*;
