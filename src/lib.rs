//! Parley: a terminal chat client with a durable, streaming session engine

pub mod app;
pub mod config;
pub mod llm;
pub mod observer;
pub mod session;
pub mod store;
pub mod version;
