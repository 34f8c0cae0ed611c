//! Model gateway
//!
//! This module streams completions from a chat model as typed deltas. Every
//! fault a request can hit is reported in-band as a classified failure, so
//! callers only ever consume a single stream.

pub mod errors;
pub mod gateway;
pub mod glm;
pub mod scripted;
pub mod types;

pub use errors::*;
pub use gateway::ModelGateway;
pub use glm::{GatewaySettings, GlmGateway, DEFAULT_BASE_URL, DEFAULT_MODEL};
pub use scripted::{ScriptStep, ScriptedGateway};
pub use types::*;
