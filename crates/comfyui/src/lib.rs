//! ComfyUI REST client library.
//!
//! Provides the low-level HTTP API wrapper with retry, typed history and
//! status-message parsing, the composed [`engine::EngineClient`] that
//! drives one job from submission to fetched images, and the startup
//! readiness gate.

pub mod api;
pub mod engine;
pub mod history;
pub mod messages;
pub mod readiness;
pub mod retry;
