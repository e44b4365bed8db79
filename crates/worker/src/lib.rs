//! ComfyUI serverless worker.
//!
//! Adapts harness jobs (workflow name + parameters) into ComfyUI job
//! graphs, runs them through [`comfyrun_comfyui::engine::EngineClient`]
//! and returns base64 images or a structured error.

pub mod config;
pub mod error;
pub mod handler;
pub mod output;
pub mod routes;
pub mod state;
