//! Domain types for the comfyrun worker.
//!
//! Job graphs, declarative parameter injection, workflow template
//! loading and the inbound job request schema. Everything here is
//! synchronous and free of network I/O.

pub mod error;
pub mod graph;
pub mod injection;
pub mod job;
pub mod templates;
