//! Dev: local multi-service development from a docker-compose manifest.
//!
//! - `manifest.rs`: manifest model, port/env validation, default generation
//! - `backend.rs`: `DevBackend` seam over the container engine
//! - `sync.rs`: live file sync into running containers
//! - `orchestrator.rs`: the `start` pipeline tying it together

pub mod backend;
pub mod manifest;
pub mod orchestrator;
pub mod sync;
