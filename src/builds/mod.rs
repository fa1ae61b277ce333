//! Builds: asynchronous image builds with streamed logs.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                 │                      │
//!                       │         │ dispatch()      │ /stream              │
//!                       │         v                 v                      │
//!                       │  executor.rs          stream.rs                  │
//!                       │  (BuildRunner,        (LogRelay polls the store  │
//!                       │   BuildExecutor,       and pushes log deltas)    │
//!                       │   BuildWriter)            │                      │
//!                       │         │ writes          │ reads                │
//!                       │         v                 v                      │
//!                       │  db.rs  (BuildDb, DbHandle)                      │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Build lifecycle
//!
//! `POST /apps/{app}/builds` validates that exactly one source was supplied,
//! persists a `created` build and hands it to the [`executor::BuildRunner`],
//! returning the id immediately. The executor owns the only
//! [`executor::BuildWriter`] for that build: it moves the status to
//! `running`, fetches or unpacks the source, runs the image build and
//! finishes in `complete` or `failed`. Every other reader (list, get, logs,
//! status, stream) works on snapshots from the store.

pub mod api;
pub mod db;
pub mod executor;
pub mod models;
pub mod server;
pub mod stream;
