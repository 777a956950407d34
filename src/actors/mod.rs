//! Actor-based meter pipeline
//!
//! Each actor runs as an independent async task communicating via Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │   Hub (main)    │
//!                    └────────┬────────┘
//!                             │ spawns
//!                    ┌────────▼────────┐
//!                    │   PollerActor   │──▶ watch (latest result per meter)
//!                    │  (serial bus)   │
//!                    └────────┬────────┘
//!                             │ PollResult (bounded mpsc, one per subscriber)
//!                ┌────────────┴────────────┐
//!                │                         │
//!        ┌───────▼───────┐         ┌───────▼───────┐
//!        │ StorageActor  │         │ DetectorActor │
//!        │ CSV + backend │         │ rule windows  │
//!        └───────┬───────┘         └───────┬───────┘
//!                │                         │ Anomaly (bounded mpsc)
//!                ▼                 ┌───────▼─────────┐
//!      watch (daily aggregates)    │ DispatcherActor │──▶ AlertSink
//!                                  └─────────────────┘
//! ```
//!
//! ## Actor Types
//!
//! - **PollerActor**: Owns the serial link and polls every enabled meter per round
//! - **StorageActor**: Writes the daily CSV, buffers and flushes to the backend, maintains aggregates
//! - **DetectorActor**: Runs threshold, deviation, imbalance and reachability rules
//! - **DispatcherActor**: Suppresses repeats, batches, and delivers alerts and digests
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: Results flow downstream through bounded mpsc queues
//! 3. **Request/Response**: oneshot channels for synchronous queries
//!
//! Shutdown runs front to back: stopping the poller closes the event queues,
//! which lets storage flush and the detector finish, which in turn closes the
//! anomaly queue of the dispatcher.

pub mod detector;
pub mod dispatcher;
pub mod messages;
pub mod poller;
pub mod storage;
