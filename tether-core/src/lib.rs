//! # tether-core
//!
//! Connection manager for the tether agent: one authenticated, health-
//! monitored, self-healing link to a remote GUI host, shared by many
//! data producers.
//!
//! This crate contains:
//! - **Link**: `Link`, the connection state machine and its driver, with `CloseReason`
//! - **Credentials**: `CredentialProvider` issuing blake3-signed `AuthToken`s
//! - **Transport**: `Connector` trait, `WsConnector` (WebSocket/TLS), `MemoryConnector` (loopback)
//! - **Health**: heartbeat monitor, `HealthTracker` and `HealthSnapshot`
//! - **Policy**: `ReconnectPolicy`, a pure exponential-backoff decision function
//! - **Mux**: `Multiplexer` with per-producer queues, sequencing and redelivery
//! - **Message / Codec**: the JSON `Envelope` and typed `Inbound` frames
//! - **Config**: `LinkConfig`, serde-loadable with defaults
//! - **Error**: `TetherError`, a `thiserror`-based failure taxonomy

pub mod clock;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod link;
pub mod message;
pub mod mux;
pub mod policy;
pub mod state;
pub mod task;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use clock::{Clock, SystemClock};
pub use config::{LinkConfig, OverflowMode};
pub use credentials::{AuthToken, CredentialProvider};
pub use error::{RejectReason, TetherError};
pub use health::{DegradeReason, HealthSignal, HealthSnapshot};
pub use link::{CloseReason, Link};
pub use message::{Envelope, FrameKind, Inbound};
pub use mux::{DeliveryStatus, Multiplexer, ProducerHandle, ProducerHandler, ProducerId};
pub use policy::{ReconnectAttempt, ReconnectDecision, ReconnectPolicy};
pub use state::{ConnectionState, StatusEvent};
pub use transport::{Connector, MemoryConnector, MemoryHost, OpenOutcome, WsConnector};
