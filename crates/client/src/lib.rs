//! Client-side synchronization core.
//!
//! Sits on top of the transport layer in `orbitlink-shared` and provides the
//! two pieces a simulation client consumes directly: the message router
//! (opcode-addressed dispatch over whichever backend is active) and the
//! position synchronizer (per-entity reconciliation of lossy, out-of-order
//! network samples into a smooth pose).

pub mod context;
pub mod dispatch;
pub mod sync;

pub use context::{FrameIndex, FrameSet, LockAuthority, SyncConfig, SyncContext};
pub use dispatch::{InboundMessage, MessageClass, MessageRouter, RequestKey};
pub use sync::{EntityId, PositionSample, PositionSynchronizer, Pose, TrackPhase};
