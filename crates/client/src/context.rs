//! Shared context threaded through the sync core.
//!
//! Everything that used to be ambient (local identity, the known reference
//! frames, ownership decisions, tuning knobs) lives in one [`SyncContext`]
//! handed to constructors. Nothing in this crate reads global state.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use orbitlink_shared::session::SessionId;

use crate::sync::EntityId;

/// Index into the locally known reference-frame set.
pub type FrameIndex = u32;

/// Growable registry of coordinate reference frames (celestial bodies and
/// similar origins). Append-only: an index once valid stays valid, so
/// already-applied samples never retroactively invalidate.
#[derive(Debug, Default)]
pub struct FrameSet {
    names: RwLock<Vec<String>>,
}

impl FrameSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frames<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: RwLock::new(frames.into_iter().map(Into::into).collect()),
        }
    }

    /// Registers a new frame and returns its index.
    pub fn register(&self, name: impl Into<String>) -> FrameIndex {
        let mut names = self.names.write().unwrap_or_else(PoisonError::into_inner);
        names.push(name.into());
        (names.len() - 1) as FrameIndex
    }

    pub fn contains(&self, index: FrameIndex) -> bool {
        let names = self.names.read().unwrap_or_else(PoisonError::into_inner);
        (index as usize) < names.len()
    }

    pub fn len(&self) -> usize {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// External ownership/control authority for contested entities.
///
/// `controller` returns the session currently recognized as controlling the
/// entity, or `None` for an observation-only (uncontested) entity.
pub trait LockAuthority: Send + Sync {
    fn controller(&self, entity: &EntityId) -> Option<SessionId>;
}

/// Authority that treats every entity as uncontested.
#[derive(Debug, Default)]
pub struct OpenAuthority;

impl LockAuthority for OpenAuthority {
    fn controller(&self, _entity: &EntityId) -> Option<SessionId> {
        None
    }
}

/// Tuning knobs for dispatch and reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Accepted position samples per second per entity; excess is dropped.
    pub position_rate_limit: u32,
    /// Seconds without an accepted sample before a track goes stale.
    pub stale_timeout_secs: u64,
    /// How far past the last sample velocity extrapolation may integrate.
    pub extrapolation_horizon_ms: u64,
    /// Newest-accepted-to-applied gap beyond which the consumer is told to
    /// re-acquire full state instead of animating through the jump.
    pub discontinuity_gap_secs: u64,
    /// Implied-acceleration ceiling (m/s^2) for movement plausibility.
    pub max_acceleration: f64,
    /// Cool-down for duplicate outbound requests of the same logical kind.
    pub suppression_window_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            position_rate_limit: 50,
            stale_timeout_secs: 10,
            extrapolation_horizon_ms: 2_000,
            discontinuity_gap_secs: 15,
            max_acceleration: 500.0,
            suppression_window_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn extrapolation_horizon(&self) -> Duration {
        Duration::from_millis(self.extrapolation_horizon_ms)
    }

    pub fn discontinuity_gap(&self) -> Duration {
        Duration::from_secs(self.discontinuity_gap_secs)
    }

    pub fn suppression_window(&self) -> Duration {
        Duration::from_secs(self.suppression_window_secs)
    }
}

/// Explicit context object handed to the router and the synchronizer.
pub struct SyncContext {
    pub session: SessionId,
    pub frames: FrameSet,
    pub authority: Arc<dyn LockAuthority>,
    pub config: SyncConfig,
}

impl SyncContext {
    pub fn new(session: SessionId, authority: Arc<dyn LockAuthority>, config: SyncConfig) -> Self {
        Self {
            session,
            frames: FrameSet::new(),
            authority,
            config,
        }
    }

    /// Whether a sample from `emitter` may mutate the given entity's track.
    /// Uncontested entities accept any session; contested entities accept the
    /// recognized controller, or the local session while it is establishing
    /// control.
    pub fn may_mutate(&self, entity: &EntityId, emitter: SessionId) -> bool {
        match self.authority.controller(entity) {
            None => true,
            Some(owner) => emitter == owner || emitter == self.session,
        }
    }
}
