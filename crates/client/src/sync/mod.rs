//! Position synchronizer.
//!
//! Turns lossy, out-of-order, rate-limited network samples into a smooth,
//! ownership-respecting pose per entity. Samples are validated before they
//! ever reach a track (invalid input never mutates reconciliation state),
//! inserted from the network thread, and consumed by the simulation thread's
//! per-tick advance.

mod track;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::SyncContext;

pub use track::{EntityTrack, InsertOutcome, Pose, PositionSample, TrackPhase};

/// External identifier of a tracked entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0.as_simple())
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

type TrackRegistry = RwLock<HashMap<EntityId, Arc<Mutex<EntityTrack>>>>;

/// Registry of per-entity tracks.
///
/// Concurrency discipline: the outer `RwLock` only guards track creation and
/// removal; each track sits behind its own `Mutex`, giving linearizable
/// updates per entity. The network thread inserts, the simulation thread
/// advances, and neither holds the outer lock while working on a track.
pub struct PositionSynchronizer {
    context: Arc<SyncContext>,
    tracks: TrackRegistry,
}

impl PositionSynchronizer {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self {
            context,
            tracks: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    fn track(&self, entity: &EntityId) -> Option<Arc<Mutex<EntityTrack>>> {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .cloned()
    }

    /// Feeds one inbound sample. Returns `true` if it was accepted into a
    /// track. Every rejection is logged and dropped; none is fatal.
    pub fn ingest(&self, sample: PositionSample) -> bool {
        if !self.context.frames.contains(sample.reference_frame) {
            warn!(
                entity = %sample.entity,
                frame = sample.reference_frame,
                "position sample rejected: unknown reference frame"
            );
            return false;
        }

        if !self.context.may_mutate(&sample.entity, sample.emitted_by) {
            debug!(
                entity = %sample.entity,
                emitter = %sample.emitted_by,
                "position sample rejected: not the controlling session"
            );
            return false;
        }

        let entity = sample.entity;
        if let Some(track) = self.track(&entity) {
            let mut track = track.lock().unwrap_or_else(PoisonError::into_inner);

            if !sample.force_update
                && track.implied_acceleration(&sample) > self.context.config.max_acceleration
            {
                warn!(
                    entity = %entity,
                    emitter = %sample.emitted_by,
                    "position sample rejected: implausible acceleration"
                );
                return false;
            }

            match track.insert(sample, &self.context.config) {
                InsertOutcome::Queued | InsertOutcome::Applied => true,
                InsertOutcome::StaleOnArrival => false,
                InsertOutcome::RateLimited => {
                    debug!(entity = %entity, "position sample dropped: rate budget exceeded");
                    false
                }
            }
        } else {
            // First valid sample for this entity creates the track and is
            // applied directly.
            let track = Arc::new(Mutex::new(EntityTrack::new(sample)));
            self.tracks
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(entity, track);
            debug!(entity = %entity, "tracking new entity");
            true
        }
    }

    /// Advances every track to logical time `now_micros`. Called once per
    /// simulation tick.
    pub fn advance(&self, now_micros: i64) {
        let tracks: Vec<_> = self
            .tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for track in tracks {
            track
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .advance(now_micros, &self.context.config);
        }
    }

    /// Resolved pose for one entity at logical time `now_micros`.
    pub fn pose(&self, entity: &EntityId, now_micros: i64) -> Option<Pose> {
        let track = self.track(entity)?;
        let track = track.lock().unwrap_or_else(PoisonError::into_inner);
        Some(track.pose_at(now_micros, &self.context.config))
    }

    pub fn phase(&self, entity: &EntityId) -> Option<TrackPhase> {
        let track = self.track(entity)?;
        let phase = track.lock().unwrap_or_else(PoisonError::into_inner).phase();
        Some(phase)
    }

    /// Whether the consumer should re-acquire full state for this entity
    /// instead of animating through an implausible jump. Cleared by the force
    /// update that answers it.
    pub fn needs_hard_reload(&self, entity: &EntityId) -> bool {
        self.track(entity)
            .map(|track| {
                track
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .needs_hard_reload()
            })
            .unwrap_or(false)
    }

    /// Drops the track for an explicitly removed entity.
    pub fn remove(&self, entity: &EntityId) -> bool {
        self.tracks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entity)
            .is_some()
    }

    /// Drops every track that has been stale for longer than `grace` on top
    /// of the stale timeout. Stale tracks inside the grace window keep their
    /// held pose so a force update can restart them.
    pub fn prune_stale(&self, grace: std::time::Duration) -> usize {
        let cutoff = self.context.config.stale_timeout() + grace;
        let mut tracks = self.tracks.write().unwrap_or_else(PoisonError::into_inner);
        let before = tracks.len();
        tracks.retain(|entity, track| {
            let keep = track
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .idle_for()
                <= cutoff;
            if !keep {
                debug!(entity = %entity, "pruning stale track");
            }
            keep
        });
        before - tracks.len()
    }

    pub fn tracked(&self) -> usize {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FrameSet, OpenAuthority, SyncConfig, SyncContext};
    use glam::{DQuat, DVec3};
    use orbitlink_shared::session::SessionId;

    const SEC: i64 = 1_000_000;

    fn context() -> Arc<SyncContext> {
        let mut ctx = SyncContext::new(
            SessionId::new(),
            Arc::new(OpenAuthority),
            SyncConfig::default(),
        );
        ctx.frames = FrameSet::with_frames(["Kerbin"]);
        Arc::new(ctx)
    }

    fn sample(entity: EntityId, ts: i64, x: f64) -> PositionSample {
        PositionSample {
            entity,
            timestamp: ts,
            position: DVec3::new(x, 0.0, 0.0),
            rotation: DQuat::IDENTITY,
            linear_velocity: DVec3::new(1.0, 0.0, 0.0),
            angular_velocity: DVec3::ZERO,
            reference_frame: 0,
            emitted_by: SessionId::new(),
            force_update: false,
        }
    }

    #[test]
    fn unknown_reference_frame_never_creates_a_track() {
        let sync = PositionSynchronizer::new(context());
        let entity = EntityId::new();

        let mut bad = sample(entity, 0, 0.0);
        bad.reference_frame = 7;
        assert!(!sync.ingest(bad));
        assert_eq!(sync.tracked(), 0);
        assert!(sync.pose(&entity, 0).is_none());
    }

    #[test]
    fn implausible_samples_leave_the_track_unchanged() {
        let sync = PositionSynchronizer::new(context());
        let entity = EntityId::new();
        assert!(sync.ingest(sample(entity, 0, 0.0)));

        assert!(!sync.ingest(sample(entity, SEC, 1_000_000.0)));
        let pose = sync.pose(&entity, 0).unwrap();
        assert_eq!(pose.position.x, 0.0);
    }

    #[test]
    fn prune_drops_tracks_stale_beyond_the_grace_window() {
        let mut config = SyncConfig::default();
        config.stale_timeout_secs = 0;
        let mut ctx = SyncContext::new(SessionId::new(), Arc::new(OpenAuthority), config);
        ctx.frames = FrameSet::with_frames(["Kerbin"]);
        let sync = PositionSynchronizer::new(Arc::new(ctx));

        let entity = EntityId::new();
        assert!(sync.ingest(sample(entity, 0, 0.0)));
        std::thread::sleep(std::time::Duration::from_millis(20));

        // Stale, but inside the grace window: the held pose survives so a
        // force update can still restart the track.
        assert_eq!(sync.prune_stale(std::time::Duration::from_secs(60)), 0);
        assert_eq!(sync.tracked(), 1);

        assert_eq!(sync.prune_stale(std::time::Duration::ZERO), 1);
        assert_eq!(sync.tracked(), 0);
        assert!(sync.pose(&entity, 0).is_none());
    }

    #[test]
    fn explicit_remove_drops_the_track() {
        let sync = PositionSynchronizer::new(context());
        let entity = EntityId::new();
        assert!(sync.ingest(sample(entity, 0, 0.0)));
        assert!(sync.remove(&entity));
        assert!(!sync.remove(&entity));
        assert_eq!(sync.tracked(), 0);
    }
}
