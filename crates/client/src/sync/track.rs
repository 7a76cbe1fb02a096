//! Per-entity reconciliation state.

use std::collections::BTreeMap;
use std::time::Instant;

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};

use orbitlink_shared::session::SessionId;

use crate::context::{FrameIndex, SyncConfig};

use super::EntityId;

const MICROS_PER_SEC: f64 = 1_000_000.0;

/// One network position update for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSample {
    pub entity: EntityId,
    /// UTC microseconds as stamped by the emitter.
    pub timestamp: i64,
    pub position: DVec3,
    pub rotation: DQuat,
    pub linear_velocity: DVec3,
    pub angular_velocity: DVec3,
    pub reference_frame: FrameIndex,
    pub emitted_by: SessionId,
    /// Authoritative full-state update: resets the track instead of queueing.
    pub force_update: bool,
}

/// Pose resolved for one logical instant, consumed by the render side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: DVec3,
    pub rotation: DQuat,
    pub linear_velocity: DVec3,
    pub angular_velocity: DVec3,
    pub reference_frame: FrameIndex,
    pub timestamp: i64,
}

impl Pose {
    fn from_sample(sample: &PositionSample) -> Self {
        Self {
            position: sample.position,
            rotation: sample.rotation,
            linear_velocity: sample.linear_velocity,
            angular_velocity: sample.angular_velocity,
            reference_frame: sample.reference_frame,
            timestamp: sample.timestamp,
        }
    }
}

/// Lifecycle phase of a track. A track only exists once a first valid sample
/// arrived, so there is no explicit uninitialized phase here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPhase {
    Tracking,
    Stale,
}

/// Why a sample was not taken into a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Queued,
    Applied,
    StaleOnArrival,
    RateLimited,
}

/// Reconciliation state for a single entity.
///
/// Mutated from the network thread (insertion) and consumed from the
/// simulation thread (advance), externally synchronized per entity by the
/// synchronizer's registry.
#[derive(Debug)]
pub struct EntityTrack {
    current: PositionSample,
    pending: BTreeMap<i64, PositionSample>,
    last_accepted: Instant,
    window_start: Instant,
    accepted_in_window: u32,
    newest_accepted: i64,
    phase: TrackPhase,
    hard_reload: bool,
}

impl EntityTrack {
    /// First valid sample: becomes the applied pose directly.
    pub fn new(sample: PositionSample) -> Self {
        let now = Instant::now();
        Self {
            newest_accepted: sample.timestamp,
            current: sample,
            pending: BTreeMap::new(),
            last_accepted: now,
            window_start: now,
            accepted_in_window: 1,
            phase: TrackPhase::Tracking,
            hard_reload: false,
        }
    }

    pub fn phase(&self) -> TrackPhase {
        self.phase
    }

    pub fn current(&self) -> &PositionSample {
        &self.current
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True while the newest accepted sample is implausibly far ahead of the
    /// applied pose. Cleared by the force update that answers it.
    pub fn needs_hard_reload(&self) -> bool {
        self.hard_reload
    }

    /// Duration since the last accepted sample.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_accepted.elapsed()
    }

    /// True when the given emitter's session stamped the applied pose.
    pub fn applied_by(&self, session: SessionId) -> bool {
        self.current.emitted_by == session
    }

    /// Counts the sample against the per-second rate window. Force updates
    /// are always admitted.
    fn admit_rate(&mut self, now: Instant, config: &SyncConfig, force: bool) -> bool {
        if now.duration_since(self.window_start).as_secs_f64() >= 1.0 {
            self.window_start = now;
            self.accepted_in_window = 0;
        }
        if !force && self.accepted_in_window >= config.position_rate_limit {
            return false;
        }
        self.accepted_in_window += 1;
        true
    }

    /// Acceleration the sample implies relative to the applied pose, in m/s^2.
    /// Used by the synchronizer's plausibility check.
    pub fn implied_acceleration(&self, sample: &PositionSample) -> f64 {
        let dt = (sample.timestamp - self.current.timestamp) as f64 / MICROS_PER_SEC;
        let dt = dt.max(0.001);
        let implied_velocity = (sample.position - self.current.position) / dt;
        (implied_velocity - self.current.linear_velocity).length() / dt
    }

    /// Inserts one pre-validated sample. Timestamp ordering and the
    /// stale-on-arrival rule are enforced here so the queue invariant never
    /// depends on the caller.
    pub fn insert(&mut self, sample: PositionSample, config: &SyncConfig) -> InsertOutcome {
        let now = Instant::now();

        if sample.force_update {
            // Authoritative full state restarts the track as if first seen.
            self.pending.clear();
            self.newest_accepted = sample.timestamp;
            self.current = sample;
            self.last_accepted = now;
            self.window_start = now;
            self.accepted_in_window = 1;
            self.phase = TrackPhase::Tracking;
            self.hard_reload = false;
            return InsertOutcome::Applied;
        }

        if self.phase == TrackPhase::Stale {
            // A stale track holds its pose until a force update restarts it.
            return InsertOutcome::StaleOnArrival;
        }

        if sample.timestamp <= self.current.timestamp {
            return InsertOutcome::StaleOnArrival;
        }

        if !self.admit_rate(now, config, false) {
            return InsertOutcome::RateLimited;
        }

        self.last_accepted = now;
        self.newest_accepted = self.newest_accepted.max(sample.timestamp);
        self.pending.insert(sample.timestamp, sample);

        let gap_micros = self.newest_accepted - self.current.timestamp;
        if gap_micros as f64 / MICROS_PER_SEC > config.discontinuity_gap().as_secs_f64() {
            self.hard_reload = true;
        }

        InsertOutcome::Queued
    }

    /// Per-tick advance at logical time `now_micros`. Pops every due sample;
    /// the last one popped becomes the applied pose (direct snap).
    pub fn advance(&mut self, now_micros: i64, config: &SyncConfig) {
        if self.idle_for() > config.stale_timeout() {
            self.phase = TrackPhase::Stale;
        }
        if self.phase == TrackPhase::Stale || self.hard_reload {
            return;
        }

        while let Some((&ts, _)) = self.pending.first_key_value() {
            if ts > now_micros {
                break;
            }
            if let Some(sample) = self.pending.remove(&ts) {
                self.current = sample;
            }
        }
    }

    /// Resolves the pose for logical time `now_micros`.
    ///
    /// With a pending sample ahead of `now`, the pose is interpolated between
    /// the applied sample and that next one. With an empty queue the pose is
    /// extrapolated along the applied linear velocity, capped at the
    /// configured horizon. Stale or reload-pending tracks hold.
    pub fn pose_at(&self, now_micros: i64, config: &SyncConfig) -> Pose {
        if self.phase == TrackPhase::Stale || self.hard_reload {
            return Pose::from_sample(&self.current);
        }

        if let Some((&next_ts, next)) = self.pending.first_key_value() {
            let span = (next_ts - self.current.timestamp) as f64;
            if span <= 0.0 {
                return Pose::from_sample(&self.current);
            }
            let alpha = ((now_micros - self.current.timestamp) as f64 / span).clamp(0.0, 1.0);
            return Pose {
                position: self.current.position.lerp(next.position, alpha),
                rotation: self.current.rotation.slerp(next.rotation, alpha),
                linear_velocity: self
                    .current
                    .linear_velocity
                    .lerp(next.linear_velocity, alpha),
                angular_velocity: self
                    .current
                    .angular_velocity
                    .lerp(next.angular_velocity, alpha),
                reference_frame: self.current.reference_frame,
                timestamp: now_micros,
            };
        }

        let dt = (now_micros - self.current.timestamp) as f64 / MICROS_PER_SEC;
        if dt <= 0.0 {
            return Pose::from_sample(&self.current);
        }
        let horizon = config.extrapolation_horizon().as_secs_f64();
        let dt = dt.min(horizon);
        Pose {
            position: self.current.position + self.current.linear_velocity * dt,
            rotation: self.current.rotation,
            linear_velocity: self.current.linear_velocity,
            angular_velocity: self.current.angular_velocity,
            reference_frame: self.current.reference_frame,
            timestamp: now_micros,
        }
    }

    /// Queue invariant check used by tests.
    #[cfg(test)]
    pub fn queue_is_ordered_after_current(&self) -> bool {
        let mut previous = self.current.timestamp;
        for &ts in self.pending.keys() {
            if ts <= previous {
                return false;
            }
            previous = ts;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts_micros: i64, x: f64, vx: f64) -> PositionSample {
        PositionSample {
            entity: EntityId::new(),
            timestamp: ts_micros,
            position: DVec3::new(x, 0.0, 0.0),
            rotation: DQuat::IDENTITY,
            linear_velocity: DVec3::new(vx, 0.0, 0.0),
            angular_velocity: DVec3::ZERO,
            reference_frame: 0,
            emitted_by: SessionId::new(),
            force_update: false,
        }
    }

    const SEC: i64 = 1_000_000;

    #[test]
    fn arbitrary_arrival_order_keeps_the_queue_ascending() {
        let config = SyncConfig::default();
        let mut track = EntityTrack::new(sample(0, 0.0, 0.0));

        for ts in [5, 2, 9, 1, 7, 3, 2] {
            track.insert(sample(ts * SEC, ts as f64, 1.0), &config);
        }
        assert!(track.queue_is_ordered_after_current());

        // Older-than-applied never enters.
        track.advance(6 * SEC, &config);
        let outcome = track.insert(sample(4 * SEC, 4.0, 1.0), &config);
        assert_eq!(outcome, InsertOutcome::StaleOnArrival);
        assert!(track.queue_is_ordered_after_current());
    }

    #[test]
    fn rate_limit_drops_the_excess() {
        let config = SyncConfig::default();
        let mut track = EntityTrack::new(sample(0, 0.0, 0.0));

        let mut accepted = 1; // the creating sample counts
        for i in 1..=1000 {
            let outcome = track.insert(sample(i * 1_000, i as f64, 1.0), &config);
            if outcome == InsertOutcome::Queued {
                accepted += 1;
            }
        }
        assert!(accepted <= config.position_rate_limit);
    }

    #[test]
    fn interpolates_between_applied_and_next_pending() {
        let config = SyncConfig::default();
        let mut track = EntityTrack::new(sample(0, 0.0, 1.0));
        track.insert(sample(SEC, 1.0, 1.0), &config);

        let pose = track.pose_at(SEC / 2, &config);
        assert!(pose.position.x > 0.0 && pose.position.x < 1.0);
    }

    #[test]
    fn extrapolation_integrates_then_holds_at_the_horizon() {
        let config = SyncConfig::default();
        let track = EntityTrack::new(sample(5 * SEC, 5.0, 1.0));

        let within = track.pose_at(5 * SEC + SEC, &config);
        assert!((within.position.x - 6.0).abs() < 1e-9);

        let horizon = config.extrapolation_horizon().as_secs_f64();
        let far = track.pose_at(5 * SEC + 60 * SEC, &config);
        assert!((far.position.x - (5.0 + horizon)).abs() < 1e-9);
    }

    #[test]
    fn discontinuity_latches_hard_reload_until_force_update() {
        let config = SyncConfig::default();
        let mut track = EntityTrack::new(sample(0, 0.0, 0.0));

        let far_future = (config.discontinuity_gap_secs as i64 + 5) * SEC;
        track.insert(sample(far_future, 100.0, 0.0), &config);
        assert!(track.needs_hard_reload());

        // Holds instead of animating through the jump.
        track.advance(far_future, &config);
        assert_eq!(track.current().timestamp, 0);

        let mut reset = sample(far_future, 100.0, 0.0);
        reset.force_update = true;
        track.insert(reset, &config);
        assert!(!track.needs_hard_reload());
        assert_eq!(track.current().timestamp, far_future);
    }

    #[test]
    fn implied_acceleration_flags_teleports() {
        let jump = sample(SEC, 1_000_000.0, 0.0);
        let track = EntityTrack::new(sample(0, 0.0, 0.0));
        assert!(track.implied_acceleration(&jump) > SyncConfig::default().max_acceleration);

        let plausible = sample(SEC, 1.0, 1.0);
        assert!(track.implied_acceleration(&plausible) < SyncConfig::default().max_acceleration);
    }
}
