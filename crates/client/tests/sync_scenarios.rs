//! End-to-end reconciliation scenarios for the position synchronizer.

use std::sync::Arc;
use std::time::Duration;

use glam::{DQuat, DVec3};
use test_log::test;

use orbitlink_client::context::{FrameSet, LockAuthority, OpenAuthority, SyncConfig, SyncContext};
use orbitlink_client::sync::{EntityId, PositionSample, PositionSynchronizer, TrackPhase};
use orbitlink_shared::session::SessionId;

const SEC: i64 = 1_000_000;

fn context_with(config: SyncConfig, authority: Arc<dyn LockAuthority>) -> Arc<SyncContext> {
    let mut ctx = SyncContext::new(SessionId::new(), authority, config);
    ctx.frames = FrameSet::with_frames(["Kerbin", "Mun"]);
    Arc::new(ctx)
}

fn sample(entity: EntityId, emitter: SessionId, ts: i64, x: f64) -> PositionSample {
    PositionSample {
        entity,
        timestamp: ts,
        position: DVec3::new(x, 0.0, 0.0),
        rotation: DQuat::IDENTITY,
        linear_velocity: DVec3::new(1.0, 0.0, 0.0),
        angular_velocity: DVec3::ZERO,
        reference_frame: 0,
        emitted_by: emitter,
        force_update: false,
    }
}

#[test]
fn interpolates_then_extrapolates_then_holds() {
    let sync = PositionSynchronizer::new(context_with(
        SyncConfig::default(),
        Arc::new(OpenAuthority),
    ));
    let entity = EntityId::new();
    let emitter = SessionId::new();

    // Linearly moving entity sampled at t = 0, 1, 2, 5 seconds.
    for t in [0i64, 1, 2, 5] {
        assert!(sync.ingest(sample(entity, emitter, t * SEC, t as f64)));
    }

    // Between the first two samples the pose is interpolated.
    let mid = sync.pose(&entity, SEC / 2).unwrap();
    assert!(mid.position.x > 0.0 && mid.position.x < 1.0);

    // Advance through every due sample up to t = 5.
    sync.advance(5 * SEC);
    let applied = sync.pose(&entity, 5 * SEC).unwrap();
    assert!((applied.position.x - 5.0).abs() < 1e-9);

    // With the queue drained, the pose extrapolates along the last velocity.
    let one_later = sync.pose(&entity, 6 * SEC).unwrap();
    assert!((one_later.position.x - 6.0).abs() < 1e-9);

    // Beyond the horizon the extrapolation is capped and the pose holds.
    let horizon = SyncConfig::default().extrapolation_horizon().as_secs_f64();
    let far = sync.pose(&entity, 60 * SEC).unwrap();
    let farther = sync.pose(&entity, 120 * SEC).unwrap();
    assert!((far.position.x - (5.0 + horizon)).abs() < 1e-9);
    assert_eq!(far.position, farther.position);
}

#[test]
fn rate_limit_caps_accepted_samples_per_second() {
    let sync = PositionSynchronizer::new(context_with(
        SyncConfig::default(),
        Arc::new(OpenAuthority),
    ));
    let entity = EntityId::new();
    let emitter = SessionId::new();

    let mut accepted = 0;
    for i in 0..1000i64 {
        if sync.ingest(sample(entity, emitter, i * 1_000, i as f64 / 1_000.0)) {
            accepted += 1;
        }
    }
    assert!(accepted <= 50, "accepted {accepted} samples, budget is 50");
    assert!(accepted > 0);
}

struct SingleOwner(SessionId);

impl LockAuthority for SingleOwner {
    fn controller(&self, _entity: &EntityId) -> Option<SessionId> {
        Some(self.0)
    }
}

#[test]
fn contested_entity_only_follows_the_owning_session() {
    let owner = SessionId::new();
    let stranger = SessionId::new();
    let sync = PositionSynchronizer::new(context_with(
        SyncConfig::default(),
        Arc::new(SingleOwner(owner)),
    ));
    let entity = EntityId::new();

    assert!(sync.ingest(sample(entity, owner, 0, 0.0)));
    assert!(sync.ingest(sample(entity, owner, SEC, 1.0)));

    // The stranger's samples are observably dropped: the track is unchanged.
    assert!(!sync.ingest(sample(entity, stranger, 2 * SEC, 500.0)));
    sync.advance(SEC);
    let pose = sync.pose(&entity, SEC).unwrap();
    assert!((pose.position.x - 1.0).abs() < 1e-9);
}

#[test]
fn stale_track_holds_until_a_force_update_restarts_it() {
    let config = SyncConfig {
        stale_timeout_secs: 0,
        ..SyncConfig::default()
    };
    let sync = PositionSynchronizer::new(context_with(config, Arc::new(OpenAuthority)));
    let entity = EntityId::new();
    let emitter = SessionId::new();

    assert!(sync.ingest(sample(entity, emitter, 0, 0.0)));
    std::thread::sleep(Duration::from_millis(20));

    sync.advance(SEC);
    assert_eq!(sync.phase(&entity), Some(TrackPhase::Stale));

    // Regular samples no longer move a stale track.
    assert!(!sync.ingest(sample(entity, emitter, 2 * SEC, 2.0)));
    sync.advance(2 * SEC);
    let held = sync.pose(&entity, 2 * SEC).unwrap();
    assert!((held.position.x - 0.0).abs() < 1e-9);

    // A force update restarts it as if first seen.
    let mut reset = sample(entity, emitter, 3 * SEC, 3.0);
    reset.force_update = true;
    assert!(sync.ingest(reset));
    assert_eq!(sync.phase(&entity), Some(TrackPhase::Tracking));
    let restarted = sync.pose(&entity, 3 * SEC).unwrap();
    assert!((restarted.position.x - 3.0).abs() < 1e-9);
}

#[test]
fn out_of_frame_samples_never_reach_a_track() {
    let sync = PositionSynchronizer::new(context_with(
        SyncConfig::default(),
        Arc::new(OpenAuthority),
    ));
    let entity = EntityId::new();
    let emitter = SessionId::new();

    let mut bad = sample(entity, emitter, 0, 0.0);
    bad.reference_frame = 99;
    assert!(!sync.ingest(bad));
    assert_eq!(sync.tracked(), 0);

    // The frame set may grow; the same index becomes valid afterwards.
    let ctx = context_with(SyncConfig::default(), Arc::new(OpenAuthority));
    for _ in 0..97 {
        ctx.frames.register("body");
    }
    let grown = PositionSynchronizer::new(ctx);
    let mut late = sample(entity, emitter, 0, 0.0);
    late.reference_frame = 99;
    assert!(!grown.ingest(late.clone()));
    grown.context().frames.register("Eeloo");
    assert!(grown.ingest(late));
}
