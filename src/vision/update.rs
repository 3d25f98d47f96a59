//! Per-tick scheduling: admission queues, budgets, and the frame clock.
//!
//! Admission scans are unbounded - every tick looks at every observer -
//! but actual recompute work is capped by the configured budgets. Under
//! saturation observers wait in FIFO order; latency grows, per-frame cost
//! doesn't.

use serde::{Deserialize, Serialize};

use crate::raycast::RayCaster;

use super::VisionMap;

// =============================================================================
// FRAME CLOCK
// =============================================================================

/// Monotonic simulation clock (in seconds).
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameClock {
    time: f32,
}

impl FrameClock {
    pub fn new() -> Self {
        Self { time: 0.0 }
    }

    /// Current simulation time.
    #[inline]
    pub fn now(&self) -> f32 {
        self.time
    }

    /// Advance time to the given timestamp.
    pub fn advance_to(&mut self, time: f32) {
        debug_assert!(
            time >= self.time,
            "Cannot go backwards in time: {} -> {}",
            self.time,
            time
        );
        self.time = time;
    }

    /// Advance time by a frame delta.
    pub fn advance_by(&mut self, delta: f32) {
        debug_assert!(delta >= 0.0, "Negative frame delta: {}", delta);
        self.time += delta;
    }
}

// =============================================================================
// STATS
// =============================================================================

/// Running counters exposed for dashboards and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionMapStats {
    /// Full PVS recomputes performed.
    pub pvs_updates: u64,
    /// Visibility reverification passes performed.
    pub visibility_updates: u64,
    /// Rays accepted by the caster.
    pub rays_queued: u64,
    /// Ray results applied.
    pub rays_completed: u64,
    /// Rays the caster refused at queue time.
    pub ray_queue_failures: u64,
    /// Visible-flag transitions (each fired one callback pair).
    pub visibility_transitions: u64,
}

// =============================================================================
// PER-TICK UPDATE
// =============================================================================

impl VisionMap {
    /// Drive one simulation tick: admit eligible observers into the two
    /// update pipelines, drain each under its budget, then pump the ray
    /// caster (fill requests about to dispatch, apply finished casts).
    ///
    /// `now` must be monotonic across calls.
    pub fn update(&mut self, caster: &mut impl RayCaster, now: f32) {
        puffin::profile_function!();

        self.admit_observers(now);
        self.drain_pvs_update_queue(caster);
        self.drain_visibility_update_queue(caster, now);
        self.dispatch_ray_requests(caster);
        self.process_ray_completions(caster);
    }

    /// Unbounded admission scan. An observer enters a queue when its
    /// needs-flag is set, it isn't already queued, and its next-allowed
    /// timestamp has passed.
    fn admit_observers(&mut self, now: f32) {
        for (&id, info) in self.observers.iter_mut() {
            if info.needs_pvs_update
                && !info.queued_for_pvs_update
                && now > info.next_pvs_update_time
            {
                info.queued_for_pvs_update = true;
                self.pvs_update_queue.push_back(id);
            }
            if info.needs_visibility_update
                && !info.queued_for_visibility_update
                && now > info.next_visibility_update_time
            {
                info.queued_for_visibility_update = true;
                self.visibility_update_queue.push_back(id);
            }
        }
    }

    fn drain_pvs_update_queue(&mut self, caster: &mut impl RayCaster) {
        let mut processed = 0;
        while processed < self.config.pvs_updates_per_frame {
            let Some(id) = self.pvs_update_queue.pop_front() else {
                break;
            };
            let Some(info) = self.observers.get_mut(&id) else {
                continue;
            };
            info.queued_for_pvs_update = false;
            info.needs_pvs_update = false;
            self.update_pvs(caster, id);
            processed += 1;
        }
    }

    fn drain_visibility_update_queue(&mut self, caster: &mut impl RayCaster, now: f32) {
        let mut processed = 0;
        while processed < self.config.visibility_updates_per_frame {
            let Some(id) = self.visibility_update_queue.pop_front() else {
                break;
            };
            let Some(info) = self.observers.get_mut(&id) else {
                continue;
            };
            info.queued_for_visibility_update = false;
            info.needs_visibility_update = false;
            self.update_visibility_status(caster, id);
            // The per-observer throttle between reverifications.
            if let Some(info) = self.observers.get_mut(&id) {
                info.next_visibility_update_time = now + info.params.update_period;
            }
            processed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use glam::Vec3;
    use smallvec::smallvec;

    use super::super::{VisionMap, VisionMapConfig};
    use super::FrameClock;
    use crate::params::{
        EntityId, ObservableChangeHint, ObservableId, ObservableParams, ObserverChangeHint,
        ObserverId, ObserverParams, VisibilityChange, VisionCallback,
    };
    use crate::raycast::{RayCastRequest, RayCastResult, RayQueue};

    type Log = Rc<RefCell<Vec<VisibilityChange>>>;

    fn recorder() -> (Log, VisionCallback) {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        (log, Box::new(move |event| sink.borrow_mut().push(*event)))
    }

    fn watcher(eye: Vec3) -> ObserverParams {
        ObserverParams {
            eye_position: eye,
            eye_direction: Vec3::Y,
            sight_range: 10.0,
            fov_cos: 0.0,
            types_to_observe: !0,
            factions_to_observe: !0,
            ..Default::default()
        }
    }

    fn target(position: Vec3) -> ObservableParams {
        ObservableParams {
            positions: smallvec![position],
            type_mask: 1,
            faction: 0,
            ..Default::default()
        }
    }

    /// Run an update, answer every dispatched ray with `resolve`, then
    /// run another update so completions are applied.
    fn pump<F>(map: &mut VisionMap, rays: &mut RayQueue, clock: &mut f32, mut resolve: F)
    where
        F: FnMut(&RayCastRequest) -> RayCastResult,
    {
        *clock += 0.1;
        map.update(rays, *clock);
        rays.resolve_in_flight(&mut resolve);
        *clock += 0.1;
        map.update(rays, *clock);
    }

    fn setup() -> (VisionMap, RayQueue, f32) {
        (VisionMap::new(VisionMapConfig::default()), RayQueue::new(256), 0.0)
    }

    #[test]
    fn test_eager_bootstrap_then_first_pass_fires_one_callback_pair() {
        let (mut map, mut rays, mut clock) = setup();
        let (observer_log, observer_callback) = recorder();
        let (observable_log, observable_callback) = recorder();

        let o1 = map.create_observer_id();
        let b1 = map.create_observable_id();
        let mut params = watcher(Vec3::ZERO);
        params.callback = Some(observer_callback);
        map.register_observer(o1, params);

        let mut params = target(Vec3::new(0.0, 5.0, 0.0));
        params.callback = Some(observable_callback);
        map.register_observable(b1, params);

        // The entry exists immediately, before any update ran.
        assert_eq!(map.pvs_size(o1), 1);
        assert!(!map.is_visible(o1, b1));
        assert!(observer_log.borrow().is_empty());

        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());

        assert!(map.is_visible(o1, b1));
        let events = observer_log.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].observer, o1);
        assert_eq!(events[0].observable, b1);
        assert!(events[0].visible);
        assert_eq!(observable_log.borrow().len(), 1);
    }

    #[test]
    fn test_self_observation_is_never_added() {
        let (mut map, mut rays, mut clock) = setup();
        let o1 = map.create_observer_id();
        let b1 = map.create_observable_id();

        let mut params = watcher(Vec3::ZERO);
        params.entity_id = EntityId(42);
        map.register_observer(o1, params);

        let mut params = target(Vec3::new(0.0, 2.0, 0.0));
        params.entity_id = EntityId(42);
        map.register_observable(b1, params);

        assert_eq!(map.pvs_size(o1), 0);
        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());
        assert_eq!(map.pvs_size(o1), 0, "full recompute must not add it either");
    }

    #[test]
    fn test_redundant_completions_fire_no_callbacks() {
        let (mut map, mut rays, mut clock) = setup();
        let (log, callback) = recorder();

        let o1 = map.create_observer_id();
        let b1 = map.create_observable_id();
        let mut params = watcher(Vec3::ZERO);
        params.callback = Some(callback);
        map.register_observer(o1, params);
        map.register_observable(b1, target(Vec3::new(0.0, 5.0, 0.0)));

        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());
        assert_eq!(log.borrow().len(), 1);

        // Nudge the observable so the entry reverifies; the result is the
        // same, so no new callback may fire.
        map.observable_changed(
            &mut rays,
            b1,
            target(Vec3::new(0.0, 6.0, 0.0)),
            ObservableChangeHint::POSITIONS,
        );
        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());
        assert!(map.is_visible(o1, b1));
        assert_eq!(log.borrow().len(), 1, "same truth, no transition");

        // Now occlude: exactly one more callback, with visible = false.
        map.observable_changed(
            &mut rays,
            b1,
            target(Vec3::new(0.0, 7.0, 0.0)),
            ObservableChangeHint::POSITIONS,
        );
        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::hit_at(1.0));
        assert!(!map.is_visible(o1, b1));
        let events = log.borrow();
        assert_eq!(events.len(), 2);
        assert!(!events[1].visible);
    }

    #[test]
    fn test_multi_position_fallback_needs_two_rays() {
        let (mut map, mut rays, mut clock) = setup();
        let (log, callback) = recorder();

        let o1 = map.create_observer_id();
        let b1 = map.create_observable_id();
        let mut params = watcher(Vec3::ZERO);
        params.callback = Some(callback);
        map.register_observer(o1, params);

        let head = Vec3::new(0.0, 5.0, 2.0);
        let feet = Vec3::new(0.0, 5.0, 0.0);
        map.register_observable(
            b1,
            ObservableParams {
                positions: smallvec![head, feet],
                type_mask: 1,
                ..Default::default()
            },
        );

        // First candidate position is occluded, the second is clear. The
        // retry dispatches on the tick after the first completion.
        let resolve = |request: &RayCastRequest| {
            if request.direction == head - Vec3::ZERO {
                RayCastResult::hit_at(2.0)
            } else {
                RayCastResult::clear()
            }
        };
        pump(&mut map, &mut rays, &mut clock, resolve);
        pump(&mut map, &mut rays, &mut clock, resolve);

        assert!(map.is_visible(o1, b1));
        assert_eq!(map.stats().rays_completed, 2);
        assert_eq!(log.borrow().len(), 1);
        let entry = &map.observers[&o1].pvs[&b1];
        assert_eq!(entry.test_position_index, 0, "index resets once settled");
        assert!(entry.pending_ray.is_none());
    }

    #[test]
    fn test_pvs_budget_processes_exactly_k_per_tick() {
        let config = VisionMapConfig {
            pvs_updates_per_frame: 2,
            visibility_updates_per_frame: 2,
            ..Default::default()
        };
        let mut map = VisionMap::new(config);
        let mut rays = RayQueue::new(256);

        let ids: Vec<ObserverId> = (0..5)
            .map(|_| {
                let id = map.create_observer_id();
                map.register_observer(id, watcher(Vec3::ZERO));
                id
            })
            .collect();

        map.update(&mut rays, 0.1);
        assert_eq!(map.stats().pvs_updates, 2);
        assert_eq!(map.stats().visibility_updates, 2);
        let dirty = ids
            .iter()
            .filter(|id| map.observers[*id].needs_pvs_update)
            .count();
        assert_eq!(dirty, 3);

        map.update(&mut rays, 0.2);
        assert_eq!(map.stats().pvs_updates, 4);

        map.update(&mut rays, 0.3);
        assert_eq!(map.stats().pvs_updates, 5, "queue drains, budget unused");
    }

    #[test]
    fn test_unregister_observable_cleans_up_everywhere() {
        let (mut map, mut rays, mut clock) = setup();
        let (observer_log, observer_callback) = recorder();
        let (observable_log, observable_callback) = recorder();

        let o1 = map.create_observer_id();
        let o2 = map.create_observer_id();
        let b1 = map.create_observable_id();

        let mut params = watcher(Vec3::ZERO);
        params.callback = Some(observer_callback);
        map.register_observer(o1, params);
        map.register_observer(o2, watcher(Vec3::new(3.0, 0.0, 0.0)));

        let mut params = target(Vec3::new(0.0, 5.0, 0.0));
        params.callback = Some(observable_callback);
        map.register_observable(b1, params);

        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());
        assert!(map.is_visible(o1, b1));
        assert!(map.is_visible(o2, b1));
        let seen_before = observer_log.borrow().len();

        map.unregister_observable(&mut rays, b1);

        assert_eq!(map.pvs_size(o1), 0);
        assert_eq!(map.pvs_size(o2), 0);
        assert_eq!(map.observable_count(), 0);
        assert!(map.grid.is_empty());
        assert!(map.pending_rays.is_empty());

        // o1's callback fired once with visible = false; the observable
        // callback fired once per observer that saw it.
        let events = observer_log.borrow();
        assert_eq!(events.len(), seen_before + 1);
        assert!(!events[seen_before].visible);
        assert_eq!(observable_log.borrow().iter().filter(|e| !e.visible).count(), 2);
    }

    #[test]
    fn test_unregister_observer_cancels_pending_rays() {
        let (mut map, mut rays, mut clock) = setup();
        let o1 = map.create_observer_id();
        let b1 = map.create_observable_id();
        map.register_observer(o1, watcher(Vec3::ZERO));
        map.register_observable(b1, target(Vec3::new(0.0, 5.0, 0.0)));

        // Queue and dispatch, but never resolve.
        clock += 0.1;
        map.update(&mut rays, clock);
        assert_eq!(map.pending_rays.len(), 1);

        map.unregister_observer(&mut rays, o1);
        assert!(map.pending_rays.is_empty());
        assert_eq!(map.observer_count(), 0);

        // The canceled cast never completes.
        rays.resolve_in_flight(|_| RayCastResult::clear());
        clock += 0.1;
        map.update(&mut rays, clock);
        assert_eq!(map.stats().rays_completed, 0);
    }

    #[test]
    fn test_update_period_throttles_reverification() {
        let (mut map, mut rays, _clock) = setup();
        let o1 = map.create_observer_id();
        let b1 = map.create_observable_id();
        let mut params = watcher(Vec3::ZERO);
        params.update_period = 10.0;
        map.register_observer(o1, params);
        map.register_observable(b1, target(Vec3::new(0.0, 5.0, 0.0)));

        map.update(&mut rays, 1.0);
        assert_eq!(map.stats().visibility_updates, 1);

        // Dirty again: blocked until the period elapses.
        map.observable_changed(
            &mut rays,
            b1,
            target(Vec3::new(0.0, 6.0, 0.0)),
            ObservableChangeHint::POSITIONS,
        );
        map.update(&mut rays, 2.0);
        assert_eq!(map.stats().visibility_updates, 1);

        map.update(&mut rays, 11.5);
        assert_eq!(map.stats().visibility_updates, 2);
    }

    #[test]
    fn test_observer_position_jitter_is_suppressed() {
        let (mut map, mut rays, mut clock) = setup();
        let o1 = map.create_observer_id();
        let b1 = map.create_observable_id();
        map.register_observer(o1, watcher(Vec3::ZERO));
        map.register_observable(b1, target(Vec3::new(0.0, 5.0, 0.0)));
        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());
        assert!(!map.observers[&o1].needs_pvs_update);

        let mut params = watcher(Vec3::new(0.001, 0.0, 0.0));
        params.update_period = 0.0;
        map.observer_changed(o1, params, ObserverChangeHint::POSITION);
        assert!(!map.observers[&o1].needs_pvs_update, "sub-epsilon jitter ignored");
        assert_eq!(map.observers[&o1].params.eye_position, Vec3::ZERO);

        map.observer_changed(o1, watcher(Vec3::new(1.0, 0.0, 0.0)), ObserverChangeHint::POSITION);
        assert!(map.observers[&o1].needs_pvs_update);
        assert!(map.observers[&o1].update_all_visibility);
    }

    #[test]
    fn test_observable_moving_out_of_range_drops_entry_with_callback() {
        let (mut map, mut rays, mut clock) = setup();
        let (log, callback) = recorder();
        let o1 = map.create_observer_id();
        let b1 = map.create_observable_id();
        let mut params = watcher(Vec3::ZERO);
        params.callback = Some(callback);
        map.register_observer(o1, params);
        map.register_observable(b1, target(Vec3::new(0.0, 5.0, 0.0)));

        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());
        assert!(map.is_visible(o1, b1));

        // The incremental path erases the entry and fires the false
        // transition without waiting for a full PVS recompute.
        map.observable_changed(
            &mut rays,
            b1,
            target(Vec3::new(0.0, 50.0, 0.0)),
            ObservableChangeHint::POSITIONS,
        );
        assert_eq!(map.pvs_size(o1), 0);
        let events = log.borrow();
        assert_eq!(events.len(), 2);
        assert!(!events[1].visible);
    }

    #[test]
    fn test_observable_moving_into_view_is_added_incrementally() {
        let (mut map, mut rays, mut clock) = setup();
        let o1 = map.create_observer_id();
        let b1 = map.create_observable_id();
        map.register_observer(o1, watcher(Vec3::ZERO));
        map.register_observable(b1, target(Vec3::new(0.0, 50.0, 0.0)));
        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());
        assert_eq!(map.pvs_size(o1), 0);

        map.observable_changed(
            &mut rays,
            b1,
            target(Vec3::new(0.0, 5.0, 0.0)),
            ObservableChangeHint::POSITIONS,
        );
        assert_eq!(map.pvs_size(o1), 1, "added without a full recompute");
        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());
        assert!(map.is_visible(o1, b1));
    }

    #[test]
    fn test_unlimited_range_scans_whole_registry() {
        let (mut map, mut rays, mut clock) = setup();
        let o1 = map.create_observer_id();
        let mut params = watcher(Vec3::ZERO);
        params.sight_range = 0.0;
        params.fov_cos = -1.0;
        map.register_observer(o1, params);

        for i in 0..4 {
            let id = map.create_observable_id();
            map.register_observable(id, target(Vec3::new(0.0, 1000.0 * (i + 1) as f32, 0.0)));
        }
        pump(&mut map, &mut rays, &mut clock, |_| RayCastResult::clear());
        assert_eq!(map.pvs_size(o1), 4);

        let visible: Vec<ObservableId> = map.visible_observables(o1).collect();
        assert_eq!(visible.len(), 4);
    }

    #[test]
    fn test_frame_clock_is_monotonic() {
        let mut clock = FrameClock::new();
        clock.advance_by(0.25);
        clock.advance_to(1.0);
        assert!((clock.now() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = VisionMapConfig {
            grid_cell_size: 4.0,
            pvs_updates_per_frame: 7,
            visibility_updates_per_frame: 13,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let restored: VisionMapConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.pvs_updates_per_frame, 7);
        assert_eq!(restored.visibility_updates_per_frame, 13);
        assert!((restored.grid_cell_size - 4.0).abs() < f32::EPSILON);
    }
}
