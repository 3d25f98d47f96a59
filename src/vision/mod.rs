//! Incremental perception map.
//!
//! Tracks observer and observable entities in a 3D world and maintains,
//! per observer, the set of observables it can currently perceive. Set
//! membership (the PVS) comes from spatial queries and filter predicates;
//! the visible/not-visible truth per member comes from budgeted,
//! asynchronous line-of-sight rays.

mod pvs;
mod rays;
mod update;

pub use pvs::should_observe;
pub use update::{FrameClock, VisionMapStats};

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_GRID_CELL_SIZE, DEFAULT_PVS_UPDATES_PER_FRAME, DEFAULT_VISIBILITY_UPDATES_PER_FRAME,
    MAX_OBSERVABLE_POSITIONS, MAX_SKIP_LIST_SIZE, ORIENTATION_CHANGE_EPSILON,
    POSITION_CHANGE_EPSILON,
};
use crate::params::{
    ObservableChangeHint, ObservableId, ObservableParams, ObserverChangeHint, ObserverId,
    ObserverParams, VisibilityChange,
};
use crate::raycast::{QueuedRayId, RayCastPriority, RayCastPriorityTable, RayCaster};
use crate::spatial_grid::SpatialGrid;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Tuning knobs for one vision map instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionMapConfig {
    /// Cell size of the observable spatial grid, in world units.
    pub grid_cell_size: f32,
    /// How many observers get a full PVS recompute per update call.
    pub pvs_updates_per_frame: usize,
    /// How many observers get their visibility reverified per update call.
    pub visibility_updates_per_frame: usize,
    /// Maps (observer, observable) pairs to a ray priority.
    pub priority_table: RayCastPriorityTable,
}

impl Default for VisionMapConfig {
    fn default() -> Self {
        Self {
            grid_cell_size: DEFAULT_GRID_CELL_SIZE,
            pvs_updates_per_frame: DEFAULT_PVS_UPDATES_PER_FRAME,
            visibility_updates_per_frame: DEFAULT_VISIBILITY_UPDATES_PER_FRAME,
            priority_table: RayCastPriorityTable::new(),
        }
    }
}

// =============================================================================
// INTERNAL RECORDS
// =============================================================================

/// Per-(observer, observable) bookkeeping while the pair is a perception
/// candidate.
#[derive(Debug)]
pub(crate) struct PvsEntry {
    /// Outstanding ray handle, `NONE` when no cast is in flight.
    pub(crate) pending_ray: QueuedRayId,
    /// Dispatch priority for this pair's rays.
    pub(crate) priority: RayCastPriority,
    /// Last settled line-of-sight truth.
    pub(crate) visible: bool,
    /// Entry wants a fresh ray on the next visibility pass.
    pub(crate) needs_update: bool,
    /// Which of the observable's candidate positions is being tested.
    /// Returns to 0 once the flag settles.
    pub(crate) test_position_index: usize,
}

impl PvsEntry {
    fn new(priority: RayCastPriority) -> Self {
        Self {
            pending_ray: QueuedRayId::NONE,
            priority,
            visible: false,
            needs_update: true,
            test_position_index: 0,
        }
    }
}

/// Registered observer: owned params, its PVS, and scheduling state.
#[derive(Debug)]
pub(crate) struct ObserverInfo {
    pub(crate) params: ObserverParams,
    pub(crate) pvs: HashMap<ObservableId, PvsEntry>,
    pub(crate) needs_pvs_update: bool,
    pub(crate) needs_visibility_update: bool,
    pub(crate) queued_for_pvs_update: bool,
    pub(crate) queued_for_visibility_update: bool,
    /// Forces every PVS entry through a fresh ray on the next pass.
    pub(crate) update_all_visibility: bool,
    pub(crate) next_pvs_update_time: f32,
    pub(crate) next_visibility_update_time: f32,
}

impl ObserverInfo {
    fn new() -> Self {
        Self {
            params: ObserverParams::default(),
            pvs: HashMap::new(),
            needs_pvs_update: false,
            needs_visibility_update: false,
            queued_for_pvs_update: false,
            queued_for_visibility_update: false,
            update_all_visibility: false,
            next_pvs_update_time: 0.0,
            next_visibility_update_time: 0.0,
        }
    }
}

/// Registered observable. Referenced by id from every PVS that currently
/// includes it.
#[derive(Debug)]
pub(crate) struct ObservableInfo {
    pub(crate) params: ObservableParams,
}

/// Reverse lookup from an outstanding ray to the pair that queued it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingRay {
    pub(crate) observer: ObserverId,
    pub(crate) observable: ObservableId,
}

// =============================================================================
// VISION MAP
// =============================================================================

/// The perception registry and its incremental maintenance machinery.
///
/// Freely multi-instantiable; each map owns its registries, spatial grid,
/// and admission queues. The ray caster is passed to the operations that
/// queue or cancel rays.
pub struct VisionMap {
    pub(crate) config: VisionMapConfig,
    pub(crate) observers: HashMap<ObserverId, ObserverInfo>,
    pub(crate) observables: HashMap<ObservableId, ObservableInfo>,
    pub(crate) grid: SpatialGrid,
    pub(crate) pending_rays: HashMap<QueuedRayId, PendingRay>,
    pub(crate) pvs_update_queue: VecDeque<ObserverId>,
    pub(crate) visibility_update_queue: VecDeque<ObserverId>,
    next_observer_id: u32,
    next_observable_id: u32,
    pub(crate) stats: VisionMapStats,
}

impl VisionMap {
    pub fn new(config: VisionMapConfig) -> Self {
        let grid = SpatialGrid::new(config.grid_cell_size);
        Self {
            config,
            observers: HashMap::new(),
            observables: HashMap::new(),
            grid,
            pending_rays: HashMap::new(),
            pvs_update_queue: VecDeque::new(),
            visibility_update_queue: VecDeque::new(),
            next_observer_id: 0,
            next_observable_id: 0,
            stats: VisionMapStats::default(),
        }
    }

    // -------------------------------------------------------------------------
    // ID MINTING
    // -------------------------------------------------------------------------

    /// Mint a fresh observer id. Never returns the invalid zero id; the
    /// counter skips it on wrap.
    pub fn create_observer_id(&mut self) -> ObserverId {
        self.next_observer_id = self.next_observer_id.wrapping_add(1);
        if self.next_observer_id == 0 {
            self.next_observer_id = 1;
        }
        ObserverId(self.next_observer_id)
    }

    /// Mint a fresh observable id. Never returns the invalid zero id.
    pub fn create_observable_id(&mut self) -> ObservableId {
        self.next_observable_id = self.next_observable_id.wrapping_add(1);
        if self.next_observable_id == 0 {
            self.next_observable_id = 1;
        }
        ObservableId(self.next_observable_id)
    }

    // -------------------------------------------------------------------------
    // OBSERVER REGISTRY
    // -------------------------------------------------------------------------

    /// Register a perceiving entity. No-op on an invalid id. The first
    /// PVS computation and visibility pass run on later `update` calls;
    /// no callback fires here.
    pub fn register_observer(&mut self, id: ObserverId, params: ObserverParams) {
        if !id.is_valid() || self.observers.contains_key(&id) {
            return;
        }
        self.observers.insert(id, ObserverInfo::new());
        self.observer_changed(id, params, ObserverChangeHint::ALL);

        // Adoption is epsilon-gated, so force the initial recompute even
        // when the params happen to equal the defaults.
        if let Some(info) = self.observers.get_mut(&id) {
            info.needs_pvs_update = true;
            info.needs_visibility_update = true;
            info.update_all_visibility = true;
        }
    }

    /// Remove an observer. Cancels every ray its PVS holds and drops it
    /// from the admission queues. Its observables get no "no longer
    /// visible" callbacks - the observer is simply gone.
    pub fn unregister_observer(&mut self, caster: &mut impl RayCaster, id: ObserverId) {
        let Some(info) = self.observers.remove(&id) else {
            return;
        };
        for entry in info.pvs.values() {
            if !entry.pending_ray.is_none() {
                caster.cancel_ray(entry.pending_ray);
                self.pending_rays.remove(&entry.pending_ray);
            }
        }
        self.pvs_update_queue.retain(|&queued| queued != id);
        self.visibility_update_queue.retain(|&queued| queued != id);
    }

    /// Adopt the fields of `new_params` selected by `hint` into a
    /// registered observer. Position and orientation are only adopted
    /// beyond a jitter epsilon. Changes that affect what the observer can
    /// perceive schedule a full PVS and visibility recompute.
    pub fn observer_changed(
        &mut self,
        id: ObserverId,
        new_params: ObserverParams,
        hint: ObserverChangeHint,
    ) {
        let Some(info) = self.observers.get_mut(&id) else {
            return;
        };
        let params = &mut info.params;
        let mut changed = false;

        if hint.contains(ObserverChangeHint::FACTION) && params.faction != new_params.faction {
            params.faction = new_params.faction;
            changed = true;
        }
        if hint.contains(ObserverChangeHint::FACTIONS_TO_OBSERVE) {
            params.factions_to_observe = new_params.factions_to_observe;
        }
        if hint.contains(ObserverChangeHint::TYPES_TO_OBSERVE) {
            params.types_to_observe = new_params.types_to_observe;
        }
        if hint.contains(ObserverChangeHint::SIGHT_RANGE)
            && params.sight_range != new_params.sight_range
        {
            params.sight_range = new_params.sight_range;
            changed = true;
        }
        if hint.contains(ObserverChangeHint::FOV) && params.fov_cos != new_params.fov_cos {
            params.fov_cos = new_params.fov_cos;
            changed = true;
        }
        if hint.contains(ObserverChangeHint::POSITION)
            && params.eye_position.distance_squared(new_params.eye_position)
                > POSITION_CHANGE_EPSILON * POSITION_CHANGE_EPSILON
        {
            params.eye_position = new_params.eye_position;
            changed = true;
        }
        if hint.contains(ObserverChangeHint::ORIENTATION)
            && params.eye_direction.distance_squared(new_params.eye_direction)
                > ORIENTATION_CHANGE_EPSILON * ORIENTATION_CHANGE_EPSILON
        {
            params.eye_direction = new_params.eye_direction;
            changed = true;
        }
        if hint.contains(ObserverChangeHint::SKIP_LIST) {
            params.skip_list = new_params.skip_list;
            params.skip_list.truncate(MAX_SKIP_LIST_SIZE);
        }
        if hint.contains(ObserverChangeHint::CALLBACK) {
            params.callback = new_params.callback;
        }
        if hint.contains(ObserverChangeHint::TYPE_MASK) && params.type_mask != new_params.type_mask
        {
            params.type_mask = new_params.type_mask;
            changed = true;
        }
        if hint.contains(ObserverChangeHint::RAYCAST_FLAGS)
            && params.raycast_flags != new_params.raycast_flags
        {
            params.raycast_flags = new_params.raycast_flags;
            changed = true;
        }
        if hint.contains(ObserverChangeHint::ENTITY_ID) {
            params.entity_id = new_params.entity_id;
        }
        if hint.contains(ObserverChangeHint::UPDATE_PERIOD) {
            params.update_period = new_params.update_period;
        }

        if changed {
            info.needs_pvs_update = true;
            info.needs_visibility_update = true;
            info.update_all_visibility = true;
        }
    }

    // -------------------------------------------------------------------------
    // OBSERVABLE REGISTRY
    // -------------------------------------------------------------------------

    /// Register a perceivable entity. No-op on an invalid id. Scans every
    /// existing observer and eagerly adds PVS entries so a freshly
    /// spawned object participates in perception on the next visibility
    /// pass instead of waiting out a full PVS-update cycle.
    pub fn register_observable(&mut self, id: ObservableId, mut params: ObservableParams) {
        if !id.is_valid() || self.observables.contains_key(&id) {
            return;
        }
        assert!(
            !params.positions.is_empty() && params.positions.len() <= MAX_OBSERVABLE_POSITIONS,
            "observable position count out of range: {}",
            params.positions.len()
        );
        params.skip_list.truncate(MAX_SKIP_LIST_SIZE);

        let canonical = params.canonical_position();
        self.grid.insert(canonical, id);
        self.observables.insert(id, ObservableInfo { params });

        // Eager bootstrap into every qualifying observer's PVS.
        let Some(observable) = self.observables.get(&id) else {
            return;
        };
        let table = &self.config.priority_table;
        for observer in self.observers.values_mut() {
            if is_self_observation(&observer.params, &observable.params) {
                continue;
            }
            if observer.pvs.contains_key(&id) {
                continue;
            }
            if !pvs::should_observe(&observer.params, &observable.params) {
                continue;
            }
            let priority = entry_priority(table, &observer.params, &observable.params);
            observer.pvs.insert(id, PvsEntry::new(priority));
            observer.needs_visibility_update = true;
        }
    }

    /// Remove an observable. Every observer that had it visible gets one
    /// "no longer visible" callback pair; pending rays are canceled, PVS
    /// entries erased, and the grid entry dropped.
    pub fn unregister_observable(&mut self, caster: &mut impl RayCaster, id: ObservableId) {
        let Some(info) = self.observables.remove(&id) else {
            return;
        };
        let observable_entity = info.params.entity_id;
        self.grid.erase(info.params.canonical_position(), id);

        let mut transitions: Vec<VisibilityChange> = Vec::new();
        for (&observer_id, observer) in self.observers.iter_mut() {
            let Some(entry) = observer.pvs.remove(&id) else {
                continue;
            };
            if !entry.pending_ray.is_none() {
                caster.cancel_ray(entry.pending_ray);
                self.pending_rays.remove(&entry.pending_ray);
            }
            observer.needs_pvs_update = true;
            if entry.visible {
                transitions.push(VisibilityChange {
                    observer: observer_id,
                    observer_entity: observer.params.entity_id,
                    observable: id,
                    observable_entity,
                    visible: false,
                });
            }
        }

        // The observable's record is gone; fire its side of each pair
        // from the owned params.
        let mut observable_callback = info.params.callback;
        for event in &transitions {
            if let Some(observer) = self.observers.get_mut(&event.observer) {
                if let Some(callback) = observer.params.callback.as_mut() {
                    callback(event);
                }
            }
            if let Some(callback) = observable_callback.as_mut() {
                callback(event);
            }
            self.stats.visibility_transitions += 1;
        }
    }

    /// Adopt the fields of `new_params` selected by `hint` into a
    /// registered observable, then incrementally patch every observer's
    /// PVS - the fast path that spares a full recompute for routine
    /// per-frame position updates.
    pub fn observable_changed(
        &mut self,
        caster: &mut impl RayCaster,
        id: ObservableId,
        mut new_params: ObservableParams,
        hint: ObservableChangeHint,
    ) {
        let Some(mut info) = self.observables.remove(&id) else {
            return;
        };
        let mut potentially_changed = false;

        if hint.contains(ObservableChangeHint::POSITIONS) {
            assert!(
                !new_params.positions.is_empty()
                    && new_params.positions.len() <= MAX_OBSERVABLE_POSITIONS,
                "observable position count out of range: {}",
                new_params.positions.len()
            );
            let old_canonical = info.params.canonical_position();
            let new_canonical = new_params.positions[0];
            if old_canonical.distance_squared(new_canonical)
                > POSITION_CHANGE_EPSILON * POSITION_CHANGE_EPSILON
            {
                potentially_changed = true;
            }
            // The grid key always tracks the adopted canonical position,
            // even for sub-epsilon moves, so drift can't accumulate.
            self.grid.move_entry(old_canonical, new_canonical, id);
            info.params.positions = std::mem::take(&mut new_params.positions);
        }
        if hint.contains(ObservableChangeHint::TYPE_MASK)
            && info.params.type_mask != new_params.type_mask
        {
            info.params.type_mask = new_params.type_mask;
            potentially_changed = true;
        }
        if hint.contains(ObservableChangeHint::FACTION) && info.params.faction != new_params.faction
        {
            info.params.faction = new_params.faction;
            potentially_changed = true;
        }
        if hint.contains(ObservableChangeHint::SKIP_LIST) {
            info.params.skip_list = std::mem::take(&mut new_params.skip_list);
            info.params.skip_list.truncate(MAX_SKIP_LIST_SIZE);
        }
        if hint.contains(ObservableChangeHint::CALLBACK) {
            info.params.callback = new_params.callback.take();
        }
        if hint.contains(ObservableChangeHint::ENTITY_ID) {
            info.params.entity_id = new_params.entity_id;
        }

        let mut transitions: Vec<VisibilityChange> = Vec::new();
        if potentially_changed {
            let table = &self.config.priority_table;
            for (&observer_id, observer) in self.observers.iter_mut() {
                // A queued full recompute will pick the change up anyway.
                if observer.needs_pvs_update {
                    continue;
                }
                if is_self_observation(&observer.params, &info.params) {
                    continue;
                }
                if pvs::should_observe(&observer.params, &info.params) {
                    if let Some(entry) = observer.pvs.get_mut(&id) {
                        entry.needs_update = true;
                    } else {
                        let priority = entry_priority(table, &observer.params, &info.params);
                        observer.pvs.insert(id, PvsEntry::new(priority));
                    }
                    observer.needs_visibility_update = true;
                } else if let Some(entry) = observer.pvs.remove(&id) {
                    if !entry.pending_ray.is_none() {
                        caster.cancel_ray(entry.pending_ray);
                        self.pending_rays.remove(&entry.pending_ray);
                    }
                    if entry.visible {
                        transitions.push(VisibilityChange {
                            observer: observer_id,
                            observer_entity: observer.params.entity_id,
                            observable: id,
                            observable_entity: info.params.entity_id,
                            visible: false,
                        });
                    }
                }
            }
        }

        self.observables.insert(id, info);
        for event in transitions {
            self.fire_visibility_change(&event);
        }
    }

    // -------------------------------------------------------------------------
    // QUERIES
    // -------------------------------------------------------------------------

    /// Settled visibility of an observable from an observer's point of
    /// view. False when the pair is unknown or outside the PVS.
    pub fn is_visible(&self, observer: ObserverId, observable: ObservableId) -> bool {
        self.observers
            .get(&observer)
            .and_then(|info| info.pvs.get(&observable))
            .map_or(false, |entry| entry.visible)
    }

    /// Iterate the observables an observer currently sees.
    pub fn visible_observables(
        &self,
        observer: ObserverId,
    ) -> impl Iterator<Item = ObservableId> + '_ {
        self.observers
            .get(&observer)
            .into_iter()
            .flat_map(|info| {
                info.pvs
                    .iter()
                    .filter(|(_, entry)| entry.visible)
                    .map(|(&id, _)| id)
            })
    }

    /// Size of an observer's candidate set. Zero for unknown observers.
    pub fn pvs_size(&self, observer: ObserverId) -> usize {
        self.observers.get(&observer).map_or(0, |info| info.pvs.len())
    }

    pub fn observer_params(&self, id: ObserverId) -> Option<&ObserverParams> {
        self.observers.get(&id).map(|info| &info.params)
    }

    pub fn observable_params(&self, id: ObservableId) -> Option<&ObservableParams> {
        self.observables.get(&id).map(|info| &info.params)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn observable_count(&self) -> usize {
        self.observables.len()
    }

    /// Counters for dashboards and tests.
    pub fn stats(&self) -> &VisionMapStats {
        &self.stats
    }

    // -------------------------------------------------------------------------
    // CALLBACK DISPATCH
    // -------------------------------------------------------------------------

    /// Fire one observer-side and one observable-side callback for a
    /// transition. Both lookups are fresh by id - no references are held
    /// across dispatch.
    pub(crate) fn fire_visibility_change(&mut self, event: &VisibilityChange) {
        if let Some(observer) = self.observers.get_mut(&event.observer) {
            if let Some(callback) = observer.params.callback.as_mut() {
                callback(event);
            }
        }
        if let Some(observable) = self.observables.get_mut(&event.observable) {
            if let Some(callback) = observable.params.callback.as_mut() {
                callback(event);
            }
        }
        self.stats.visibility_transitions += 1;
    }
}

impl Default for VisionMap {
    fn default() -> Self {
        Self::new(VisionMapConfig::default())
    }
}

// =============================================================================
// SHARED PREDICATE HELPERS
// =============================================================================

/// Self-observation: an observer never perceives its own entity. Unowned
/// records (zero entity id) are always distinct.
pub(crate) fn is_self_observation(observer: &ObserverParams, observable: &ObservableParams) -> bool {
    observer.entity_id.is_valid() && observer.entity_id == observable.entity_id
}

/// Resolve the ray priority for a fresh PVS entry.
pub(crate) fn entry_priority(
    table: &RayCastPriorityTable,
    observer: &ObserverParams,
    observable: &ObservableParams,
) -> RayCastPriority {
    table.priority_for(
        observer.type_mask,
        observer.faction,
        observable.type_mask,
        observable.faction,
    )
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use smallvec::smallvec;

    use super::*;
    use crate::params::EntityId;
    use crate::raycast::RayQueue;

    #[test]
    fn test_id_minting_skips_zero_on_wrap() {
        let mut map = VisionMap::default();
        map.next_observer_id = u32::MAX;
        assert_eq!(map.create_observer_id(), ObserverId(u32::MAX));
        assert_eq!(map.create_observer_id(), ObserverId(1), "zero is reserved");

        map.next_observable_id = u32::MAX;
        assert_eq!(map.create_observable_id(), ObservableId(u32::MAX));
        assert_eq!(map.create_observable_id(), ObservableId(1));
    }

    #[test]
    fn test_invalid_ids_are_ignored() {
        let mut map = VisionMap::default();
        let mut rays = RayQueue::new(8);

        map.register_observer(ObserverId::NONE, ObserverParams::default());
        assert_eq!(map.observer_count(), 0);

        map.register_observable(
            ObservableId::NONE,
            ObservableParams {
                positions: smallvec![Vec3::ZERO],
                ..Default::default()
            },
        );
        assert_eq!(map.observable_count(), 0);

        // Unknown ids are silent no-ops as well.
        map.unregister_observer(&mut rays, ObserverId(99));
        map.unregister_observable(&mut rays, ObservableId(99));
        map.observer_changed(ObserverId(99), ObserverParams::default(), ObserverChangeHint::ALL);
    }

    #[test]
    fn test_duplicate_registration_is_a_no_op() {
        let mut map = VisionMap::default();
        let id = map.create_observer_id();
        let mut params = ObserverParams::default();
        params.sight_range = 5.0;
        map.register_observer(id, params);

        let mut other = ObserverParams::default();
        other.sight_range = 50.0;
        map.register_observer(id, other);

        assert_eq!(map.observer_count(), 1);
        assert_eq!(map.observer_params(id).map(|p| p.sight_range), Some(5.0));
    }

    #[test]
    fn test_observer_params_are_adopted_with_all_hint() {
        let mut map = VisionMap::default();
        let id = map.create_observer_id();
        map.register_observer(
            id,
            ObserverParams {
                eye_position: Vec3::new(1.0, 2.0, 3.0),
                sight_range: 25.0,
                fov_cos: 0.5,
                faction: 3,
                types_to_observe: 0b101,
                factions_to_observe: 0b11,
                update_period: 0.5,
                entity_id: EntityId(7),
                ..Default::default()
            },
        );

        let params = map.observer_params(id).unwrap();
        assert_eq!(params.eye_position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(params.sight_range, 25.0);
        assert_eq!(params.fov_cos, 0.5);
        assert_eq!(params.faction, 3);
        assert_eq!(params.update_period, 0.5);
        assert_eq!(params.entity_id, EntityId(7));

        let info = &map.observers[&id];
        assert!(info.needs_pvs_update);
        assert!(info.needs_visibility_update);
        assert!(info.update_all_visibility);
    }

    #[test]
    fn test_skip_lists_are_clamped_on_adoption() {
        let mut map = VisionMap::default();
        let id = map.create_observer_id();
        map.register_observer(
            id,
            ObserverParams {
                skip_list: (0..100).map(crate::params::BodyHandle).collect(),
                ..Default::default()
            },
        );
        assert_eq!(
            map.observer_params(id).map(|p| p.skip_list.len()),
            Some(MAX_SKIP_LIST_SIZE)
        );
    }
}

