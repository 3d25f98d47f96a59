//! PVS membership: the filtering predicate and candidate recomputation.
//!
//! These are pure read-only predicates over the parameter blocks plus the
//! two-phase (prune, discover) recompute they drive.

use crate::params::{faction_bit, ObservableId, ObservableParams, ObserverParams, ObserverId, VisibilityChange};
use crate::raycast::RayCaster;

use super::{entry_priority, is_self_observation, PvsEntry, VisionMap};

/// Whether an observer may perceive an observable at all: type and
/// faction masks must intersect, the canonical position must be in sight
/// range (when finite), and at least one candidate position must fall
/// inside the field of view (when constrained).
///
/// A pure function of the two parameter blocks.
pub fn should_observe(observer: &ObserverParams, observable: &ObservableParams) -> bool {
    if observer.types_to_observe & observable.type_mask == 0 {
        return false;
    }
    if observer.factions_to_observe & faction_bit(observable.faction) == 0 {
        return false;
    }
    if observer.sight_range > 0.0 {
        let distance_squared = observer
            .eye_position
            .distance_squared(observable.canonical_position());
        if distance_squared > observer.sight_range * observer.sight_range {
            return false;
        }
    }
    in_field_of_view(observer, observable)
}

/// FOV cone test. A zero-length eye direction means omnidirectional, an
/// FOV cosine at or below -1 means unconstrained; either skips the test.
fn in_field_of_view(observer: &ObserverParams, observable: &ObservableParams) -> bool {
    if observer.fov_cos <= -1.0 {
        return true;
    }
    let Some(eye_direction) = observer.eye_direction.try_normalize() else {
        return true;
    };
    observable.positions.iter().any(|&position| {
        match (position - observer.eye_position).try_normalize() {
            Some(to_target) => to_target.dot(eye_direction) >= observer.fov_cos,
            // Standing on the eye point: trivially in view.
            None => true,
        }
    })
}

impl VisionMap {
    /// Recompute one observer's candidate set: prune entries that no
    /// longer qualify (firing visible-to-false transitions), then
    /// discover new candidates via the spatial grid - or, for unlimited
    /// sight range, a full registry scan (documented O(N) fallback;
    /// unlimited-range observers are expected to be rare).
    pub(crate) fn update_pvs(&mut self, caster: &mut impl RayCaster, observer_id: ObserverId) {
        puffin::profile_function!();

        // Phase 1: prune. Transitions are collected first and fired after
        // the registry borrows end.
        let mut transitions: Vec<VisibilityChange> = Vec::new();
        let observer_entity;
        {
            let observables = &self.observables;
            let pending_rays = &mut self.pending_rays;
            let Some(info) = self.observers.get_mut(&observer_id) else {
                return;
            };
            let info = &mut *info;
            observer_entity = info.params.entity_id;
            let params = &info.params;
            info.pvs.retain(|&observable_id, entry| {
                let keep = observables.get(&observable_id).map_or(false, |observable| {
                    !is_self_observation(params, &observable.params)
                        && should_observe(params, &observable.params)
                });
                if !keep {
                    if !entry.pending_ray.is_none() {
                        caster.cancel_ray(entry.pending_ray);
                        pending_rays.remove(&entry.pending_ray);
                    }
                    if entry.visible {
                        transitions.push(VisibilityChange {
                            observer: observer_id,
                            observer_entity,
                            observable: observable_id,
                            observable_entity: observables
                                .get(&observable_id)
                                .map_or(Default::default(), |b| b.params.entity_id),
                            visible: false,
                        });
                    }
                }
                keep
            });
        }

        // Phase 2: discover.
        let mut candidates: Vec<ObservableId> = Vec::new();
        {
            let Some(info) = self.observers.get(&observer_id) else {
                return;
            };
            let eye = info.params.eye_position;
            let range = info.params.sight_range;
            if range > 0.0 {
                self.grid.query_sphere_into(eye, range, &mut candidates);
            } else {
                candidates.extend(self.observables.keys().copied());
            }
        }

        {
            let observables = &self.observables;
            let table = &self.config.priority_table;
            let Some(info) = self.observers.get_mut(&observer_id) else {
                return;
            };
            let mut added = false;
            for observable_id in candidates {
                if info.pvs.contains_key(&observable_id) {
                    continue;
                }
                let Some(observable) = observables.get(&observable_id) else {
                    continue;
                };
                if is_self_observation(&info.params, &observable.params) {
                    continue;
                }
                if !should_observe(&info.params, &observable.params) {
                    continue;
                }
                let priority = entry_priority(table, &info.params, &observable.params);
                info.pvs.insert(observable_id, PvsEntry::new(priority));
                added = true;
            }
            if added {
                info.needs_visibility_update = true;
            }
        }

        for event in transitions {
            self.fire_visibility_change(&event);
        }
        self.stats.pvs_updates += 1;
    }

    /// Reverify one observer's visibility: every entry flagged for update
    /// (or all of them, when the observer-wide flag is set) gets a fresh
    /// ray at its priority.
    pub(crate) fn update_visibility_status(
        &mut self,
        caster: &mut impl RayCaster,
        observer_id: ObserverId,
    ) {
        puffin::profile_function!();

        let mut to_refresh: Vec<ObservableId> = Vec::new();
        {
            let Some(info) = self.observers.get_mut(&observer_id) else {
                return;
            };
            let update_all = info.update_all_visibility;
            info.update_all_visibility = false;
            for (&observable_id, entry) in info.pvs.iter_mut() {
                if update_all || entry.needs_update {
                    entry.needs_update = false;
                    to_refresh.push(observable_id);
                }
            }
        }
        for observable_id in to_refresh {
            self.queue_entry_ray(caster, observer_id, observable_id);
        }
        self.stats.visibility_updates += 1;
    }
}
