//! Visibility ray lifecycle: queueing, submit-time fill, completion.
//!
//! A PVS entry has at most one outstanding ray. Request parameters are
//! filled when the caster is about to dispatch, not when the ray is
//! queued, so origin and target always reflect current positions.

use crate::constants::{MAX_RAY_HITS, MAX_RAY_SKIP_LIST_SIZE, OCCLUDER_OBJECT_TYPES};
use crate::params::{ObservableId, ObserverId, SkipList, VisibilityChange};
use crate::raycast::{QueuedRayId, RayCastRequest, RayCastResult, RayCaster};

use super::{PendingRay, VisionMap};

impl VisionMap {
    /// Queue a fresh line-of-sight ray for one PVS entry, canceling any
    /// cast still outstanding for it first. On caster saturation the
    /// entry keeps its settled truth and retries on the next visibility
    /// pass.
    pub(crate) fn queue_entry_ray(
        &mut self,
        caster: &mut impl RayCaster,
        observer_id: ObserverId,
        observable_id: ObservableId,
    ) {
        let mut queue_failed = false;
        {
            let pending_rays = &mut self.pending_rays;
            let Some(info) = self.observers.get_mut(&observer_id) else {
                return;
            };
            let Some(entry) = info.pvs.get_mut(&observable_id) else {
                return;
            };
            // Defensive: normally nothing is outstanding here.
            if !entry.pending_ray.is_none() {
                caster.cancel_ray(entry.pending_ray);
                pending_rays.remove(&entry.pending_ray);
                entry.pending_ray = QueuedRayId::NONE;
            }

            let ray_id = caster.queue_ray(entry.priority);
            if ray_id.is_none() {
                entry.needs_update = true;
                queue_failed = true;
            } else {
                entry.pending_ray = ray_id;
                pending_rays.insert(
                    ray_id,
                    PendingRay {
                        observer: observer_id,
                        observable: observable_id,
                    },
                );
            }
        }

        if queue_failed {
            if let Some(info) = self.observers.get_mut(&observer_id) {
                info.needs_visibility_update = true;
            }
            self.stats.ray_queue_failures += 1;
        } else {
            self.stats.rays_queued += 1;
        }
    }

    /// Fill and submit every ray the caster is about to dispatch.
    pub(crate) fn dispatch_ray_requests(&mut self, caster: &mut impl RayCaster) {
        let mut ready: Vec<QueuedRayId> = Vec::new();
        caster.drain_ready(&mut ready);
        for ray_id in ready {
            let Some(&pending) = self.pending_rays.get(&ray_id) else {
                // Bookkeeping vanished between drain and fill.
                caster.cancel_ray(ray_id);
                continue;
            };
            match self.build_ray_request(pending) {
                Some(request) => caster.submit_ray(ray_id, request),
                None => {
                    caster.cancel_ray(ray_id);
                    self.pending_rays.remove(&ray_id);
                }
            }
        }
    }

    /// Build the request for a pending ray: origin at the observer's eye,
    /// aimed at the entry's current candidate position, filtered to
    /// occluder geometry, with both skip lists merged (observer bodies
    /// take priority when the capacity doesn't fit both).
    fn build_ray_request(&self, pending: PendingRay) -> Option<RayCastRequest> {
        let observer = self.observers.get(&pending.observer)?;
        let observable = self.observables.get(&pending.observable)?;
        let entry = observer.pvs.get(&pending.observable)?;

        let positions = &observable.params.positions;
        let target = positions
            .get(entry.test_position_index)
            .or_else(|| positions.first())
            .copied()?;
        let origin = observer.params.eye_position;

        // Clamp to capacity first, then assert.
        let mut skip_list = SkipList::new();
        skip_list.extend(
            observer
                .params
                .skip_list
                .iter()
                .copied()
                .take(MAX_RAY_SKIP_LIST_SIZE),
        );
        skip_list.extend(
            observable
                .params
                .skip_list
                .iter()
                .copied()
                .take(MAX_RAY_SKIP_LIST_SIZE - skip_list.len()),
        );
        debug_assert!(skip_list.len() <= MAX_RAY_SKIP_LIST_SIZE);

        Some(RayCastRequest {
            origin,
            direction: target - origin,
            object_types: OCCLUDER_OBJECT_TYPES,
            flags: observer.params.raycast_flags,
            max_hits: MAX_RAY_HITS,
            skip_list,
        })
    }

    /// Pull finished casts out of the caster and apply each one.
    pub(crate) fn process_ray_completions(&mut self, caster: &mut impl RayCaster) {
        let mut completed: Vec<(QueuedRayId, RayCastResult)> = Vec::new();
        caster.drain_completed(&mut completed);
        for (ray_id, result) in completed {
            self.on_ray_complete(caster, ray_id, result);
        }
    }

    /// Apply one ray result. Occlusion with untried candidate positions
    /// left re-queues against the next position without touching the
    /// settled flag; otherwise the truth settles and a transition fires
    /// both callbacks. All state is re-looked-up by id, so a callback
    /// mutating the registries between completions stays safe.
    fn on_ray_complete(
        &mut self,
        caster: &mut impl RayCaster,
        ray_id: QueuedRayId,
        result: RayCastResult,
    ) {
        let Some(pending) = self.pending_rays.remove(&ray_id) else {
            // Canceled after the caster resolved it.
            return;
        };
        self.stats.rays_completed += 1;

        let mut retry_next_position = false;
        let mut transition: Option<VisibilityChange> = None;
        {
            let observables = &self.observables;
            let Some(info) = self.observers.get_mut(&pending.observer) else {
                return;
            };
            let observer_entity = info.params.entity_id;
            let Some(entry) = info.pvs.get_mut(&pending.observable) else {
                return;
            };
            if entry.pending_ray != ray_id {
                // Superseded by a newer cast.
                return;
            }
            entry.pending_ray = QueuedRayId::NONE;

            let position_count = observables
                .get(&pending.observable)
                .map_or(1, |observable| observable.params.positions.len());

            if result.hit && entry.test_position_index + 1 < position_count {
                // Occluded, but alternate positions remain untried. The
                // settled flag keeps its value until they're exhausted.
                entry.test_position_index += 1;
                retry_next_position = true;
            } else {
                entry.test_position_index = 0;
                let visible = !result.hit;
                if entry.visible != visible {
                    entry.visible = visible;
                    transition = Some(VisibilityChange {
                        observer: pending.observer,
                        observer_entity,
                        observable: pending.observable,
                        observable_entity: observables
                            .get(&pending.observable)
                            .map_or(Default::default(), |observable| observable.params.entity_id),
                        visible,
                    });
                }
            }
        }

        if retry_next_position {
            self.queue_entry_ray(caster, pending.observer, pending.observable);
        } else if let Some(event) = transition {
            self.fire_visibility_change(&event);
        }
    }
}
