//! Asynchronous, priority-ordered line-of-sight ray casting.
//!
//! The vision map never blocks on a ray. It queues a cast at a priority,
//! fills in the request parameters just before dispatch (so origin and
//! target use current positions), and picks up results on a later tick.
//! Requests are pushed during update and processed at end of frame.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::params::{faction_bit, SkipList};

// =============================================================================
// PRIORITIES
// =============================================================================

/// Dispatch priority of a queued visibility ray.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum RayCastPriority {
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

/// One row of the priority mapping table. A rule matches when all four
/// masks intersect the queried observer/observable bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RayCastPriorityRule {
    pub from_types: u32,
    pub from_factions: u32,
    pub to_types: u32,
    pub to_factions: u32,
    pub priority: RayCastPriority,
}

/// Ordered rule table mapping (observer, observable) pairs to a ray
/// priority. First match wins; no match falls back to `Medium`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RayCastPriorityTable {
    rules: Vec<RayCastPriorityRule>,
}

impl RayCastPriorityTable {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule. Earlier rules shadow later ones.
    pub fn add_rule(&mut self, rule: RayCastPriorityRule) {
        self.rules.push(rule);
    }

    /// Resolve the priority for rays from an observer at an observable.
    pub fn priority_for(
        &self,
        from_types: u32,
        from_faction: u8,
        to_types: u32,
        to_faction: u8,
    ) -> RayCastPriority {
        let from_faction_bit = faction_bit(from_faction);
        let to_faction_bit = faction_bit(to_faction);
        for rule in &self.rules {
            if rule.from_types & from_types != 0
                && rule.from_factions & from_faction_bit != 0
                && rule.to_types & to_types != 0
                && rule.to_factions & to_faction_bit != 0
            {
                return rule.priority;
            }
        }
        RayCastPriority::Medium
    }
}

// =============================================================================
// REQUESTS AND RESULTS
// =============================================================================

/// Handle of a queued ray. Zero is reserved for "no ray outstanding" and
/// doubles as the queue-full failure value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct QueuedRayId(pub u32);

impl QueuedRayId {
    /// The reserved "no ray" handle.
    pub const NONE: QueuedRayId = QueuedRayId(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// A filled visibility-ray request, ready for the physics layer.
#[derive(Debug, Clone)]
pub struct RayCastRequest {
    /// World-space ray origin (the observer's eye).
    pub origin: Vec3,
    /// Un-normalized direction; its length is the cast distance.
    pub direction: Vec3,
    /// Object-type filter (occluder geometry only for visibility rays).
    pub object_types: u32,
    /// Engine-specific flags, copied from the observer's params.
    pub flags: u32,
    /// Maximum number of reported hits.
    pub max_hits: u8,
    /// Bodies the ray passes through.
    pub skip_list: SkipList,
}

/// Outcome of a dispatched ray.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RayCastResult {
    /// Whether anything occluding was hit.
    pub hit: bool,
    /// Distance to the closest hit, if any.
    pub hit_distance: f32,
}

impl RayCastResult {
    /// A clear cast: nothing between origin and target.
    pub fn clear() -> Self {
        Self {
            hit: false,
            hit_distance: 0.0,
        }
    }

    /// An occluded cast with the closest hit at `distance`.
    pub fn hit_at(distance: f32) -> Self {
        Self {
            hit: true,
            hit_distance: distance,
        }
    }
}

// =============================================================================
// CASTER CONTRACT
// =============================================================================

/// Asynchronous ray-casting service consumed by the vision map.
///
/// The flow per accepted ray is: `queue_ray` returns a handle immediately;
/// the handle shows up in `drain_ready` once the caster is about to
/// dispatch it; the caller then fills parameters via `submit_ray`; the
/// result appears in `drain_completed` exactly once - unless `cancel_ray`
/// intervened at any point.
pub trait RayCaster {
    /// Queue a cast at a priority. Returns `QueuedRayId::NONE` when the
    /// caster cannot accept more work.
    fn queue_ray(&mut self, priority: RayCastPriority) -> QueuedRayId;

    /// Cancel a queued, submitted, or completed-but-undrained ray. Its
    /// result will never be reported.
    fn cancel_ray(&mut self, id: QueuedRayId);

    /// Pop the ids about to be cast this frame into `out` (cleared
    /// first), highest priority first. The caller must `submit_ray` each.
    fn drain_ready(&mut self, out: &mut Vec<QueuedRayId>);

    /// Provide the filled request for a ray obtained from `drain_ready`.
    fn submit_ray(&mut self, id: QueuedRayId, request: RayCastRequest);

    /// Pop finished casts into `out` (cleared first), in submission order.
    fn drain_completed(&mut self, out: &mut Vec<(QueuedRayId, RayCastResult)>);
}

// =============================================================================
// DEFERRED RAY QUEUE
// =============================================================================

/// A pending cast ordered by priority, then by submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedCast {
    priority: RayCastPriority,
    seq: u64,
    id: QueuedRayId,
}

// BinaryHeap is a max-heap: highest priority first, then FIFO within a
// priority via reversed sequence comparison.
impl Ord for QueuedCast {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedCast {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deferred, budgeted ray scheduler.
///
/// Rays wait in a priority heap until `drain_ready` admits up to
/// `casts_per_frame` of them. Submitted requests sit in flight until the
/// embedder resolves them (against its physics world, or a script in
/// tests) with `resolve_in_flight`.
#[derive(Debug, Default)]
pub struct RayQueue {
    next_id: u32,
    next_seq: u64,
    pending: BinaryHeap<QueuedCast>,
    pending_ids: HashSet<QueuedRayId>,
    canceled: HashSet<QueuedRayId>,
    awaiting_submit: HashSet<QueuedRayId>,
    in_flight: Vec<(QueuedRayId, RayCastRequest)>,
    completed: Vec<(QueuedRayId, RayCastResult)>,
    casts_per_frame: usize,
}

impl RayQueue {
    /// Create a queue dispatching at most `casts_per_frame` rays per
    /// `drain_ready` call.
    pub fn new(casts_per_frame: usize) -> Self {
        Self {
            casts_per_frame,
            ..Self::default()
        }
    }

    /// Answer every in-flight request and move it to the completed list.
    pub fn resolve_in_flight<F>(&mut self, mut resolve: F)
    where
        F: FnMut(&RayCastRequest) -> RayCastResult,
    {
        for (id, request) in self.in_flight.drain(..) {
            self.completed.push((id, resolve(&request)));
        }
    }

    /// Number of submitted rays not yet resolved.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of rays waiting for dispatch.
    pub fn pending_count(&self) -> usize {
        self.pending_ids.len()
    }

    fn mint_id(&mut self) -> QueuedRayId {
        // Skip the reserved zero on wrap.
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        QueuedRayId(self.next_id)
    }
}

impl RayCaster for RayQueue {
    fn queue_ray(&mut self, priority: RayCastPriority) -> QueuedRayId {
        let id = self.mint_id();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(QueuedCast { priority, seq, id });
        self.pending_ids.insert(id);
        id
    }

    fn cancel_ray(&mut self, id: QueuedRayId) {
        if id.is_none() {
            return;
        }
        if self.pending_ids.remove(&id) {
            // Heap entries are skipped lazily on pop.
            self.canceled.insert(id);
        }
        self.awaiting_submit.remove(&id);
        self.in_flight.retain(|(flying, _)| *flying != id);
        self.completed.retain(|(done, _)| *done != id);
    }

    fn drain_ready(&mut self, out: &mut Vec<QueuedRayId>) {
        out.clear();
        while out.len() < self.casts_per_frame {
            let Some(cast) = self.pending.pop() else {
                break;
            };
            if self.canceled.remove(&cast.id) {
                continue;
            }
            self.pending_ids.remove(&cast.id);
            self.awaiting_submit.insert(cast.id);
            out.push(cast.id);
        }
    }

    fn submit_ray(&mut self, id: QueuedRayId, request: RayCastRequest) {
        if !self.awaiting_submit.remove(&id) {
            // Canceled between drain and submit.
            return;
        }
        self.in_flight.push((id, request));
    }

    fn drain_completed(&mut self, out: &mut Vec<(QueuedRayId, RayCastResult)>) {
        out.clear();
        out.append(&mut self.completed);
    }
}
