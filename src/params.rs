//! Identifier types, parameter blocks, and visibility-change callbacks.
//!
//! Observers and observables are registered with plain parameter structs;
//! the vision map owns a copy and mutates it in place on `*_changed` calls.

use std::fmt;

use bitflags::bitflags;
use glam::Vec3;
use smallvec::SmallVec;

use crate::constants::MAX_OBSERVABLE_POSITIONS;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Handle of a registered observer. Zero is reserved as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObserverId(pub u32);

impl ObserverId {
    /// The reserved invalid id.
    pub const NONE: ObserverId = ObserverId(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Handle of a registered observable. Zero is reserved as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObservableId(pub u32);

impl ObservableId {
    /// The reserved invalid id.
    pub const NONE: ObservableId = ObservableId(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Owning entity of an observer or observable, as known to the embedder.
/// Zero means unowned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntityId(pub u64);

impl EntityId {
    pub const NONE: EntityId = EntityId(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Physical body excluded from ray-occlusion tests (e.g. the observer's
/// own body). Lifetime is managed by the physics layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BodyHandle(pub u64);

/// Bounded list of bodies a ray should pass through.
pub type SkipList = SmallVec<[BodyHandle; 8]>;

/// Bit for a faction id inside a faction mask. Factions above 31 never
/// match any mask.
#[inline]
pub fn faction_bit(faction: u8) -> u32 {
    1u32.checked_shl(u32::from(faction)).unwrap_or(0)
}

// =============================================================================
// CHANGE HINTS
// =============================================================================

bitflags! {
    /// Selects which observer fields a `observer_changed` call adopts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObserverChangeHint: u32 {
        const FACTION             = 1 << 0;
        const FACTIONS_TO_OBSERVE = 1 << 1;
        const TYPES_TO_OBSERVE    = 1 << 2;
        const SIGHT_RANGE         = 1 << 3;
        const FOV                 = 1 << 4;
        const POSITION            = 1 << 5;
        const ORIENTATION         = 1 << 6;
        const SKIP_LIST           = 1 << 7;
        const CALLBACK            = 1 << 8;
        const TYPE_MASK           = 1 << 9;
        const RAYCAST_FLAGS       = 1 << 10;
        const ENTITY_ID           = 1 << 11;
        const UPDATE_PERIOD       = 1 << 12;
        const ALL                 = Self::FACTION.bits()
            | Self::FACTIONS_TO_OBSERVE.bits()
            | Self::TYPES_TO_OBSERVE.bits()
            | Self::SIGHT_RANGE.bits()
            | Self::FOV.bits()
            | Self::POSITION.bits()
            | Self::ORIENTATION.bits()
            | Self::SKIP_LIST.bits()
            | Self::CALLBACK.bits()
            | Self::TYPE_MASK.bits()
            | Self::RAYCAST_FLAGS.bits()
            | Self::ENTITY_ID.bits()
            | Self::UPDATE_PERIOD.bits();
    }
}

bitflags! {
    /// Selects which observable fields a `observable_changed` call adopts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObservableChangeHint: u32 {
        const POSITIONS = 1 << 0;
        const TYPE_MASK = 1 << 1;
        const FACTION   = 1 << 2;
        const SKIP_LIST = 1 << 3;
        const CALLBACK  = 1 << 4;
        const ENTITY_ID = 1 << 5;
        const ALL       = Self::POSITIONS.bits()
            | Self::TYPE_MASK.bits()
            | Self::FACTION.bits()
            | Self::SKIP_LIST.bits()
            | Self::CALLBACK.bits()
            | Self::ENTITY_ID.bits();
    }
}

// =============================================================================
// VISIBILITY CALLBACKS
// =============================================================================

/// Fired once per visibility transition, on both the observer's and the
/// observable's callback. A ray completion that doesn't change the settled
/// flag fires nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilityChange {
    pub observer: ObserverId,
    pub observer_entity: EntityId,
    pub observable: ObservableId,
    pub observable_entity: EntityId,
    pub visible: bool,
}

/// Transition notification callback. Context travels via closure capture;
/// the callback receives no access to the map itself, so it can only
/// record intent for the embedder to apply between updates.
pub type VisionCallback = Box<dyn FnMut(&VisibilityChange)>;

// =============================================================================
// OBSERVER PARAMS
// =============================================================================

/// Everything the map needs to know about a perceiving entity.
pub struct ObserverParams {
    /// Ray origin and FOV apex.
    pub eye_position: Vec3,
    /// Unit look direction. Zero length means omnidirectional.
    pub eye_direction: Vec3,
    /// Maximum perception distance. Zero or negative means unlimited.
    pub sight_range: f32,
    /// Cosine FOV threshold against `eye_direction`. At or below -1 means
    /// unlimited.
    pub fov_cos: f32,
    /// This observer's faction id.
    pub faction: u8,
    /// Bitmask of observable types this observer may perceive.
    pub types_to_observe: u32,
    /// Bitmask of factions this observer may perceive.
    pub factions_to_observe: u32,
    /// This observer's own type bits, matched against priority rules.
    pub type_mask: u32,
    /// Engine-specific flags copied verbatim onto every visibility ray.
    pub raycast_flags: u32,
    /// Bodies excluded from this observer's rays.
    pub skip_list: SkipList,
    /// Transition notification callback.
    pub callback: Option<VisionCallback>,
    /// Minimum seconds between visibility reverifications.
    pub update_period: f32,
    /// Owning entity, used to forbid self-observation.
    pub entity_id: EntityId,
}

impl Default for ObserverParams {
    fn default() -> Self {
        Self {
            eye_position: Vec3::ZERO,
            eye_direction: Vec3::ZERO,
            sight_range: 0.0,
            fov_cos: -1.0,
            faction: 0,
            types_to_observe: 0,
            factions_to_observe: 0,
            type_mask: 0,
            raycast_flags: 0,
            skip_list: SkipList::new(),
            callback: None,
            update_period: 0.0,
            entity_id: EntityId::NONE,
        }
    }
}

impl fmt::Debug for ObserverParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverParams")
            .field("eye_position", &self.eye_position)
            .field("eye_direction", &self.eye_direction)
            .field("sight_range", &self.sight_range)
            .field("fov_cos", &self.fov_cos)
            .field("faction", &self.faction)
            .field("types_to_observe", &self.types_to_observe)
            .field("factions_to_observe", &self.factions_to_observe)
            .field("type_mask", &self.type_mask)
            .field("raycast_flags", &self.raycast_flags)
            .field("skip_list", &self.skip_list)
            .field("callback", &self.callback.is_some())
            .field("update_period", &self.update_period)
            .field("entity_id", &self.entity_id)
            .finish()
    }
}

// =============================================================================
// OBSERVABLE PARAMS
// =============================================================================

/// Everything the map needs to know about a perceivable entity.
pub struct ObservableParams {
    /// Candidate line-of-sight targets, tried in order. The first is
    /// canonical: it keys the spatial grid and the range test.
    pub positions: SmallVec<[Vec3; MAX_OBSERVABLE_POSITIONS]>,
    /// This observable's type bits.
    pub type_mask: u32,
    /// This observable's faction id.
    pub faction: u8,
    /// Bodies excluded from rays aimed at this observable.
    pub skip_list: SkipList,
    /// Transition notification callback.
    pub callback: Option<VisionCallback>,
    /// Owning entity, used to forbid self-observation.
    pub entity_id: EntityId,
}

impl Default for ObservableParams {
    fn default() -> Self {
        Self {
            positions: SmallVec::new(),
            type_mask: 0,
            faction: 0,
            skip_list: SkipList::new(),
            callback: None,
            entity_id: EntityId::NONE,
        }
    }
}

impl ObservableParams {
    /// Canonical position (index 0).
    #[inline]
    pub fn canonical_position(&self) -> Vec3 {
        self.positions.first().copied().unwrap_or(Vec3::ZERO)
    }
}

impl fmt::Debug for ObservableParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableParams")
            .field("positions", &self.positions)
            .field("type_mask", &self.type_mask)
            .field("faction", &self.faction)
            .field("skip_list", &self.skip_list)
            .field("callback", &self.callback.is_some())
            .field("entity_id", &self.entity_id)
            .finish()
    }
}
