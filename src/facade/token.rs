use crate::core::{BindingView, BlockPos, EntityId, RegionId};
use crate::facade::engine::RelinkOutcome;
use serde::{Deserialize, Serialize};

/// Reference a holder carries for a bound entity.
///
/// The position and region are a cache for display and may lag behind the
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingToken {
    pub entity: EntityId,
    pub region: RegionId,
    pub position: BlockPos,
}

impl BindingToken {
    pub fn new(entity: EntityId, region: RegionId, position: BlockPos) -> Self {
        Self {
            entity,
            region,
            position,
        }
    }

    pub fn from_view(view: &BindingView) -> Self {
        Self::new(view.id, view.region.clone(), view.position)
    }

    /// Adopts a newer view of the binding. Returns whether anything changed.
    pub fn refresh(&mut self, view: &BindingView) -> bool {
        let next = Self::from_view(view);
        if *self == next {
            return false;
        }
        *self = next;
        true
    }

    /// Follows a relink answer, returning whether the carried identity moved.
    pub fn apply_relink(&mut self, outcome: RelinkOutcome) -> bool {
        match outcome {
            RelinkOutcome::Rebound(next) if next != self.entity => {
                self.entity = next;
                true
            }
            _ => false,
        }
    }
}
