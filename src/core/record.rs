use super::types::{BlockPos, EntityId, RegionId, StateBlob};

/// Everything the registry knows about one bound entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub id: EntityId,
    pub state: StateBlob,
    pub region: RegionId,
    pub position: BlockPos,
    /// Whether the live instance is believed to be loaded.
    pub resident: bool,
    /// Terminal: once set, no relocation or recreation is attempted.
    pub deceased: bool,
    /// Logical tick of the last re-snapshot. Not persisted.
    pub last_refresh_tick: u64,
    /// Name of the holder who disconnected while riding the entity.
    pub offline_holder: Option<String>,
}

impl SnapshotRecord {
    pub fn new(id: EntityId, state: StateBlob, region: RegionId, position: BlockPos) -> Self {
        Self {
            id,
            state,
            region,
            position,
            resident: false,
            deceased: false,
            last_refresh_tick: 0,
            offline_holder: None,
        }
    }

    /// Placeholder for an entity whose death was observed before any snapshot.
    pub fn deceased_placeholder(id: EntityId) -> Self {
        let mut record = Self::new(id, StateBlob::empty(), RegionId::default(), BlockPos::ORIGIN);
        record.deceased = true;
        record
    }

    /// A refresh is due when the interval elapsed or the clock moved backward.
    pub fn refresh_due(&self, now: u64, interval: u64) -> bool {
        now < self.last_refresh_tick || now - self.last_refresh_tick >= interval
    }

    pub fn display(&self) -> BindingView {
        BindingView {
            id: self.id,
            region: self.region.clone(),
            position: self.position,
            deceased: self.deceased,
            offline_holder: self.offline_holder.clone(),
        }
    }
}

/// Tooltip-style view of a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingView {
    pub id: EntityId,
    pub region: RegionId,
    pub position: BlockPos,
    pub deceased: bool,
    pub offline_holder: Option<String>,
}
