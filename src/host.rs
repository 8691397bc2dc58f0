//! Interfaces of the host simulation this crate cooperates with.
//!
//! The engine never owns live entities. It asks the host where they are,
//! captures their state, and moves, spawns or discards them through these
//! traits. Implementations are expected to be cheap and non-blocking since
//! most calls happen on the host's tick.

use crate::core::{BlockPos, EntityId, HolderRef, Placement, RegionId, Result, StateBlob};

/// View of an instance currently resident in the simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEntity {
    pub id: EntityId,
    pub region: RegionId,
    pub position: BlockPos,
    pub alive: bool,
}

impl LiveEntity {
    pub fn new(id: EntityId, region: impl Into<RegionId>, position: BlockPos) -> Self {
        Self {
            id,
            region: region.into(),
            position,
            alive: true,
        }
    }
}

pub trait EntityHost: Send + Sync {
    fn region_exists(&self, region: &RegionId) -> bool;

    /// Instance with identity `id` if it is resident in `region`.
    fn find_resident(&self, region: &RegionId, id: EntityId) -> Option<LiveEntity>;

    fn capture_state(&self, entity: &LiveEntity) -> Result<StateBlob>;

    /// Spawns a new instance from `state` at `placement`.
    ///
    /// The host mints the identity of the new instance; the returned view
    /// carries it.
    fn instantiate(&self, state: &StateBlob, placement: &Placement) -> Result<LiveEntity>;

    fn discard(&self, entity: &LiveEntity) -> Result<()>;

    /// Sets position and orientation inside the entity's current region.
    fn move_within_region(&self, entity: &LiveEntity, placement: &Placement) -> Result<LiveEntity>;

    /// Moves the entity to another region, keeping its identity and
    /// accumulated state.
    fn transfer_region(&self, entity: &LiveEntity, placement: &Placement) -> Result<LiveEntity>;

    /// Current placement of a holder, if they are still present.
    fn locate_holder(&self, _holder: &HolderRef) -> Option<Placement> {
        None
    }
}

/// Keep-alive request for a region area, returned by [`RegionPager::request`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PagingTicket {
    pub id: u64,
    pub region: RegionId,
    pub around: BlockPos,
}

pub trait RegionPager: Send + Sync {
    /// Asks the host to page in the area around `around`.
    ///
    /// An error means the region cannot be brought into memory right now.
    fn request(&self, region: &RegionId, around: BlockPos, holder: &HolderRef) -> Result<PagingTicket>;

    fn release(&self, ticket: &PagingTicket);
}
