//! In-memory world shared by the integration tests.
#![allow(dead_code)]

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tetherkeep::{
    BlockPos, EngineConfig, EntityHost, EntityId, HolderRef, LiveEntity, PagingTicket, Placement,
    RegionId, RegionPager, Result, StateBlob, TetherEngine, TetherError,
};
use uuid::Uuid;

pub const OVERWORLD: &str = "minecraft:overworld";
pub const NETHER: &str = "minecraft:the_nether";
pub const THE_END: &str = "minecraft:the_end";

/// Host and pager in one: resident entities, entities saved in unloaded
/// regions, and paging tickets.
pub struct FakeWorld {
    regions: Mutex<HashSet<RegionId>>,
    resident: Mutex<HashMap<EntityId, (LiveEntity, StateBlob)>>,
    stashed: Mutex<HashMap<EntityId, (LiveEntity, StateBlob)>>,
    holders: Mutex<HashMap<Uuid, Placement>>,
    discarded: Mutex<Vec<EntityId>>,
    refused: Mutex<HashSet<RegionId>>,
    page_in_on_request: AtomicBool,
    fail_instantiate: AtomicBool,
    broken_captures: Mutex<HashSet<EntityId>>,
    requests: AtomicUsize,
    released: Mutex<Vec<u64>>,
    next_ticket: AtomicU64,
}

impl FakeWorld {
    pub fn new() -> Arc<Self> {
        let regions = [OVERWORLD, NETHER, THE_END]
            .into_iter()
            .map(RegionId::from)
            .collect();
        Arc::new(Self {
            regions: Mutex::new(regions),
            resident: Mutex::new(HashMap::new()),
            stashed: Mutex::new(HashMap::new()),
            holders: Mutex::new(HashMap::new()),
            discarded: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
            page_in_on_request: AtomicBool::new(false),
            fail_instantiate: AtomicBool::new(false),
            broken_captures: Mutex::new(HashSet::new()),
            requests: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(1),
        })
    }

    pub fn spawn(&self, region: &str, position: BlockPos, name: &str) -> LiveEntity {
        let live = LiveEntity::new(EntityId::new_v4(), region, position);
        self.resident
            .lock()
            .unwrap()
            .insert(live.id, (live.clone(), horse_state(live.id, name)));
        live
    }

    /// Moves a resident entity out of memory, as a region unload would.
    pub fn unload(&self, id: EntityId) -> LiveEntity {
        let entry = self.resident.lock().unwrap().remove(&id).expect("entity not resident");
        let live = entry.0.clone();
        self.stashed.lock().unwrap().insert(id, entry);
        live
    }

    pub fn load(&self, id: EntityId) -> LiveEntity {
        let entry = self.stashed.lock().unwrap().remove(&id).expect("entity not stashed");
        let live = entry.0.clone();
        self.resident.lock().unwrap().insert(id, entry);
        live
    }

    pub fn kill(&self, id: EntityId) {
        self.resident.lock().unwrap().remove(&id);
        self.stashed.lock().unwrap().remove(&id);
    }

    pub fn refuse_paging(&self, region: &str) {
        self.refused.lock().unwrap().insert(RegionId::from(region));
    }

    /// Makes page-in requests load stashed entities of the requested region.
    pub fn page_in_on_request(&self, enabled: bool) {
        self.page_in_on_request.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_instantiate(&self, enabled: bool) {
        self.fail_instantiate.store(enabled, Ordering::SeqCst);
    }

    /// Makes state capture of `id` fail until the world is dropped.
    pub fn break_capture(&self, id: EntityId) {
        self.broken_captures.lock().unwrap().insert(id);
    }

    pub fn place_holder(&self, holder: &HolderRef, placement: Placement) {
        self.holders.lock().unwrap().insert(holder.id, placement);
    }

    pub fn resident_entity(&self, id: EntityId) -> Option<LiveEntity> {
        self.resident.lock().unwrap().get(&id).map(|(live, _)| live.clone())
    }

    pub fn resident_count(&self) -> usize {
        self.resident.lock().unwrap().len()
    }

    pub fn discarded(&self) -> Vec<EntityId> {
        self.discarded.lock().unwrap().clone()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<u64> {
        self.released.lock().unwrap().clone()
    }
}

impl EntityHost for FakeWorld {
    fn region_exists(&self, region: &RegionId) -> bool {
        self.regions.lock().unwrap().contains(region)
    }

    fn find_resident(&self, region: &RegionId, id: EntityId) -> Option<LiveEntity> {
        self.resident
            .lock()
            .unwrap()
            .get(&id)
            .filter(|(live, _)| &live.region == region)
            .map(|(live, _)| live.clone())
    }

    fn capture_state(&self, entity: &LiveEntity) -> Result<StateBlob> {
        if self.broken_captures.lock().unwrap().contains(&entity.id) {
            return Err(TetherError::HostError(format!("capture of {} failed", entity.id)));
        }
        self.resident
            .lock()
            .unwrap()
            .get(&entity.id)
            .map(|(_, state)| state.clone())
            .ok_or_else(|| TetherError::EntityNotFound(entity.id.to_string()))
    }

    fn instantiate(&self, state: &StateBlob, placement: &Placement) -> Result<LiveEntity> {
        if self.fail_instantiate.load(Ordering::SeqCst) {
            return Err(TetherError::HostError("spawn rejected".to_string()));
        }
        let live = LiveEntity::new(EntityId::new_v4(), placement.region.clone(), placement.block_pos());
        self.resident
            .lock()
            .unwrap()
            .insert(live.id, (live.clone(), state.clone()));
        Ok(live)
    }

    fn discard(&self, entity: &LiveEntity) -> Result<()> {
        self.kill(entity.id);
        self.discarded.lock().unwrap().push(entity.id);
        Ok(())
    }

    fn move_within_region(&self, entity: &LiveEntity, placement: &Placement) -> Result<LiveEntity> {
        let mut resident = self.resident.lock().unwrap();
        let (live, _) = resident
            .get_mut(&entity.id)
            .ok_or_else(|| TetherError::EntityNotFound(entity.id.to_string()))?;
        live.position = placement.block_pos();
        Ok(live.clone())
    }

    fn transfer_region(&self, entity: &LiveEntity, placement: &Placement) -> Result<LiveEntity> {
        if !self.region_exists(&placement.region) {
            return Err(TetherError::RegionNotFound(placement.region.to_string()));
        }
        let mut resident = self.resident.lock().unwrap();
        let (live, _) = resident
            .get_mut(&entity.id)
            .ok_or_else(|| TetherError::EntityNotFound(entity.id.to_string()))?;
        live.region = placement.region.clone();
        live.position = placement.block_pos();
        Ok(live.clone())
    }

    fn locate_holder(&self, holder: &HolderRef) -> Option<Placement> {
        self.holders.lock().unwrap().get(&holder.id).cloned()
    }
}

impl RegionPager for FakeWorld {
    fn request(&self, region: &RegionId, around: BlockPos, _holder: &HolderRef) -> Result<PagingTicket> {
        if self.refused.lock().unwrap().contains(region) {
            return Err(TetherError::RegionNotFound(format!("{} cannot be paged in", region)));
        }
        self.requests.fetch_add(1, Ordering::SeqCst);

        if self.page_in_on_request.load(Ordering::SeqCst) {
            let mut stashed = self.stashed.lock().unwrap();
            let ids: Vec<EntityId> = stashed
                .iter()
                .filter(|(_, (live, _))| &live.region == region)
                .map(|(id, _)| *id)
                .collect();
            let mut resident = self.resident.lock().unwrap();
            for id in ids {
                if let Some(entry) = stashed.remove(&id) {
                    resident.insert(id, entry);
                }
            }
        }

        Ok(PagingTicket {
            id: self.next_ticket.fetch_add(1, Ordering::SeqCst),
            region: region.clone(),
            around,
        })
    }

    fn release(&self, ticket: &PagingTicket) {
        self.released.lock().unwrap().push(ticket.id);
    }
}

pub fn horse_state(id: EntityId, name: &str) -> StateBlob {
    let value = json!({
        "UUID": id.to_string(),
        "CustomName": name,
        "Health": 30.0,
        "Pos": [0.0, 0.0, 0.0],
    });
    StateBlob::from(serde_json::to_vec(&value).unwrap())
}

pub fn holder(name: &str) -> HolderRef {
    HolderRef::new(Uuid::new_v4(), name)
}

pub fn engine(world: &Arc<FakeWorld>, config: EngineConfig) -> TetherEngine {
    let host: Arc<dyn EntityHost> = world.clone();
    let pager: Arc<dyn RegionPager> = world.clone();
    TetherEngine::new(config, host, pager)
}
