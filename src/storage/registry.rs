use crate::core::{BlockPos, EntityId, RegionId, Result, SnapshotRecord, StateBlob};
use crate::host::{EntityHost, LiveEntity};
use crate::storage::persistence::{PersistenceLayer, RegistryImage};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

pub const DEFAULT_REFRESH_INTERVAL: u64 = 20;

/// All bookkeeping guarded together so an export always sees one state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryTables {
    pub records: HashMap<EntityId, SnapshotRecord>,
    /// original identity -> identity of its recreated copy
    pub remaps: HashMap<EntityId, EntityId>,
    /// originals to discard the next time they become resident
    pub pending_deletions: HashSet<EntityId>,
}

impl RegistryTables {
    fn purge(&mut self, id: EntityId) -> bool {
        let existed = self.records.remove(&id).is_some();
        let remapped = self.remaps.remove(&id).is_some();
        let pending = self.pending_deletions.remove(&id);
        existed || remapped || pending
    }
}

/// What the caller should do with an instance that just became resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyVerdict {
    Keep,
    /// A recreated copy replaced this instance; discard it quietly.
    DiscardStale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub visited: usize,
    pub refreshed: usize,
    pub marked_unloaded: usize,
    pub faults: usize,
    /// Set when a pass was already running and this call did nothing.
    pub skipped: bool,
}

/// In-memory ground truth for every bound entity.
///
/// Safe to share between the tick loop and asynchronous producers. No lock is
/// held while the persistence layer touches the disk.
pub struct SnapshotRegistry {
    tables: RwLock<RegistryTables>,
    persistence: RwLock<Option<Arc<PersistenceLayer>>>,
    refreshing: AtomicBool,
    refresh_interval: u64,
}

impl Default for SnapshotRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_INTERVAL)
    }
}

impl SnapshotRegistry {
    pub fn new(refresh_interval: u64) -> Self {
        Self {
            tables: RwLock::new(RegistryTables::default()),
            persistence: RwLock::new(None),
            refreshing: AtomicBool::new(false),
            refresh_interval,
        }
    }

    pub fn refresh_interval(&self) -> u64 {
        self.refresh_interval
    }

    pub fn attach_persistence(&self, layer: Arc<PersistenceLayer>) -> Result<()> {
        *self.persistence.write()? = Some(layer);
        Ok(())
    }

    pub fn persistence(&self) -> Option<Arc<PersistenceLayer>> {
        self.persistence.read().ok().and_then(|guard| guard.as_ref().cloned())
    }

    fn mark_dirty(&self) {
        if let Some(layer) = self.persistence() {
            layer.mark_dirty(self);
        }
    }

    /// Writes the registry now, whatever the flush policy.
    pub fn flush(&self) -> Result<()> {
        if let Some(layer) = self.persistence() {
            layer.flush(self)?;
        }
        Ok(())
    }

    pub fn export_image(&self) -> Result<RegistryImage> {
        let tables = self.tables.read()?;
        Ok(RegistryImage::from_tables(&tables))
    }

    pub fn export_tables(&self) -> Result<RegistryTables> {
        Ok(self.tables.read()?.clone())
    }

    /// Swaps in freshly loaded tables. Does not mark the registry dirty.
    pub fn replace_tables(&self, tables: RegistryTables) -> Result<()> {
        *self.tables.write()? = tables;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Unconditional upsert of a binding.
    pub fn store(&self, id: EntityId, state: StateBlob, region: RegionId, position: BlockPos) -> Result<()> {
        {
            let mut tables = self.tables.write()?;
            tables.records.insert(id, SnapshotRecord::new(id, state, region, position));
        }
        self.mark_dirty();
        Ok(())
    }

    /// Pulls state, region and position from a resident instance.
    ///
    /// A failed capture keeps the previously stored state.
    pub fn update_from_live(&self, live: &LiveEntity, host: &dyn EntityHost) -> Result<()> {
        let captured = match host.capture_state(live) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!("Failed to capture state of {}: {}", live.id, err);
                None
            }
        };

        {
            let mut tables = self.tables.write()?;
            let record = tables.records.entry(live.id).or_insert_with(|| {
                SnapshotRecord::new(live.id, StateBlob::empty(), live.region.clone(), live.position)
            });
            if let Some(state) = captured {
                record.state = state;
            }
            record.region = live.region.clone();
            record.position = live.position;
            record.resident = true;
        }
        self.mark_dirty();
        Ok(())
    }

    /// Records the final known state of an instance leaving memory.
    pub fn mark_unloaded(&self, id: EntityId, state: Option<StateBlob>, region: RegionId, position: BlockPos) -> Result<()> {
        {
            let mut tables = self.tables.write()?;
            let record = tables
                .records
                .entry(id)
                .or_insert_with(|| SnapshotRecord::new(id, StateBlob::empty(), region.clone(), position));
            if let Some(state) = state {
                record.state = state;
            }
            record.region = region;
            record.position = position;
            record.resident = false;
        }
        self.mark_dirty();
        Ok(())
    }

    /// An instance became resident again.
    ///
    /// Stale originals replaced by a recreated copy get all their bookkeeping
    /// purged and the caller is told to discard them.
    pub fn mark_resident(
        &self,
        id: EntityId,
        region: RegionId,
        position: BlockPos,
        state: Option<StateBlob>,
    ) -> Result<ResidencyVerdict> {
        let verdict = {
            let mut tables = self.tables.write()?;
            if tables.pending_deletions.contains(&id) || tables.remaps.contains_key(&id) {
                // The remap stays so tokens still carrying `id` keep resolving
                // to the recreated copy.
                tables.records.remove(&id);
                tables.pending_deletions.remove(&id);
                ResidencyVerdict::DiscardStale
            } else if let Some(record) = tables.records.get_mut(&id) {
                record.region = region;
                record.position = position;
                record.resident = true;
                record.deceased = false;
                if let Some(state) = state {
                    record.state = state;
                }
                ResidencyVerdict::Keep
            } else {
                return Ok(ResidencyVerdict::Keep);
            }
        };
        self.mark_dirty();
        Ok(verdict)
    }

    pub fn mark_deceased(&self, id: EntityId) -> Result<()> {
        {
            let mut tables = self.tables.write()?;
            match tables.records.get_mut(&id) {
                Some(record) => {
                    record.deceased = true;
                    record.resident = false;
                }
                None => {
                    tables.records.insert(id, SnapshotRecord::deceased_placeholder(id));
                }
            }
        }
        self.mark_dirty();
        Ok(())
    }

    /// Returns false when `id` is not bound.
    pub fn mark_offline_holder(&self, id: EntityId, name: impl Into<String>) -> Result<bool> {
        {
            let mut tables = self.tables.write()?;
            match tables.records.get_mut(&id) {
                Some(record) => record.offline_holder = Some(name.into()),
                None => return Ok(false),
            }
        }
        self.mark_dirty();
        Ok(true)
    }

    pub fn offline_holder(&self, id: EntityId) -> Option<String> {
        self.get(id).and_then(|record| record.offline_holder)
    }

    /// Stores the outcome of a direct relocation.
    pub fn record_relocation(&self, live: &LiveEntity, state: Option<StateBlob>) -> Result<()> {
        {
            let mut tables = self.tables.write()?;
            let record = tables.records.entry(live.id).or_insert_with(|| {
                SnapshotRecord::new(live.id, StateBlob::empty(), live.region.clone(), live.position)
            });
            record.region = live.region.clone();
            record.position = live.position;
            record.resident = true;
            record.deceased = false;
            record.offline_holder = None;
            if let Some(state) = state {
                record.state = state;
            }
        }
        self.mark_dirty();
        Ok(())
    }

    /// Writes the recreated record and the remap together.
    ///
    /// Earlier identities that resolved to `original` are repointed at the
    /// new copy, so no remap is left targeting a record that may be purged.
    pub fn commit_recreation(&self, original: EntityId, recreated: SnapshotRecord) -> Result<()> {
        {
            let mut tables = self.tables.write()?;
            for target in tables.remaps.values_mut() {
                if *target == original {
                    *target = recreated.id;
                }
            }
            tables.remaps.insert(original, recreated.id);
            tables.records.insert(recreated.id, recreated);
        }
        self.mark_dirty();
        Ok(())
    }

    /// The stale original was discarded: drop its record, keep the remap.
    pub fn retire_original(&self, original: EntityId) -> Result<()> {
        {
            let mut tables = self.tables.write()?;
            tables.records.remove(&original);
            tables.pending_deletions.remove(&original);
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn defer_original_deletion(&self, original: EntityId) -> Result<()> {
        {
            let mut tables = self.tables.write()?;
            tables.pending_deletions.insert(original);
        }
        self.mark_dirty();
        Ok(())
    }

    /// Full purge, including remaps in either direction and pending deletion.
    pub fn remove(&self, id: EntityId) -> Result<bool> {
        let removed = {
            let mut tables = self.tables.write()?;
            let mut removed = tables.purge(id);
            let before = tables.remaps.len();
            tables.remaps.retain(|_, recreated| *recreated != id);
            removed |= tables.remaps.len() != before;
            removed
        };
        if removed {
            self.mark_dirty();
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        *self.tables.write()? = RegistryTables::default();
        self.mark_dirty();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, id: EntityId) -> Option<SnapshotRecord> {
        match self.tables.read() {
            Ok(tables) => tables.records.get(&id).cloned(),
            Err(err) => {
                warn!("Registry lock poisoned: {}", err);
                None
            }
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.tables
            .read()
            .map(|tables| tables.records.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn is_deceased(&self, id: EntityId) -> bool {
        self.get(id).map(|record| record.deceased).unwrap_or(false)
    }

    pub fn remap_of(&self, id: EntityId) -> Option<EntityId> {
        self.tables.read().ok().and_then(|tables| tables.remaps.get(&id).copied())
    }

    pub fn is_pending_deletion(&self, id: EntityId) -> bool {
        self.tables
            .read()
            .map(|tables| tables.pending_deletions.contains(&id))
            .unwrap_or(false)
    }

    /// Follows the remap chain to the identity that currently stands for `id`.
    pub fn resolve(&self, id: EntityId) -> EntityId {
        let Ok(tables) = self.tables.read() else {
            return id;
        };
        let mut current = id;
        // Bounded walk: targets are freshly minted, so a chain can never be
        // longer than the table itself.
        for _ in 0..=tables.remaps.len() {
            match tables.remaps.get(&current) {
                Some(next) => current = *next,
                None => return current,
            }
        }
        warn!("Remap chain starting at {} does not terminate", id);
        current
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|tables| tables.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.tables
            .read()
            .map(|tables| tables.records.keys().copied().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Periodic refresh
    // ------------------------------------------------------------------

    /// Re-snapshots every record whose refresh is due.
    ///
    /// Visits each record once. A concurrent or re-entrant call returns a
    /// skipped report without touching anything.
    pub fn refresh_all(&self, now: u64, host: &dyn EntityHost) -> RefreshReport {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RefreshReport {
                skipped: true,
                ..RefreshReport::default()
            };
        }

        let report = self.refresh_pass(now, host);
        self.refreshing.store(false, Ordering::Release);

        if report.refreshed > 0 || report.marked_unloaded > 0 {
            self.mark_dirty();
        }
        report
    }

    fn refresh_pass(&self, now: u64, host: &dyn EntityHost) -> RefreshReport {
        let mut report = RefreshReport::default();

        let due: Vec<(EntityId, RegionId)> = match self.tables.write() {
            Ok(mut tables) => {
                report.visited = tables.records.len();
                let interval = self.refresh_interval;
                tables
                    .records
                    .values_mut()
                    .filter(|record| record.refresh_due(now, interval))
                    .map(|record| {
                        record.last_refresh_tick = now;
                        (record.id, record.region.clone())
                    })
                    .collect()
            }
            Err(err) => {
                warn!("Registry lock poisoned, skipping refresh: {}", err);
                report.faults += 1;
                return report;
            }
        };

        for (id, region) in due {
            let live = host.find_resident(&region, id).filter(|live| live.alive);
            let captured = match &live {
                Some(live) => match host.capture_state(live) {
                    Ok(state) => Some(state),
                    Err(err) => {
                        warn!("Refresh of {} failed: {}", id, err);
                        report.faults += 1;
                        continue;
                    }
                },
                None => None,
            };

            let Ok(mut tables) = self.tables.write() else {
                report.faults += 1;
                continue;
            };
            // Removed while we were capturing.
            let Some(record) = tables.records.get_mut(&id) else {
                continue;
            };
            match (live, captured) {
                (Some(live), Some(state)) => {
                    record.state = state;
                    record.position = live.position;
                    record.region = live.region;
                    record.resident = true;
                    record.deceased = false;
                    report.refreshed += 1;
                }
                _ => {
                    if record.resident {
                        record.resident = false;
                        report.marked_unloaded += 1;
                    }
                }
            }
        }

        debug!(
            "Refresh pass at tick {}: visited={} refreshed={} unloaded={} faults={}",
            now, report.visited, report.refreshed, report.marked_unloaded, report.faults
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overworld() -> RegionId {
        RegionId::from("minecraft:overworld")
    }

    #[test]
    fn test_store_overwrites_and_clears_markers() {
        let registry = SnapshotRegistry::default();
        let id = EntityId::new_v4();
        registry.store(id, StateBlob::empty(), overworld(), BlockPos::new(1, 2, 3)).unwrap();
        registry.mark_deceased(id).unwrap();
        registry.mark_offline_holder(id, "steve").unwrap();

        registry.store(id, StateBlob::from(vec![9]), overworld(), BlockPos::new(4, 5, 6)).unwrap();

        let record = registry.get(id).unwrap();
        assert!(!record.deceased);
        assert_eq!(record.offline_holder, None);
        assert_eq!(record.position, BlockPos::new(4, 5, 6));
        assert_eq!(record.state.as_bytes(), &[9]);
    }

    #[test]
    fn test_mark_deceased_creates_placeholder() {
        let registry = SnapshotRegistry::default();
        let id = EntityId::new_v4();
        registry.mark_deceased(id).unwrap();
        assert!(registry.is_deceased(id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_offline_holder_requires_binding() {
        let registry = SnapshotRegistry::default();
        let id = EntityId::new_v4();
        assert!(!registry.mark_offline_holder(id, "alex").unwrap());
        registry.store(id, StateBlob::empty(), overworld(), BlockPos::ORIGIN).unwrap();
        assert!(registry.mark_offline_holder(id, "alex").unwrap());
        assert_eq!(registry.offline_holder(id).as_deref(), Some("alex"));
    }

    #[test]
    fn test_resolve_follows_chain() {
        let registry = SnapshotRegistry::default();
        let a = EntityId::new_v4();
        let b = EntityId::new_v4();
        let c = EntityId::new_v4();
        registry
            .commit_recreation(a, SnapshotRecord::new(b, StateBlob::empty(), overworld(), BlockPos::ORIGIN))
            .unwrap();
        registry
            .commit_recreation(b, SnapshotRecord::new(c, StateBlob::empty(), overworld(), BlockPos::ORIGIN))
            .unwrap();

        assert_eq!(registry.resolve(a), c);
        assert_eq!(registry.resolve(b), c);
        assert_eq!(registry.resolve(c), c);
    }

    #[test]
    fn test_mark_resident_discards_pending_original() {
        let registry = SnapshotRegistry::default();
        let original = EntityId::new_v4();
        let copy = EntityId::new_v4();
        registry.store(original, StateBlob::from(vec![1]), overworld(), BlockPos::ORIGIN).unwrap();
        registry
            .commit_recreation(original, SnapshotRecord::new(copy, StateBlob::empty(), overworld(), BlockPos::ORIGIN))
            .unwrap();
        registry.defer_original_deletion(original).unwrap();

        let verdict = registry
            .mark_resident(original, overworld(), BlockPos::ORIGIN, None)
            .unwrap();

        assert_eq!(verdict, ResidencyVerdict::DiscardStale);
        assert!(registry.get(original).is_none());
        assert!(!registry.is_pending_deletion(original));
        assert_eq!(registry.resolve(original), copy);
        assert!(registry.get(copy).is_some());
    }

    #[test]
    fn test_mark_resident_clears_deceased() {
        let registry = SnapshotRegistry::default();
        let id = EntityId::new_v4();
        registry.store(id, StateBlob::empty(), overworld(), BlockPos::ORIGIN).unwrap();
        registry.mark_deceased(id).unwrap();
        let verdict = registry
            .mark_resident(id, overworld(), BlockPos::new(8, 8, 8), None)
            .unwrap();
        assert_eq!(verdict, ResidencyVerdict::Keep);
        let record = registry.get(id).unwrap();
        assert!(!record.deceased);
        assert!(record.resident);
    }

    #[test]
    fn test_remove_purges_remaps_both_ways() {
        let registry = SnapshotRegistry::default();
        let original = EntityId::new_v4();
        let copy = EntityId::new_v4();
        registry
            .commit_recreation(original, SnapshotRecord::new(copy, StateBlob::empty(), overworld(), BlockPos::ORIGIN))
            .unwrap();

        assert!(registry.remove(copy).unwrap());
        assert_eq!(registry.remap_of(original), None);
        assert!(!registry.remove(copy).unwrap());
    }

    #[test]
    fn test_chained_recreation_repoints_older_remaps() {
        let registry = SnapshotRegistry::default();
        let first = EntityId::new_v4();
        let second = EntityId::new_v4();
        let third = EntityId::new_v4();
        registry.store(first, StateBlob::from(vec![1]), overworld(), BlockPos::ORIGIN).unwrap();
        registry
            .commit_recreation(first, SnapshotRecord::new(second, StateBlob::from(vec![1]), overworld(), BlockPos::ORIGIN))
            .unwrap();
        registry.retire_original(first).unwrap();
        registry
            .commit_recreation(second, SnapshotRecord::new(third, StateBlob::from(vec![1]), overworld(), BlockPos::ORIGIN))
            .unwrap();
        registry.defer_original_deletion(second).unwrap();

        assert_eq!(registry.remap_of(first), Some(third));
        assert_eq!(registry.remap_of(second), Some(third));

        let verdict = registry
            .mark_resident(second, overworld(), BlockPos::ORIGIN, None)
            .unwrap();
        assert_eq!(verdict, ResidencyVerdict::DiscardStale);

        let tables = registry.export_tables().unwrap();
        for target in tables.remaps.values() {
            assert!(tables.records.contains_key(target), "remap targets missing record {}", target);
        }
        assert_eq!(registry.resolve(first), third);
    }
}
