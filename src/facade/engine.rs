use crate::config::EngineConfig;
use crate::core::{BindingView, BlockPos, EntityId, HolderRef, Placement, RegionId, Result, StateBlob};
use crate::facade::token::BindingToken;
use crate::host::{EntityHost, LiveEntity, RegionPager};
use crate::storage::{
    FlushPolicy, FlushWorker, PersistenceLayer, RefreshReport, ResidencyVerdict, SnapshotRegistry,
    spawn_flush_worker,
};
use crate::summon::{
    JobId, JobReport, JsonCompoundPatcher, RecreationProtocol, RetrievalRequest, RetrievalScheduler,
    Scheduled, SchedulerContext, StatePatcher, SummonOutcome, SummonPolicyEngine, relocate,
};
use log::{info, warn};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Level, event, info_span};

/// Answer to a summon request.
#[derive(Debug, Clone, PartialEq)]
pub struct SummonResponse {
    pub outcome: SummonOutcome,
    /// Identity the request resolved to after following remaps.
    pub entity: EntityId,
    /// Set when the summon was deferred to the scheduler.
    pub job: Option<JobId>,
}

/// How a carried reference relates to a freshly loaded instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelinkOutcome {
    /// The token already names the candidate; its record was refreshed.
    Current,
    /// The token should carry this identity from now on.
    Rebound(EntityId),
    /// The candidate is some other entity.
    Mismatch,
    /// Nothing is bound under this identity.
    Unbound,
}

/// One coarse engine pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub refresh: RefreshReport,
    pub jobs: Vec<JobReport>,
}

/// Entry point wiring the registry, persistence and summon machinery to the
/// host simulation.
pub struct TetherEngine {
    config: EngineConfig,
    registry: Arc<SnapshotRegistry>,
    scheduler: RetrievalScheduler,
    host: Arc<dyn EntityHost>,
    pager: Arc<dyn RegionPager>,
    patcher: Box<dyn StatePatcher>,
    worker: Mutex<Option<FlushWorker>>,
    /// Debounced flushing without a worker falls back to flushing per pass.
    flush_on_pass: AtomicBool,
}

impl TetherEngine {
    pub fn new(mut config: EngineConfig, host: Arc<dyn EntityHost>, pager: Arc<dyn RegionPager>) -> Self {
        if config.tick_interval == 0 {
            warn!("tick_interval of 0 is invalid; running an engine pass every host tick");
            config.tick_interval = 1;
        }
        let registry = Arc::new(SnapshotRegistry::new(config.refresh_interval_ticks));
        let scheduler = RetrievalScheduler::new(config.max_attempts);
        Self {
            config,
            registry,
            scheduler,
            host,
            pager,
            patcher: Box::new(JsonCompoundPatcher::default()),
            worker: Mutex::new(None),
            flush_on_pass: AtomicBool::new(false),
        }
    }

    pub fn with_patcher(mut self, patcher: impl StatePatcher + 'static) -> Self {
        self.patcher = Box::new(patcher);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SnapshotRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &RetrievalScheduler {
        &self.scheduler
    }

    fn scheduler_context(&self) -> SchedulerContext<'_> {
        SchedulerContext {
            host: self.host.as_ref(),
            pager: self.pager.as_ref(),
            registry: &self.registry,
        }
    }

    // ========================================================================
    // Host lifecycle
    // ========================================================================

    /// Loads the durable file under `state_root` and enables persistence.
    pub fn on_start(&self, state_root: &Path) -> Result<()> {
        self.config.validate()?;
        let path = self.config.durable_path(state_root);
        let layer = PersistenceLayer::initialize(
            &path,
            self.config.flush,
            &self.registry,
            &self.config.default_region,
        )?;
        info!(
            "Bound entity storage ready at {} ({} records)",
            layer.path().display(),
            self.registry.len()
        );

        if let FlushPolicy::Debounced { .. } = self.config.flush {
            if tokio::runtime::Handle::try_current().is_ok() {
                let worker = spawn_flush_worker(Arc::clone(&self.registry))?;
                *self.worker.lock()? = Some(worker);
            } else {
                warn!("No Tokio runtime for the flush worker; flushing once per engine pass");
                self.flush_on_pass.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Stops background flushing and writes the registry one last time.
    pub fn on_stop(&self) -> Result<()> {
        if let Some(worker) = self.worker.lock()?.take() {
            worker.halt();
        }
        self.registry.flush()?;
        info!("Bound entity storage flushed");
        Ok(())
    }

    /// Runs an engine pass on every `tick_interval`-th host tick.
    pub fn on_host_tick(&self, host_tick: u64) -> Vec<JobReport> {
        if host_tick % self.config.tick_interval != 0 {
            return Vec::new();
        }
        self.run_pass(host_tick).jobs
    }

    /// Refreshes every record, then steps every job.
    pub fn run_pass(&self, now: u64) -> PassReport {
        let span = info_span!("tether_pass", now);
        let _entered = span.enter();

        let refresh = self.registry.refresh_all(now, self.host.as_ref());
        let jobs = self.scheduler.tick(&self.scheduler_context());
        event!(
            Level::DEBUG,
            refreshed = refresh.refreshed,
            unloaded = refresh.marked_unloaded,
            finished_jobs = jobs.len(),
            "engine pass complete"
        );

        if self.flush_on_pass.load(Ordering::Acquire) {
            if let Some(layer) = self.registry.persistence() {
                if layer.take_dirty() {
                    if let Err(err) = self.registry.flush() {
                        warn!("Flush during engine pass failed: {}", err);
                    }
                }
            }
        }

        PassReport { refresh, jobs }
    }

    // ========================================================================
    // Region lifecycle
    // ========================================================================

    /// An instance became resident. Stale originals are discarded here.
    pub fn on_entity_loaded(&self, live: &LiveEntity) -> ResidencyVerdict {
        let tracked = self.registry.contains(live.id)
            || self.registry.is_pending_deletion(live.id)
            || self.registry.remap_of(live.id).is_some();
        if !tracked {
            return ResidencyVerdict::Keep;
        }

        let state = self.capture(live);
        let verdict = match self
            .registry
            .mark_resident(live.id, live.region.clone(), live.position, state)
        {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!("Failed to record {} as resident: {}", live.id, err);
                return ResidencyVerdict::Keep;
            }
        };

        if verdict == ResidencyVerdict::DiscardStale {
            info!("Discarding stale original {} in {}", live.id, live.region);
            if let Err(err) = self.host.discard(live) {
                warn!("Failed to discard stale original {}: {}", live.id, err);
            }
        }
        verdict
    }

    pub fn on_entity_unloaded(&self, live: &LiveEntity) {
        if !self.registry.contains(live.id) {
            return;
        }
        let state = self.capture(live);
        if let Err(err) = self
            .registry
            .mark_unloaded(live.id, state, live.region.clone(), live.position)
        {
            warn!("Failed to record {} as unloaded: {}", live.id, err);
        }
    }

    pub fn on_entity_died(&self, id: EntityId) {
        if let Err(err) = self.registry.mark_deceased(id) {
            warn!("Failed to mark {} deceased: {}", id, err);
        }
    }

    /// Remembers who was riding a bound entity when they left.
    pub fn on_holder_disconnect(&self, holder: &HolderRef, vehicle: Option<EntityId>) {
        let Some(vehicle) = vehicle else {
            return;
        };
        match self.registry.mark_offline_holder(vehicle, holder.name.clone()) {
            Ok(true) => info!("{} disconnected while riding {}", holder.name, vehicle),
            Ok(false) => {}
            Err(err) => warn!("Failed to record offline holder for {}: {}", vehicle, err),
        }
    }

    fn capture(&self, live: &LiveEntity) -> Option<StateBlob> {
        match self.host.capture_state(live) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!("Failed to capture state of {}: {}", live.id, err);
                None
            }
        }
    }

    // ========================================================================
    // Token interface
    // ========================================================================

    pub fn bind(&self, id: EntityId, state: StateBlob, region: RegionId, position: BlockPos) -> Result<BindingToken> {
        self.registry.store(id, state, region.clone(), position)?;
        info!("Bound {} at {} in {}", id, position, region);
        Ok(BindingToken::new(id, region, position))
    }

    /// Binds a resident instance, capturing its state first.
    pub fn bind_live(&self, live: &LiveEntity) -> Result<BindingToken> {
        let state = self.capture(live).unwrap_or_default();
        let token = self.bind(live.id, state, live.region.clone(), live.position)?;
        self.registry.update_from_live(live, self.host.as_ref())?;
        Ok(token)
    }

    /// Drops the binding behind `id`, including any recreated copy's record.
    pub fn unbind(&self, id: EntityId) -> Result<bool> {
        let resolved = self.registry.resolve(id);
        let mut removed = self.registry.remove(resolved)?;
        if resolved != id {
            removed |= self.registry.remove(id)?;
        }
        Ok(removed)
    }

    pub fn summon(&self, holder: &HolderRef, at: &Placement, id: EntityId) -> SummonOutcome {
        self.request_summon(holder, at, id).outcome
    }

    /// Summons the entity bound under `id` to `at`.
    ///
    /// Order: remap, policy, direct relocation, page-in and wait, and
    /// recreation only when the region cannot be paged in.
    pub fn request_summon(&self, holder: &HolderRef, at: &Placement, id: EntityId) -> SummonResponse {
        let resolved = self.registry.resolve(id);
        let respond = |outcome: SummonOutcome, job: Option<JobId>| SummonResponse {
            outcome,
            entity: resolved,
            job,
        };

        let record = self.registry.get(resolved);
        if let Err(rejection) =
            SummonPolicyEngine::validate(&at.region, at.block_pos(), record.as_ref(), &self.config.policy)
        {
            return respond(rejection.into(), None);
        }
        let Some(record) = record else {
            return respond(SummonOutcome::NoBinding, None);
        };

        if !self.host.region_exists(&record.region) {
            return respond(SummonOutcome::InvalidRegion, None);
        }

        if let Some(live) = self.host.find_resident(&record.region, resolved) {
            let outcome = match relocate(self.host.as_ref(), &self.registry, &live, at) {
                Ok(_) => SummonOutcome::Success,
                Err(err) => {
                    warn!("Relocating {} failed: {}", resolved, err);
                    SummonOutcome::from_error(&err)
                }
            };
            return respond(outcome, None);
        }

        let request = RetrievalRequest {
            entity: resolved,
            holder: holder.clone(),
            region: record.region.clone(),
            around: record.position,
            destination: at.clone(),
        };
        match self.scheduler.schedule(request, &self.scheduler_context()) {
            Ok(Scheduled::Resolved(outcome)) => respond(outcome, None),
            Ok(Scheduled::Deferred(job)) => respond(SummonOutcome::NotYetFound, Some(job)),
            Err(err) => {
                info!(
                    "Region {} cannot be paged in ({}); recreating {} from snapshot",
                    record.region, err, resolved
                );
                let protocol = RecreationProtocol::new(&self.registry, self.host.as_ref(), self.patcher.as_ref());
                match protocol.recreate(resolved, at) {
                    Ok(new_id) => SummonResponse {
                        outcome: SummonOutcome::Success,
                        entity: new_id,
                        job: None,
                    },
                    Err(err) => {
                        warn!("Recreating {} failed: {}", resolved, err);
                        let outcome = match SummonOutcome::from_error(&err) {
                            SummonOutcome::InvalidRegion => SummonOutcome::InvalidRegion,
                            _ => SummonOutcome::RecreateFailed,
                        };
                        respond(outcome, None)
                    }
                }
            }
        }
    }

    /// Tooltip view of whatever `id` currently stands for.
    pub fn display_state(&self, id: EntityId) -> Option<BindingView> {
        self.registry.get(self.registry.resolve(id)).map(|record| record.display())
    }

    /// Reconciles a carried identity against a freshly loaded instance.
    pub fn relink(&self, id: EntityId, candidate: &LiveEntity) -> RelinkOutcome {
        let resolved = self.registry.resolve(id);
        if !self.registry.contains(resolved) {
            return RelinkOutcome::Unbound;
        }

        if candidate.id == resolved {
            if let Err(err) = self.registry.update_from_live(candidate, self.host.as_ref()) {
                warn!("Failed to refresh {} during relink: {}", resolved, err);
            }
            return if resolved == id {
                RelinkOutcome::Current
            } else {
                RelinkOutcome::Rebound(resolved)
            };
        }

        if resolved != id {
            RelinkOutcome::Rebound(resolved)
        } else {
            RelinkOutcome::Mismatch
        }
    }
}
