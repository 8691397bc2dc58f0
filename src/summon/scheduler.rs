//! Retry jobs that wait for a region to page in before giving up.

use crate::core::{BlockPos, EntityId, HolderRef, Placement, RegionId, Result};
use crate::host::{EntityHost, LiveEntity, PagingTicket, RegionPager};
use crate::storage::SnapshotRegistry;
use crate::summon::outcome::SummonOutcome;
use crate::summon::relocation::relocate;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Waiting,
    Resolved,
    Exhausted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Resolved | JobState::Exhausted)
    }
}

/// One in-flight summon. Never persisted.
#[derive(Debug)]
pub struct RetryJob {
    pub id: JobId,
    pub entity: EntityId,
    pub holder: HolderRef,
    pub region: RegionId,
    pub destination: Placement,
    pub remaining: u32,
    pub state: JobState,
    ticket: Option<PagingTicket>,
}

/// What a single check of a waiting job asks the scheduler to do.
#[derive(Debug, PartialEq)]
pub(crate) enum Step {
    Idle,
    Exhausted,
    Found(LiveEntity),
    StillWaiting,
}

impl RetryJob {
    fn new(id: JobId, request: &RetrievalRequest, max_attempts: u32) -> Self {
        Self {
            id,
            entity: request.entity,
            holder: request.holder.clone(),
            region: request.region.clone(),
            destination: request.destination.clone(),
            remaining: max_attempts,
            state: JobState::Created,
            ticket: None,
        }
    }

    /// Consumes one attempt and probes for residency unless out of attempts.
    pub(crate) fn advance(&mut self, probe: impl FnOnce(&RegionId, EntityId) -> Option<LiveEntity>) -> Step {
        if self.state.is_terminal() {
            return Step::Idle;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.state = JobState::Exhausted;
            return Step::Exhausted;
        }
        match probe(&self.region, self.entity) {
            Some(live) => Step::Found(live),
            None => {
                self.state = JobState::Waiting;
                Step::StillWaiting
            }
        }
    }

    /// Releases the paging ticket if one is still held. Safe to call twice.
    fn release_ticket(&mut self, pager: &dyn RegionPager) {
        if let Some(ticket) = self.ticket.take() {
            pager.release(&ticket);
        }
    }

    pub fn holds_ticket(&self) -> bool {
        self.ticket.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub entity: EntityId,
    pub holder: HolderRef,
    /// Region the entity was last seen in.
    pub region: RegionId,
    /// Area to page in.
    pub around: BlockPos,
    /// Where the entity goes once found.
    pub destination: Placement,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scheduled {
    /// Found during the creation check and relocated synchronously.
    Resolved(SummonOutcome),
    Deferred(JobId),
}

/// Completion notice for a job that reached a terminal state during a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job: JobId,
    pub entity: EntityId,
    pub holder: HolderRef,
    pub state: JobState,
    pub outcome: SummonOutcome,
}

/// Everything a scheduler step needs from the outside world.
pub struct SchedulerContext<'a> {
    pub host: &'a dyn EntityHost,
    pub pager: &'a dyn RegionPager,
    pub registry: &'a SnapshotRegistry,
}

pub struct RetrievalScheduler {
    jobs: Mutex<HashMap<JobId, RetryJob>>,
    next_id: AtomicU64,
    max_attempts: u32,
}

impl Default for RetrievalScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetrievalScheduler {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Requests page-in, checks residency once, and only then queues a job.
    ///
    /// Fails without creating a job when the region cannot be paged in.
    pub fn schedule(&self, request: RetrievalRequest, ctx: &SchedulerContext<'_>) -> Result<Scheduled> {
        let ticket = ctx.pager.request(&request.region, request.around, &request.holder)?;

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut job = RetryJob::new(id, &request, self.max_attempts);
        job.ticket = Some(ticket);

        if let Some(live) = ctx.host.find_resident(&job.region, job.entity) {
            let outcome = Self::hand_off(&mut job, live, ctx);
            debug!("{} for {} resolved on creation: {}", id, job.entity, outcome);
            return Ok(Scheduled::Resolved(outcome));
        }

        job.state = JobState::Waiting;
        match self.jobs.lock() {
            Ok(mut jobs) => {
                jobs.insert(id, job);
            }
            Err(err) => {
                job.release_ticket(ctx.pager);
                return Err(err.into());
            }
        }
        debug!("{} queued for {} in {}", id, request.entity, request.region);
        Ok(Scheduled::Deferred(id))
    }

    /// Performs one check per waiting job and returns the jobs that finished.
    ///
    /// Jobs queued while the pass runs wait for the next tick.
    pub fn tick(&self, ctx: &SchedulerContext<'_>) -> Vec<JobReport> {
        let batch: Vec<RetryJob> = match self.jobs.lock() {
            Ok(mut jobs) => jobs.drain().map(|(_, job)| job).collect(),
            Err(err) => {
                warn!("Job table lock poisoned: {}", err);
                return Vec::new();
            }
        };

        let mut reports = Vec::new();
        let mut survivors = Vec::new();

        for mut job in batch {
            if ctx.registry.is_deceased(job.entity) {
                job.release_ticket(ctx.pager);
                job.state = JobState::Exhausted;
                reports.push(Self::report(&job, SummonOutcome::Deceased));
                continue;
            }

            match job.advance(|region, entity| ctx.host.find_resident(region, entity)) {
                Step::Idle => {}
                Step::Exhausted => {
                    job.release_ticket(ctx.pager);
                    debug!("{} for {} exhausted", job.id, job.entity);
                    reports.push(Self::report(&job, SummonOutcome::NotYetFound));
                }
                Step::Found(live) => {
                    let outcome = Self::hand_off(&mut job, live, ctx);
                    reports.push(Self::report(&job, outcome));
                }
                Step::StillWaiting => survivors.push(job),
            }
        }

        if !survivors.is_empty() {
            match self.jobs.lock() {
                Ok(mut jobs) => {
                    for job in survivors {
                        jobs.insert(job.id, job);
                    }
                }
                Err(err) => {
                    warn!("Job table lock poisoned, dropping {} jobs: {}", survivors.len(), err);
                    for mut job in survivors {
                        job.release_ticket(ctx.pager);
                    }
                }
            }
        }

        reports
    }

    /// Relocates the found instance, ending the job either way.
    fn hand_off(job: &mut RetryJob, live: LiveEntity, ctx: &SchedulerContext<'_>) -> SummonOutcome {
        let destination = ctx
            .host
            .locate_holder(&job.holder)
            .unwrap_or_else(|| job.destination.clone());
        let outcome = match relocate(ctx.host, ctx.registry, &live, &destination) {
            Ok(_) => SummonOutcome::Success,
            Err(err) => {
                warn!("{} found {} but relocation failed: {}", job.id, job.entity, err);
                SummonOutcome::from_error(&err)
            }
        };
        job.release_ticket(ctx.pager);
        job.state = JobState::Resolved;
        outcome
    }

    fn report(job: &RetryJob, outcome: SummonOutcome) -> JobReport {
        JobReport {
            job: job.id,
            entity: job.entity,
            holder: job.holder.clone(),
            state: job.state,
            outcome,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.lock().map(|jobs| jobs.contains_key(&id)).unwrap_or(false)
    }

    pub fn job_state(&self, id: JobId) -> Option<(JobState, u32)> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(&id).map(|job| (job.state, job.remaining)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job(attempts: u32) -> RetryJob {
        let request = RetrievalRequest {
            entity: EntityId::new_v4(),
            holder: HolderRef::new(Uuid::new_v4(), "alex"),
            region: RegionId::from("minecraft:overworld"),
            around: BlockPos::ORIGIN,
            destination: Placement::new("minecraft:overworld", 0.0, 64.0, 0.0),
        };
        RetryJob::new(JobId(1), &request, attempts)
    }

    #[test]
    fn test_advance_exhausts_after_budget() {
        let mut job = job(3);
        assert_eq!(job.advance(|_, _| None), Step::StillWaiting);
        assert_eq!(job.advance(|_, _| None), Step::StillWaiting);
        assert_eq!(job.advance(|_, _| None), Step::Exhausted);
        assert_eq!(job.state, JobState::Exhausted);
    }

    #[test]
    fn test_advance_is_idle_after_terminal_state() {
        let mut job = job(1);
        assert_eq!(job.advance(|_, _| None), Step::Exhausted);
        let mut probed = false;
        assert_eq!(
            job.advance(|_, _| {
                probed = true;
                None
            }),
            Step::Idle
        );
        assert!(!probed);
        assert_eq!(job.remaining, 0);
    }

    #[test]
    fn test_final_attempt_does_not_probe() {
        let mut job = job(1);
        let step = job.advance(|region, entity| Some(LiveEntity::new(entity, region.clone(), BlockPos::ORIGIN)));
        assert_eq!(step, Step::Exhausted);
    }
}
