pub mod outcome;
pub mod policy;
pub mod recreation;
pub mod relocation;
pub mod scheduler;

pub use outcome::SummonOutcome;
pub use policy::{PolicyRejection, RegionRule, SummonPolicy, SummonPolicyEngine};
pub use recreation::{JsonCompoundPatcher, RecreationProtocol, StatePatcher};
pub use relocation::relocate;
pub use scheduler::{
    DEFAULT_MAX_ATTEMPTS, JobId, JobReport, JobState, RetrievalRequest, RetrievalScheduler,
    RetryJob, Scheduled, SchedulerContext,
};
