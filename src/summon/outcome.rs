use crate::core::TetherError;
use std::fmt;

/// Result of a summon as reported to the triggering tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SummonOutcome {
    Success,
    NoBinding,
    Deceased,
    TooFar,
    InvalidRegion,
    /// Deferred to the retrieval scheduler, or given up after waiting.
    NotYetFound,
    RecreateFailed,
}

impl SummonOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            SummonOutcome::Success => "SUCCESS",
            SummonOutcome::NoBinding => "NO_BINDING",
            SummonOutcome::Deceased => "DECEASED",
            SummonOutcome::TooFar => "TOO_FAR",
            SummonOutcome::InvalidRegion => "INVALID_REGION",
            SummonOutcome::NotYetFound => "NOT_YET_FOUND",
            SummonOutcome::RecreateFailed => "RECREATE_FAILED",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SummonOutcome::Success)
    }

    /// Outcome reported when an operation on the way to a summon failed.
    pub fn from_error(err: &TetherError) -> Self {
        match err {
            TetherError::RegionNotFound(_) => SummonOutcome::InvalidRegion,
            TetherError::EntityNotFound(_) => SummonOutcome::NoBinding,
            _ => SummonOutcome::RecreateFailed,
        }
    }
}

impl fmt::Display for SummonOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
