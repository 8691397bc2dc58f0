use crate::core::{BlockPos, RegionId, SnapshotRecord};
use crate::summon::outcome::SummonOutcome;
use serde::{Deserialize, Serialize};

/// Which requester regions may summon at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RegionRule {
    Any,
    #[default]
    SameRegion,
    AllowList,
    DenyList,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SummonPolicy {
    /// Maximum summon distance in blocks; negative means unlimited.
    pub max_distance: i32,
    pub region_rule: RegionRule,
    /// Region ids consulted by `AllowList` and `DenyList`.
    pub regions: Vec<RegionId>,
}

impl Default for SummonPolicy {
    fn default() -> Self {
        Self {
            max_distance: 10_000,
            region_rule: RegionRule::SameRegion,
            regions: Vec::new(),
        }
    }
}

impl SummonPolicy {
    pub fn unlimited() -> Self {
        Self {
            max_distance: -1,
            region_rule: RegionRule::Any,
            regions: Vec::new(),
        }
    }

    pub fn max_distance(mut self, max_distance: i32) -> Self {
        self.max_distance = max_distance;
        self
    }

    pub fn region_rule(mut self, rule: RegionRule) -> Self {
        self.region_rule = rule;
        self
    }

    pub fn regions<I, R>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RegionId>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRejection {
    NoBinding,
    Deceased,
    InvalidRegion,
    TooFar,
}

impl From<PolicyRejection> for SummonOutcome {
    fn from(rejection: PolicyRejection) -> Self {
        match rejection {
            PolicyRejection::NoBinding => SummonOutcome::NoBinding,
            PolicyRejection::Deceased => SummonOutcome::Deceased,
            PolicyRejection::InvalidRegion => SummonOutcome::InvalidRegion,
            PolicyRejection::TooFar => SummonOutcome::TooFar,
        }
    }
}

/// Stateless gate applied before any retrieval is attempted.
pub struct SummonPolicyEngine;

impl SummonPolicyEngine {
    /// Returns the first failing check: binding, region rule, then distance.
    pub fn validate(
        requester_region: &RegionId,
        requester_position: BlockPos,
        record: Option<&SnapshotRecord>,
        policy: &SummonPolicy,
    ) -> Result<(), PolicyRejection> {
        let record = record.ok_or(PolicyRejection::NoBinding)?;
        if record.deceased {
            return Err(PolicyRejection::Deceased);
        }

        let region_allowed = match policy.region_rule {
            RegionRule::Any => true,
            RegionRule::SameRegion => *requester_region == record.region,
            RegionRule::AllowList => policy.regions.contains(requester_region),
            RegionRule::DenyList => !policy.regions.contains(requester_region),
        };
        if !region_allowed {
            return Err(PolicyRejection::InvalidRegion);
        }

        if policy.max_distance >= 0 {
            if *requester_region != record.region {
                return Err(PolicyRejection::TooFar);
            }
            let max = i64::from(policy.max_distance);
            if requester_position.planar_distance_sq(&record.position) > max * max {
                return Err(PolicyRejection::TooFar);
            }
        }

        Ok(())
    }
}
