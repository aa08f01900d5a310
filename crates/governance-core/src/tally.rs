//! Vote counting and pluggable resolution rules.

use serde::{Deserialize, Serialize};

use crate::VoteChoice;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tally {
    pub affirm: u32,
    pub reject: u32,
    pub abstain: u32,
    pub distinct_voters: u32,
}

impl Tally {
    /// Counts one choice per voter; callers pass the latest vote of each voter.
    pub fn from_choices<I>(choices: I) -> Self
    where
        I: IntoIterator<Item = VoteChoice>,
    {
        let mut tally = Self::default();
        for choice in choices {
            tally.record(choice);
        }
        tally
    }

    pub fn record(&mut self, choice: VoteChoice) {
        match choice {
            VoteChoice::Affirm => self.affirm = self.affirm.saturating_add(1),
            VoteChoice::Reject => self.reject = self.reject.saturating_add(1),
            VoteChoice::Abstain => self.abstain = self.abstain.saturating_add(1),
        }
        self.distinct_voters = self.distinct_voters.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    QuorumNotMet,
    Tie,
    MajorityAgainst,
    SupermajorityNotReached,
}

impl RejectionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuorumNotMet => "quorum-not-met",
            Self::Tie => "tie-status-quo",
            Self::MajorityAgainst => "majority-against",
            Self::SupermajorityNotReached => "supermajority-not-reached",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected(RejectionReason),
}

impl Decision {
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::Accepted => "majority-affirm",
            Self::Rejected(reason) => reason.as_str(),
        }
    }
}

/// Turns a tally into an outcome. Implementations MUST be pure: the same
/// tally always yields the same decision.
pub trait ResolutionRule: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn resolve(&self, tally: &Tally) -> Decision;
}

/// Accept iff at least `quorum` distinct voters took part and affirm
/// strictly outnumbers reject. Ties reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MajorityWithQuorum {
    pub quorum: u32,
}

impl ResolutionRule for MajorityWithQuorum {
    fn name(&self) -> &'static str {
        "majority_with_quorum"
    }

    fn resolve(&self, tally: &Tally) -> Decision {
        if tally.distinct_voters < self.quorum {
            return Decision::Rejected(RejectionReason::QuorumNotMet);
        }
        match tally.affirm.cmp(&tally.reject) {
            std::cmp::Ordering::Greater => Decision::Accepted,
            std::cmp::Ordering::Equal => Decision::Rejected(RejectionReason::Tie),
            std::cmp::Ordering::Less => Decision::Rejected(RejectionReason::MajorityAgainst),
        }
    }
}

/// Accept iff quorum is met and affirm holds at least `ratio` of the
/// decisive (non-abstaining) votes. Abstentions count toward quorum only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Supermajority {
    pub quorum: u32,
    pub ratio: f64,
}

impl ResolutionRule for Supermajority {
    fn name(&self) -> &'static str {
        "supermajority"
    }

    fn resolve(&self, tally: &Tally) -> Decision {
        if tally.distinct_voters < self.quorum {
            return Decision::Rejected(RejectionReason::QuorumNotMet);
        }
        if tally.affirm == tally.reject {
            return Decision::Rejected(RejectionReason::Tie);
        }
        let decisive = f64::from(tally.affirm) + f64::from(tally.reject);
        if tally.affirm > tally.reject && f64::from(tally.affirm) >= self.ratio * decisive {
            Decision::Accepted
        } else {
            Decision::Rejected(RejectionReason::SupermajorityNotReached)
        }
    }
}
