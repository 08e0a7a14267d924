//! Phase definitions for the delivery pipeline.
//!
//! This module provides:
//! - The `Phase` enum naming every known pipeline phase
//! - The static dependency table (which phases must succeed first)
//! - The per-phase retry budget defaults
//!
//! The pipeline shape is fixed: a linear spine from discovery through
//! development, a parallel-eligible pair (unit tests and UI review) fanning
//! out of development, and a linear tail from review through infrastructure
//! validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One phase of the delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Explore the request and produce a problem statement
    Discovery,
    /// Decide what is in and out of scope
    Scoping,
    /// Produce the implementation plan and stories
    Planning,
    /// Implement the planned changes
    Development,
    /// Run the unit test suite with automated resolution
    UnitTests,
    /// Review the rendered UI against the design
    UiReview,
    /// Run the end-to-end suite with automated resolution
    E2eTests,
    /// Review the implementation against the plan
    Review,
    /// Deploy the built artifacts
    Deploy,
    /// Validate the deployed infrastructure
    InfraValidation,
}

impl Phase {
    /// All phases in canonical pipeline order.
    pub const ALL: [Phase; 10] = [
        Phase::Discovery,
        Phase::Scoping,
        Phase::Planning,
        Phase::Development,
        Phase::UnitTests,
        Phase::UiReview,
        Phase::E2eTests,
        Phase::Review,
        Phase::Deploy,
        Phase::InfraValidation,
    ];

    /// Phases that must have succeeded before this one may start.
    pub fn depends_on(&self) -> &'static [Phase] {
        match self {
            Phase::Discovery => &[],
            Phase::Scoping => &[Phase::Discovery],
            Phase::Planning => &[Phase::Scoping],
            Phase::Development => &[Phase::Planning],
            Phase::UnitTests => &[Phase::Development],
            Phase::UiReview => &[Phase::Development],
            Phase::E2eTests => &[Phase::UnitTests],
            Phase::Review => &[Phase::E2eTests, Phase::UiReview],
            Phase::Deploy => &[Phase::Review],
            Phase::InfraValidation => &[Phase::Deploy],
        }
    }

    /// Phases that list this one as a dependency.
    pub fn dependents(&self) -> Vec<Phase> {
        Phase::ALL
            .iter()
            .copied()
            .filter(|p| p.depends_on().contains(self))
            .collect()
    }

    /// Whether this phase may run concurrently with others that share its
    /// exact precondition set.
    pub fn parallel_eligible(&self) -> bool {
        matches!(self, Phase::UnitTests | Phase::UiReview)
    }

    /// Default retry budget for this phase.
    ///
    /// Phases with an automated resolution path get more than one attempt;
    /// everything else fails terminally on the first failure.
    pub fn default_max_attempts(&self) -> u32 {
        match self {
            Phase::UnitTests => 4,
            Phase::E2eTests => 2,
            Phase::Review => 3,
            _ => 1,
        }
    }

    /// Stable wire/storage name for this phase.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Scoping => "scoping",
            Phase::Planning => "planning",
            Phase::Development => "development",
            Phase::UnitTests => "unit_tests",
            Phase::UiReview => "ui_review",
            Phase::E2eTests => "e2e_tests",
            Phase::Review => "review",
            Phase::Deploy => "deploy",
            Phase::InfraValidation => "infra_validation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown phase '{}'", s))
    }
}
