pub mod backend;
pub mod problem;
pub mod two_pass;

use crate::constants::SLACK_WEIGHTS_DEFAULT;
use crate::constraints::ConstraintId;
use crate::structure::{Label, Representation};
use serde::{Deserialize, Serialize};

/// Threshold enforced by the exact pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass2Slack {
    /// d ± pass-1 slack
    #[default]
    Keep,
    /// bare clinical threshold d
    Drop,
}

/// Planner switches
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub use_slack: bool,
    pub use_2pass: bool,
    pub pass2_slack: Pass2Slack,
    /// slack penalty per priority; index = priority, priority 0 stays hard
    pub slack_weights: Vec<f64>,
    /// representation every structure is switched to before planning;
    /// `None` keeps each structure's own selection
    pub representation: Option<Representation>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            use_slack: true,
            use_2pass: false,
            pass2_slack: Pass2Slack::Keep,
            slack_weights: SLACK_WEIGHTS_DEFAULT.to_vec(),
            representation: None,
        }
    }
}

impl PlanOptions {
    /// Slack penalty for `priority`; priorities past the table reuse its
    /// last entry. `None` means the constraint gets no slack variable.
    pub fn slack_weight(&self, priority: u8) -> Option<f64> {
        if !self.use_slack || priority == 0 {
            return None;
        }
        let w = self
            .slack_weights
            .get(priority as usize)
            .or(self.slack_weights.last())
            .copied()?;
        (w > 0.0).then_some(w)
    }
}

/// Result of one convex solve.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassResult {
    pub x: Vec<f64>,
    pub objective: f64,
    /// per (structure, constraint); empty for the exact pass
    pub slacks: Vec<(Label, ConstraintId, f64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConstraintOutcome {
    pub structure: Label,
    pub id: ConstraintId,
    pub constraint: String,
    /// threshold enforced in the final pass
    pub threshold: f64,
    pub achieved: Option<f64>,
    pub slack: f64,
    /// against the clinical threshold, not the relaxed one
    pub satisfied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    /// final beam intensities
    pub x: Vec<f64>,
    pub objective: f64,
    pub pass1: PassResult,
    pub pass2: Option<PassResult>,
    pub constraints: Vec<ConstraintOutcome>,
}

impl PlanReport {
    pub fn all_satisfied(&self) -> bool {
        self.constraints.iter().all(|c| c.satisfied)
    }
}

pub use backend::MicroLpSolver;
pub use problem::{ConvexSolver, Problem, SolveOutcome, SolveStatus};
pub use two_pass::Planner;
