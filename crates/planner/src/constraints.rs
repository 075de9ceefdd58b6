//! Dose-volume constraints and their convex forms.
//!
//! A percentile constraint "at most p% of voxels above d" is not convex. In
//! the relaxed form it is replaced by the CVaR restriction
//!
//!   Σ_i w_i · pos(β + σ(a_i x − d) − s) ≤ β · f · |S|,   β ≥ 0
//!
//! where σ = +1 for upper and −1 for lower bounds, f is the fraction of the
//! structure allowed on the violating side and s is an optional slack. Any
//! feasible point of the restriction satisfies the percentile constraint at
//! threshold d ± s. The exact form fixes a voxel subset and bounds each of its
//! rows individually.

use crate::constants::{DOSE_TOLERANCE, PRIORITY_DEFAULT};
use crate::error::{PlanError, Result};
use crate::optimize::problem::{LinearExpr, Problem, VarId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Constraint key, unique within a structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConstraintId(pub u32);

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Relation {
    AtMost,
    AtLeast,
}

impl Relation {
    fn sign(self) -> f64 {
        match self {
            Relation::AtMost => 1.0,
            Relation::AtLeast => -1.0,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Relation::AtMost => "<=",
            Relation::AtLeast => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum DoseSelector {
    /// D_p, p in (0, 100)
    Percentile(f64),
    Mean,
}

/// `DosePercent(30.0).at_most(1.05)`: D30 <= 1.05
#[derive(Debug, Clone, Copy)]
pub struct DosePercent(pub f64);

impl DosePercent {
    pub fn at_most(self, dose: f64) -> Result<DoseConstraint> {
        DoseConstraint::new(DoseSelector::Percentile(self.0), Relation::AtMost, dose)
    }

    pub fn at_least(self, dose: f64) -> Result<DoseConstraint> {
        DoseConstraint::new(DoseSelector::Percentile(self.0), Relation::AtLeast, dose)
    }
}

/// `DoseMean.at_most(0.5)`: mean dose <= 0.5
#[derive(Debug, Clone, Copy)]
pub struct DoseMean;

impl DoseMean {
    pub fn at_most(self, dose: f64) -> Result<DoseConstraint> {
        DoseConstraint::new(DoseSelector::Mean, Relation::AtMost, dose)
    }

    pub fn at_least(self, dose: f64) -> Result<DoseConstraint> {
        DoseConstraint::new(DoseSelector::Mean, Relation::AtLeast, dose)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoseConstraint {
    selector: DoseSelector,
    relation: Relation,
    dose: f64,
    priority: u8,
    /// slack found by the last relaxed solve
    slack: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConstraintPlot {
    pub percentile: Option<f64>,
    pub dose: f64,
    pub relation: Relation,
    pub slack: f64,
}

/// Dose expressions of one structure's active representation.
#[derive(Debug, Clone)]
pub struct DoseRows {
    /// a_i x per representation row
    pub rows: Vec<LinearExpr>,
    /// voxels represented by each row
    pub weights: Vec<f64>,
    /// mean dose over the structure
    pub mean: LinearExpr,
    pub size: usize,
}

impl DoseConstraint {
    pub fn new(selector: DoseSelector, relation: Relation, dose: f64) -> Result<Self> {
        validate(selector, dose)?;
        Ok(Self {
            selector,
            relation,
            dose,
            priority: PRIORITY_DEFAULT,
            slack: 0.0,
        })
    }

    /// Priority 0 is enforced without slack.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn selector(&self) -> DoseSelector {
        self.selector
    }

    pub fn relation(&self) -> Relation {
        self.relation
    }

    pub fn dose(&self) -> f64 {
        self.dose
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn slack(&self) -> f64 {
        self.slack
    }

    pub(crate) fn set_slack(&mut self, slack: f64) {
        self.slack = slack;
    }

    pub fn is_upper(&self) -> bool {
        self.relation == Relation::AtMost
    }

    pub fn is_mean(&self) -> bool {
        self.selector == DoseSelector::Mean
    }

    pub fn percentile(&self) -> Option<f64> {
        match self.selector {
            DoseSelector::Percentile(p) => Some(p),
            DoseSelector::Mean => None,
        }
    }

    /// Edits the constraint in place; `None` keeps the current value.
    pub fn change(
        &mut self,
        dose: Option<f64>,
        percentile: Option<f64>,
        relation: Option<Relation>,
    ) -> Result<()> {
        let selector = match (self.selector, percentile) {
            (DoseSelector::Percentile(_), Some(p)) => DoseSelector::Percentile(p),
            (DoseSelector::Mean, Some(_)) => {
                return Err(PlanError::InvalidConstraint(
                    "mean constraint has no percentile".to_string(),
                ));
            }
            (s, None) => s,
        };
        let dose = dose.unwrap_or(self.dose);
        validate(selector, dose)?;
        self.selector = selector;
        self.dose = dose;
        if let Some(r) = relation {
            self.relation = r;
        }
        Ok(())
    }

    /// Threshold relaxed by `slack` in the permitted direction, never below zero.
    pub fn dose_with_slack(&self, slack: f64) -> f64 {
        (self.dose + self.relation.sign() * slack).max(0.0)
    }

    /// Threshold including the slack of the last solve.
    pub fn threshold(&self) -> f64 {
        self.dose_with_slack(self.slack)
    }

    /// Fraction of voxels allowed on the violating side of the threshold.
    pub fn violation_fraction(&self) -> f64 {
        match (self.selector, self.relation) {
            (DoseSelector::Percentile(p), Relation::AtMost) => p / 100.0,
            (DoseSelector::Percentile(p), Relation::AtLeast) => 1.0 - p / 100.0,
            (DoseSelector::Mean, _) => 0.0,
        }
    }

    /// Fraction of voxels that must lie on the compliant side.
    pub fn compliant_fraction(&self) -> f64 {
        match (self.selector, self.relation) {
            (DoseSelector::Percentile(p), Relation::AtMost) => 1.0 - p / 100.0,
            (DoseSelector::Percentile(p), Relation::AtLeast) => p / 100.0,
            (DoseSelector::Mean, _) => 1.0,
        }
    }

    /// Voxels that must lie on the compliant side.
    pub fn required_voxels(&self, size: usize) -> usize {
        // absorb rounding in p/100 before taking the ceiling
        let n = (self.compliant_fraction() * size as f64 - 1e-9).ceil().max(0.0) as usize;
        n.min(size)
    }

    /// Achieved D_p (or mean dose) for a voxel dose vector.
    ///
    /// Percentiles are ranked with the same rounding as `required_voxels`:
    /// an upper bound reports the hottest dose outside the allowed hot
    /// voxels, a lower bound the coolest of the required hot voxels.
    pub fn achieved(&self, doses: &[f64]) -> Option<f64> {
        if doses.is_empty() {
            return None;
        }
        match self.selector {
            DoseSelector::Mean => Some(doses.iter().sum::<f64>() / doses.len() as f64),
            DoseSelector::Percentile(_) => {
                let n = doses.len();
                let required = self.required_voxels(n);
                // 1-based rank in descending order
                let rank = match self.relation {
                    Relation::AtMost => n - required + 1,
                    Relation::AtLeast => required,
                };
                let mut sorted = doses.to_vec();
                sorted.sort_by(|a, b| b.total_cmp(a));
                Some(sorted[rank.clamp(1, n) - 1])
            }
        }
    }

    /// Clinical check against the bare prescribed threshold.
    pub fn satisfied(&self, doses: &[f64]) -> bool {
        match self.achieved(doses) {
            Some(achieved) => match self.relation {
                Relation::AtMost => achieved <= self.dose + DOSE_TOLERANCE,
                Relation::AtLeast => achieved >= self.dose - DOSE_TOLERANCE,
            },
            None => false,
        }
    }

    /// Rows that fulfil the constraint with the largest margin under
    /// `row_doses`, accumulated until they cover the required voxel count.
    /// Returned indices are sorted ascending.
    pub fn maxmargin_fulfillers(
        &self,
        row_doses: &[f64],
        row_weights: &[f64],
        size: usize,
    ) -> Vec<usize> {
        let required = self.required_voxels(size) as f64;
        let mut order: Vec<usize> = (0..row_doses.len()).collect();
        match self.relation {
            Relation::AtMost => order.sort_by(|&a, &b| row_doses[a].total_cmp(&row_doses[b])),
            Relation::AtLeast => order.sort_by(|&a, &b| row_doses[b].total_cmp(&row_doses[a])),
        }

        let mut covered = 0.0;
        let mut chosen = Vec::new();
        for i in order {
            if covered >= required {
                break;
            }
            covered += row_weights[i];
            chosen.push(i);
        }
        chosen.sort_unstable();
        chosen
    }

    /// Relaxed convex form; `slack` is the slack variable if one was allocated.
    pub(crate) fn add_relaxed(&self, problem: &mut Problem, rows: &DoseRows, slack: Option<VarId>) {
        let sign = self.relation.sign();
        match self.selector {
            DoseSelector::Mean => {
                // σ(mean − d) − s <= 0
                let mut expr = rows.mean.scaled(sign);
                if let Some(s) = slack {
                    expr.add_term(s, -1.0);
                }
                problem.leq(expr, sign * self.dose);
            }
            DoseSelector::Percentile(_) => {
                let beta = problem.add_nonneg();
                let mut budget = LinearExpr::new();
                for (row, &w) in rows.rows.iter().zip(&rows.weights) {
                    // β + σ(a_i x − d) − s
                    let mut excess = row.scaled(sign).with_term(beta, 1.0);
                    excess.add_constant(-sign * self.dose);
                    if let Some(s) = slack {
                        excess.add_term(s, -1.0);
                    }
                    let z = problem.epigraph(&excess);
                    budget.add_term(z, w);
                }
                budget.add_term(beta, -self.violation_fraction() * rows.size as f64);
                problem.leq(budget, 0.0);
            }
        }
    }

    /// Exact form: every row in `subset` (or the mean) within `threshold`.
    pub(crate) fn add_exact(
        &self,
        problem: &mut Problem,
        rows: &DoseRows,
        subset: &[usize],
        threshold: f64,
    ) {
        let sign = self.relation.sign();
        match self.selector {
            DoseSelector::Mean => problem.leq(rows.mean.scaled(sign), sign * threshold),
            DoseSelector::Percentile(_) => {
                for &i in subset {
                    problem.leq(rows.rows[i].scaled(sign), sign * threshold);
                }
            }
        }
    }

    pub fn plotting_data(&self) -> ConstraintPlot {
        ConstraintPlot {
            percentile: self.percentile(),
            dose: self.dose,
            relation: self.relation,
            slack: self.slack,
        }
    }
}

fn validate(selector: DoseSelector, dose: f64) -> Result<()> {
    if let DoseSelector::Percentile(p) = selector
        && !(p > 0.0 && p < 100.0)
    {
        return Err(PlanError::InvalidConstraint(format!(
            "percentile must be in (0, 100), got {}",
            p
        )));
    }
    if !dose.is_finite() || dose < 0.0 {
        return Err(PlanError::InvalidConstraint(format!(
            "dose must be finite and non-negative, got {}",
            dose
        )));
    }
    Ok(())
}

impl fmt::Display for DoseConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.selector {
            DoseSelector::Percentile(p) => write!(f, "D{}", p)?,
            DoseSelector::Mean => write!(f, "Dmean")?,
        }
        write!(f, " {} {} Gy", self.relation.symbol(), self.dose)?;
        if self.slack > 0.0 {
            write!(f, " (slack {:.4})", self.slack)?;
        }
        Ok(())
    }
}

/// Constraints attached to one structure, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    items: BTreeMap<ConstraintId, DoseConstraint>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ConstraintId) -> bool {
        self.items.contains_key(&id)
    }

    /// Returns the constraint previously stored under `id`.
    pub fn insert(&mut self, id: ConstraintId, constraint: DoseConstraint) -> Option<DoseConstraint> {
        self.items.insert(id, constraint)
    }

    pub fn remove(&mut self, id: ConstraintId) -> Option<DoseConstraint> {
        self.items.remove(&id)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn get(&self, id: ConstraintId) -> Option<&DoseConstraint> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: ConstraintId) -> Option<&mut DoseConstraint> {
        self.items.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstraintId, &DoseConstraint)> {
        self.items.iter().map(|(&id, c)| (id, c))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConstraintId, &mut DoseConstraint)> {
        self.items.iter_mut().map(|(&id, c)| (id, c))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_percentile(&self) -> bool {
        self.items.values().any(|c| !c.is_mean())
    }

    pub fn plotting_data(&self) -> Vec<ConstraintPlot> {
        self.items.values().map(DoseConstraint::plotting_data).collect()
    }
}
