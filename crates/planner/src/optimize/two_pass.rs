//! Two-pass planning.
//!
//! Pass 1 minimises the prescription objective with every dose-volume
//! constraint in its relaxed convex form (optional slack). Pass 2 fixes, per
//! percentile constraint, the rows that met it with the largest margin under
//! the pass-1 dose and bounds each of them individually.

use super::backend::MicroLpSolver;
use super::problem::{ConvexSolver, LinearExpr, Problem, SolveOutcome, SolveStatus, VarId};
use super::{ConstraintOutcome, Pass2Slack, PassResult, PlanOptions, PlanReport};
use crate::constraints::{ConstraintId, DoseConstraint, DoseRows};
use crate::error::{PlanError, Result};
use crate::matrix::DoseOperator;
use crate::structure::{Label, Structure};
use nalgebra::DVector;
use std::collections::HashMap;

/// One assembled sub-problem.
struct PassModel {
    problem: Problem,
    beams: Vec<VarId>,
    /// dose rows per structure, same order as the input slice
    rows: Vec<DoseRows>,
    /// (structure index, constraint, slack variable)
    slacks: Vec<(usize, ConstraintId, VarId)>,
}

impl PassModel {
    fn beam_values(&self, out: &SolveOutcome) -> Vec<f64> {
        self.beams
            .iter()
            .map(|b| out.values[b.index()].max(0.0))
            .collect()
    }

    fn slack_values(&self, out: &SolveOutcome) -> HashMap<(usize, ConstraintId), f64> {
        self.slacks
            .iter()
            .map(|&(k, id, v)| ((k, id), out.values[v.index()].max(0.0)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Planner<S: ConvexSolver = MicroLpSolver> {
    options: PlanOptions,
    solver: S,
}

impl Planner<MicroLpSolver> {
    pub fn new(options: PlanOptions) -> Self {
        Self {
            options,
            solver: MicroLpSolver,
        }
    }
}

impl<S: ConvexSolver> Planner<S> {
    pub fn with_solver(options: PlanOptions, solver: S) -> Self {
        Self { options, solver }
    }

    pub fn options(&self) -> &PlanOptions {
        &self.options
    }

    /// Plans beam intensities for `structures`.
    ///
    /// Structures only change when planning succeeds: each constraint then
    /// records its pass-1 slack and every structure's dose statistics are
    /// recomputed from the final intensities. A representation requested in
    /// the options is switched back on failure.
    pub fn plan(&self, structures: &mut [Structure]) -> Result<PlanReport> {
        let Some(which) = self.options.representation else {
            return self.plan_active(structures);
        };
        let previous: Vec<_> = structures.iter().map(|s| s.representation()).collect();
        for s in structures.iter_mut() {
            s.switch_representation(which);
        }
        let result = self.plan_active(structures);
        if result.is_err() {
            for (s, r) in structures.iter_mut().zip(previous) {
                s.restore_representation(r);
            }
        }
        result
    }

    /// Plans with each structure's current representation.
    fn plan_active(&self, structures: &mut [Structure]) -> Result<PlanReport> {
        let n_beams = beam_count(structures)?;

        // pass 1
        let relaxed = self.relaxed_model(structures, n_beams)?;
        log::info!(
            "pass 1: {} structures, {} beams, {} variables, {} rows ({})",
            structures.len(),
            n_beams,
            relaxed.problem.num_variables(),
            relaxed.problem.num_constraints(),
            self.solver.name()
        );
        let out1 = self.solver.solve(&relaxed.problem);
        match &out1.status {
            SolveStatus::Optimal => {}
            SolveStatus::Infeasible => {
                return Err(PlanError::Infeasible(
                    "relaxed problem has no feasible beam intensities".to_string(),
                ));
            }
            other => {
                return Err(PlanError::Solver(format!("pass 1 ended with {:?}", other)));
            }
        }
        let slacks = relaxed.slack_values(&out1);
        let pass1 = PassResult {
            x: relaxed.beam_values(&out1),
            objective: out1.objective,
            slacks: slack_list(structures, &slacks),
        };
        log::info!("pass 1: objective {:.6}", pass1.objective);

        // pass 2
        let has_constraints = structures.iter().any(|s| !s.constraints().is_empty());
        let pass2 = if !self.options.use_2pass {
            None
        } else if !has_constraints {
            log::info!("pass 2: no dose-volume constraints, reusing pass 1");
            Some(PassResult {
                slacks: Vec::new(),
                ..pass1.clone()
            })
        } else {
            let exact = self.exact_model(structures, n_beams, &relaxed, &out1.values, &slacks)?;
            log::info!(
                "pass 2: {} variables, {} rows",
                exact.problem.num_variables(),
                exact.problem.num_constraints()
            );
            let out2 = self.solver.solve(&exact.problem);
            if !out2.is_optimal() {
                return Err(PlanError::PlanningFailure(format!(
                    "exact pass ended with {:?}",
                    out2.status
                )));
            }
            let pass2 = PassResult {
                x: exact.beam_values(&out2),
                objective: out2.objective,
                slacks: Vec::new(),
            };
            log::info!("pass 2: objective {:.6}", pass2.objective);
            Some(pass2)
        };

        // commit
        let (x, objective) = match &pass2 {
            Some(p) => (p.x.clone(), p.objective),
            None => (pass1.x.clone(), pass1.objective),
        };
        let xv = DVector::from_column_slice(&x);
        let mut outcomes = Vec::new();
        for (k, s) in structures.iter_mut().enumerate() {
            for (id, c) in s.constraints_mut().iter_mut() {
                c.set_slack(slacks.get(&(k, id)).copied().unwrap_or(0.0));
            }
            s.compute_dose(&xv)?;

            let doses = s.dose_vector().map(|y| y.as_slice()).unwrap_or(&[]);
            for (id, c) in s.constraints().iter() {
                let outcome = ConstraintOutcome {
                    structure: s.label(),
                    id,
                    constraint: c.to_string(),
                    threshold: self.enforced_threshold(c, c.slack(), pass2.is_some()),
                    achieved: c.achieved(doses),
                    slack: c.slack(),
                    satisfied: c.satisfied(doses),
                };
                if !outcome.satisfied {
                    log::warn!(
                        "structure {} {} violated: {} (achieved {:?})",
                        s.label(),
                        id,
                        c,
                        outcome.achieved
                    );
                }
                outcomes.push(outcome);
            }
        }

        log::info!(
            "planning finished: objective {:.6}, {} of {} constraints satisfied",
            objective,
            outcomes.iter().filter(|o| o.satisfied).count(),
            outcomes.len()
        );
        Ok(PlanReport {
            x,
            objective,
            pass1,
            pass2,
            constraints: outcomes,
        })
    }

    fn enforced_threshold(&self, c: &DoseConstraint, slack: f64, exact: bool) -> f64 {
        match (exact, self.options.pass2_slack) {
            (true, Pass2Slack::Drop) => c.dose(),
            _ => c.dose_with_slack(slack),
        }
    }

    fn relaxed_model(&self, structures: &[Structure], n_beams: usize) -> Result<PassModel> {
        let mut model = base_model(structures, n_beams)?;
        for (k, s) in structures.iter().enumerate() {
            for (id, c) in s.constraints().iter() {
                let slack = self.options.slack_weight(c.priority()).map(|w| {
                    let v = model.problem.add_nonneg();
                    model.problem.add_objective(&LinearExpr::from(v), w);
                    model.slacks.push((k, id, v));
                    v
                });
                c.add_relaxed(&mut model.problem, &model.rows[k], slack);
            }
        }
        Ok(model)
    }

    fn exact_model(
        &self,
        structures: &[Structure],
        n_beams: usize,
        relaxed: &PassModel,
        pass1_values: &[f64],
        slacks: &HashMap<(usize, ConstraintId), f64>,
    ) -> Result<PassModel> {
        let mut model = base_model(structures, n_beams)?;
        for (k, s) in structures.iter().enumerate() {
            let rows = &relaxed.rows[k];
            let row_doses: Vec<f64> = rows.rows.iter().map(|r| r.eval(pass1_values)).collect();
            for (id, c) in s.constraints().iter() {
                let slack = slacks.get(&(k, id)).copied().unwrap_or(0.0);
                let threshold = self.enforced_threshold(c, slack, true);
                let subset = if c.is_mean() {
                    Vec::new()
                } else {
                    c.maxmargin_fulfillers(&row_doses, &rows.weights, rows.size)
                };
                log::debug!(
                    "structure {} {}: {} of {} rows enforced exactly at {:.4}",
                    s.label(),
                    id,
                    subset.len(),
                    row_doses.len(),
                    threshold
                );
                c.add_exact(&mut model.problem, &model.rows[k], &subset, threshold);
            }
        }
        Ok(model)
    }
}

/// Beam count shared by the active matrices of all structures.
fn beam_count(structures: &[Structure]) -> Result<usize> {
    let mut beams = None;
    for s in structures {
        let a = s.active_matrix().ok_or_else(|| {
            PlanError::MissingData(format!(
                "structure {} ({}) has no active dose matrix",
                s.label(),
                s.name
            ))
        })?;
        match beams {
            None => beams = Some(a.cols()),
            Some(n) if n != a.cols() => {
                return Err(PlanError::Dimension {
                    what: "beam count",
                    expected: n,
                    got: a.cols(),
                });
            }
            Some(_) => {}
        }
    }
    beams.ok_or_else(|| PlanError::MissingData("no structures to plan".to_string()))
}

/// Beam variables plus the prescription objective shared by both passes.
fn base_model(structures: &[Structure], n_beams: usize) -> Result<PassModel> {
    let mut problem = Problem::new();
    let beams: Vec<VarId> = (0..n_beams).map(|_| problem.add_nonneg()).collect();
    let mut rows = Vec::with_capacity(structures.len());
    for s in structures {
        let r = s.dose_rows(&beams)?;
        add_dose_objective(&mut problem, s, &r);
        rows.push(r);
    }
    Ok(PassModel {
        problem,
        beams,
        rows,
        slacks: Vec::new(),
    })
}

/// Targets: w_under·pos(d − a_i x) + w_over·pos(a_i x − d) per row.
/// Non-targets: w_over·a_i x. Each row counts once per voxel it represents.
fn add_dose_objective(problem: &mut Problem, s: &Structure, rows: &DoseRows) {
    let w_over = s.w_over().unwrap_or(0.0);
    if s.is_target() {
        let w_under = s.w_under().unwrap_or(0.0);
        for (row, &w) in rows.rows.iter().zip(&rows.weights) {
            let under = row.scaled(-1.0).with_constant(s.dose());
            let over = row.clone().with_constant(-s.dose());
            problem.add_pos_penalty(&under, w * w_under);
            problem.add_pos_penalty(&over, w * w_over);
        }
    } else {
        for (row, &w) in rows.rows.iter().zip(&rows.weights) {
            problem.add_objective(row, w * w_over);
        }
    }
}

fn slack_list(
    structures: &[Structure],
    slacks: &HashMap<(usize, ConstraintId), f64>,
) -> Vec<(Label, ConstraintId, f64)> {
    let mut out: Vec<_> = slacks
        .iter()
        .map(|(&(k, id), &v)| (structures[k].label(), id, v))
        .collect();
    out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{DoseMean, DosePercent};
    use crate::error::ErrorKind;
    use crate::structure::{Representation, StructureOptions};
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn structure(label: u32, size: usize, dose: Option<f64>) -> Structure {
        Structure::new(
            label,
            size,
            StructureOptions {
                dose,
                ..Default::default()
            },
        )
        .unwrap()
    }

    /// Target rows in [0.5, 1), organ-at-risk rows in [0, 0.5).
    fn random_case(seed: u64, beams: usize) -> Vec<Structure> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tumor = structure(0, 12, Some(1.0));
        let mut oar = structure(1, 24, None);
        let a_t = DMatrix::from_fn(12, beams, |_, _| rng.gen_range(0.5..1.0));
        let a_o = DMatrix::from_fn(24, beams, |_, _| rng.gen_range(0.0..0.5));
        tumor.set_full_matrix(a_t).unwrap();
        oar.set_full_matrix(a_o).unwrap();
        vec![tumor, oar]
    }

    fn two_pass(use_slack: bool) -> PlanOptions {
        PlanOptions {
            use_slack,
            use_2pass: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_constraints_two_pass_matches_one_pass() {
        let mut one = random_case(7, 5);
        let mut two = random_case(7, 5);

        let r1 = Planner::new(PlanOptions::default()).plan(&mut one).unwrap();
        let r2 = Planner::new(two_pass(true)).plan(&mut two).unwrap();

        assert!(r1.pass2.is_none());
        assert_eq!(r1.x, r2.x);
        assert_eq!(r1.objective, r2.objective);
        let p2 = r2.pass2.unwrap();
        assert_eq!(p2.x, r2.pass1.x);
        assert_eq!(p2.objective, r2.pass1.objective);
    }

    #[test]
    fn test_hard_two_pass_never_worse_than_pass_one() {
        for seed in [1u64, 2, 3] {
            let mut structures = random_case(seed, 6);
            structures[1].add_constraint(ConstraintId(0), DosePercent(30.0).at_most(0.3).unwrap());
            structures[1].add_constraint(ConstraintId(1), DoseMean.at_most(0.25).unwrap());

            let report = Planner::new(two_pass(false)).plan(&mut structures).unwrap();
            let p2 = report.pass2.as_ref().unwrap();
            assert!(
                p2.objective <= report.pass1.objective + 1e-7,
                "seed {seed}: {} > {}",
                p2.objective,
                report.pass1.objective
            );
            assert!(report.pass1.slacks.is_empty());
            assert!(report.all_satisfied());
        }
    }

    #[test]
    fn test_final_x_is_non_negative() {
        let mut structures = random_case(11, 4);
        structures[1].add_constraint(ConstraintId(0), DosePercent(50.0).at_most(0.2).unwrap());
        let report = Planner::new(two_pass(true)).plan(&mut structures).unwrap();
        assert_eq!(report.x.len(), 4);
        assert!(report.x.iter().all(|&v| v >= 0.0));
        assert!(structures.iter().all(|s| s.dose_vector().is_some()));
    }

    #[test]
    fn test_conflicting_hard_constraints_are_infeasible() {
        let mut tumor = structure(0, 2, Some(1.0));
        tumor
            .set_full_matrix(DMatrix::from_element(2, 1, 1.0))
            .unwrap();
        tumor.add_constraint(ConstraintId(0), DoseMean.at_most(0.5).unwrap().with_priority(0));
        tumor.add_constraint(ConstraintId(1), DoseMean.at_least(1.0).unwrap().with_priority(0));
        let mut structures = vec![tumor];

        let err = Planner::new(two_pass(true))
            .plan(&mut structures)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infeasible);
        assert!(structures[0].dose_vector().is_none());
    }

    #[test]
    fn test_conflicting_percentiles_without_slack_are_infeasible() {
        let mut tumor = structure(0, 4, Some(1.0));
        tumor
            .set_full_matrix(DMatrix::from_element(4, 1, 1.0))
            .unwrap();
        tumor.add_constraint(ConstraintId(0), DosePercent(50.0).at_most(0.5).unwrap());
        tumor.add_constraint(ConstraintId(1), DosePercent(50.0).at_least(1.0).unwrap());
        let mut structures = vec![tumor];

        let err = Planner::new(two_pass(false))
            .plan(&mut structures)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infeasible);
        assert!(structures[0].dose_vector().is_none());
        assert!(
            structures[0]
                .constraints()
                .iter()
                .all(|(_, c)| c.slack() == 0.0)
        );
    }

    #[test]
    fn test_failed_plan_keeps_representation() {
        let mut tumor = structure(0, 4, Some(1.0));
        tumor
            .set_full_matrix(DMatrix::from_element(4, 1, 1.0))
            .unwrap();
        tumor
            .set_clustered_matrix(
                DMatrix::from_element(2, 1, 1.0),
                Some(vec![0, 0, 1, 1]),
                None,
            )
            .unwrap();
        tumor.add_constraint(ConstraintId(0), DoseMean.at_most(0.5).unwrap().with_priority(0));
        tumor.add_constraint(ConstraintId(1), DoseMean.at_least(1.0).unwrap().with_priority(0));
        let mut structures = vec![tumor];
        assert_eq!(structures[0].representation(), Representation::Full);

        let options = PlanOptions {
            representation: Some(Representation::Clustered),
            ..two_pass(true)
        };
        let err = Planner::new(options).plan(&mut structures).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infeasible);
        assert_eq!(structures[0].representation(), Representation::Full);
        assert!(structures[0].dose_vector().is_none());
    }

    #[test]
    fn test_dropping_slack_can_fail_exact_pass() {
        let mut tumor = structure(0, 2, Some(1.0));
        tumor
            .set_full_matrix(DMatrix::from_element(2, 1, 1.0))
            .unwrap();
        tumor.add_constraint(ConstraintId(0), DoseMean.at_most(0.5).unwrap());
        tumor.add_constraint(ConstraintId(1), DoseMean.at_least(1.0).unwrap().with_priority(0));
        let mut structures = vec![tumor];

        let options = PlanOptions {
            pass2_slack: Pass2Slack::Drop,
            ..two_pass(true)
        };
        let err = Planner::new(options).plan(&mut structures).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlanningFailure);
        // pass-1 slack is not committed on failure
        let c = structures[0].constraints().get(ConstraintId(0)).unwrap();
        assert_eq!(c.slack(), 0.0);
        assert!(structures[0].dose_vector().is_none());
    }

    #[test]
    fn test_slack_absorbs_conflict_in_one_pass() {
        let mut tumor = structure(0, 2, Some(1.0));
        tumor
            .set_full_matrix(DMatrix::from_element(2, 1, 1.0))
            .unwrap();
        tumor.add_constraint(ConstraintId(0), DoseMean.at_most(0.5).unwrap());
        tumor.add_constraint(ConstraintId(1), DoseMean.at_least(1.0).unwrap().with_priority(0));
        let mut structures = vec![tumor];

        let report = Planner::new(PlanOptions::default())
            .plan(&mut structures)
            .unwrap();
        assert!((report.x[0] - 1.0).abs() < 1e-7);
        let c = structures[0].constraints().get(ConstraintId(0)).unwrap();
        assert!((c.slack() - 0.5).abs() < 1e-7);
        assert!(!report.constraints[0].satisfied);
        assert!((report.constraints[0].threshold - 1.0).abs() < 1e-7);
    }

    #[test]
    fn test_uniform_target_scenario() {
        let mut tumor = structure(0, 100, Some(1.0));
        tumor
            .set_full_matrix(DMatrix::from_element(100, 50, 1.0))
            .unwrap();
        tumor.add_constraint(ConstraintId(0), DosePercent(80.0).at_least(0.95).unwrap());
        let mut structures = vec![tumor];

        let report = Planner::new(two_pass(true)).plan(&mut structures).unwrap();
        assert!(report.pass2.is_some());
        let outcome = &report.constraints[0];
        assert!(outcome.satisfied);
        assert!(outcome.slack.abs() < 1e-7);

        let s = &structures[0];
        assert!((s.mean_dose().unwrap() - 1.0).abs() < 1e-6);
        assert!(s.dose_vector().unwrap().iter().all(|d| (d - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_clustered_plan_matches_full_for_exact_clusters() {
        let build = || {
            let mut s = structure(0, 4, Some(1.0));
            let rows = [0.8, 0.2, 0.8, 0.2, 0.3, 0.9, 0.3, 0.9];
            s.set_full_matrix(DMatrix::from_row_slice(4, 2, &rows)).unwrap();
            s.set_clustered_matrix(
                DMatrix::from_row_slice(2, 2, &[0.8, 0.2, 0.3, 0.9]),
                Some(vec![0, 0, 1, 1]),
                None,
            )
            .unwrap();
            vec![s]
        };
        let mut full = build();
        let mut clustered = build();

        let r_full = Planner::new(PlanOptions::default()).plan(&mut full).unwrap();
        let r_clu = Planner::new(PlanOptions {
            representation: Some(Representation::Clustered),
            ..Default::default()
        })
        .plan(&mut clustered)
        .unwrap();

        assert_eq!(clustered[0].representation(), Representation::Clustered);
        assert!((r_full.objective - r_clu.objective).abs() < 1e-7);
    }

    #[test]
    fn test_missing_matrix_and_beam_mismatch() {
        let mut structures = vec![structure(0, 3, Some(1.0))];
        let err = Planner::new(PlanOptions::default())
            .plan(&mut structures)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingData);

        let mut a = structure(0, 2, Some(1.0));
        let mut b = structure(1, 2, None);
        a.set_full_matrix(DMatrix::from_element(2, 3, 1.0)).unwrap();
        b.set_full_matrix(DMatrix::from_element(2, 4, 1.0)).unwrap();
        let err = Planner::new(PlanOptions::default())
            .plan(&mut [a, b])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dimension);

        let err = Planner::new(PlanOptions::default()).plan(&mut []).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingData);
    }
}
