//! Case assembly: one global influence matrix split into per-structure
//! blocks, plus the bookkeeping for constraints attached across structures.

use crate::constraints::{ConstraintId, DoseConstraint, Relation};
use crate::dvh::DoseSummaryTable;
use crate::error::{PlanError, Result};
use crate::matrix::{DoseMatrix, DoseOperator};
use crate::optimize::problem::ConvexSolver;
use crate::optimize::{PlanOptions, PlanReport, Planner};
use crate::structure::{Label, Structure, StructureOptions, StructurePlot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

/// Prescription for one labelled structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prescription {
    pub label: Label,
    pub name: String,
    pub is_target: bool,
    pub dose: f64,
}

#[derive(Debug, Clone)]
pub struct Case {
    structures: Vec<Structure>,
    beams: usize,
    next_id: u32,
}

impl Case {
    /// Groups the rows of `matrix` by `voxel_labels` into contiguous blocks
    /// ordered by `label_order`.
    pub fn new(
        matrix: impl Into<DoseMatrix>,
        voxel_labels: &[Label],
        label_order: &[Label],
        prescriptions: &[Prescription],
    ) -> Result<Self> {
        let matrix = matrix.into();
        if voxel_labels.len() != matrix.rows() {
            return Err(PlanError::Dimension {
                what: "voxel labels",
                expected: matrix.rows(),
                got: voxel_labels.len(),
            });
        }

        let mut seen = HashSet::new();
        if let Some(dup) = label_order.iter().find(|&&l| !seen.insert(l)) {
            return Err(PlanError::InvalidPrescription(format!(
                "label {} listed twice",
                dup
            )));
        }
        if let Some(stray) = voxel_labels.iter().find(|l| !seen.contains(*l)) {
            return Err(PlanError::MissingData(format!(
                "voxel label {} is not in the label order",
                stray
            )));
        }

        let mut structures = Vec::with_capacity(label_order.len());
        let mut start = 0;
        for &label in label_order {
            let rx = prescriptions
                .iter()
                .find(|p| p.label == label)
                .ok_or_else(|| {
                    PlanError::MissingData(format!("no prescription for label {}", label))
                })?;
            let rows: Vec<usize> = voxel_labels
                .iter()
                .enumerate()
                .filter(|&(_, &l)| l == label)
                .map(|(i, _)| i)
                .collect();
            if rows.is_empty() {
                return Err(PlanError::MissingData(format!(
                    "label {} ({}) has no voxels",
                    label, rx.name
                )));
            }

            let mut s = Structure::new(
                label,
                rows.len(),
                StructureOptions {
                    name: rx.name.clone(),
                    is_target: Some(rx.is_target),
                    dose: Some(rx.dose),
                    ..Default::default()
                },
            )?;
            s.set_full_matrix(matrix.select_rows(&rows)?)?;
            s.set_block_indices(start, start + rows.len())?;
            start += rows.len();
            structures.push(s);
        }

        log::info!(
            "case assembled: {} structures, {} voxels, {} beams ({})",
            structures.len(),
            matrix.rows(),
            matrix.cols(),
            matrix.storage()
        );
        Ok(Self {
            structures,
            beams: matrix.cols(),
            next_id: 0,
        })
    }

    pub fn beams(&self) -> usize {
        self.beams
    }

    pub fn structures(&self) -> &[Structure] {
        &self.structures
    }

    pub fn structure(&self, label: Label) -> Option<&Structure> {
        self.structures.iter().find(|s| s.label() == label)
    }

    pub fn structure_mut(&mut self, label: Label) -> Option<&mut Structure> {
        self.structures.iter_mut().find(|s| s.label() == label)
    }

    fn require_structure(&mut self, label: Label) -> Result<&mut Structure> {
        self.structure_mut(label)
            .ok_or_else(|| PlanError::MissingData(format!("no structure with label {}", label)))
    }

    fn owner_of(&mut self, id: ConstraintId) -> Result<&mut Structure> {
        self.structures
            .iter_mut()
            .find(|s| s.has_constraint(id))
            .ok_or_else(|| PlanError::MissingData(format!("no constraint {}", id)))
    }

    /// Attaches `constraint` to structure `label` under a fresh id.
    pub fn add_dvh_constraint(
        &mut self,
        label: Label,
        constraint: DoseConstraint,
    ) -> Result<ConstraintId> {
        let id = ConstraintId(self.next_id);
        let s = self.require_structure(label)?;
        log::debug!("structure {}: adding {} {}", label, id, constraint);
        s.add_constraint(id, constraint);
        self.next_id += 1;
        Ok(id)
    }

    pub fn remove_dvh_constraint(&mut self, id: ConstraintId) -> Result<DoseConstraint> {
        let s = self.owner_of(id)?;
        s.remove_constraint(id)
            .ok_or_else(|| PlanError::MissingData(format!("no constraint {}", id)))
    }

    pub fn change_dvh_constraint(
        &mut self,
        id: ConstraintId,
        dose: Option<f64>,
        percentile: Option<f64>,
        relation: Option<Relation>,
    ) -> Result<()> {
        self.owner_of(id)?
            .set_constraint(id, dose, percentile, relation)
    }

    pub fn clear_dvh_constraints(&mut self) {
        for s in &mut self.structures {
            s.remove_all_constraints();
        }
    }

    pub fn plan(&mut self, options: PlanOptions) -> Result<PlanReport> {
        self.plan_with(&Planner::new(options))
    }

    pub fn plan_with<S: ConvexSolver>(&mut self, planner: &Planner<S>) -> Result<PlanReport> {
        planner.plan(&mut self.structures)
    }

    /// Dose summary per structure, for structures with a computed dose.
    pub fn summary_table(&self) -> Vec<(Label, String, DoseSummaryTable)> {
        self.structures
            .iter()
            .filter_map(|s| {
                s.dose_summary()
                    .table_data()
                    .map(|t| (s.label(), s.name.clone(), t.clone()))
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<6} {:<12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
            "label", "name", "mean", "std", "min", "max", "D2", "D98"
        );
        for (label, name, t) in self.summary_table() {
            let _ = writeln!(
                out,
                "{:<6} {:<12} {:>8.4} {:>8.4} {:>8.4} {:>8.4} {:>8.4} {:>8.4}",
                label, name, t.mean, t.std, t.min, t.max, t.d2, t.d98
            );
        }
        for s in &self.structures {
            for (id, c) in s.constraints().iter() {
                let achieved = s
                    .dose_vector()
                    .and_then(|y| c.achieved(y.as_slice()))
                    .map(|d| format!("{:.4}", d))
                    .unwrap_or_else(|| "-".to_string());
                let status = match s.dose_vector() {
                    Some(y) if c.satisfied(y.as_slice()) => "ok",
                    Some(_) => "VIOLATED",
                    None => "unplanned",
                };
                let _ = writeln!(
                    out,
                    "{} {} [{}]: {} achieved {} {}",
                    s.label(),
                    s.name,
                    id,
                    c,
                    achieved,
                    status
                );
            }
        }
        out
    }

    pub fn plotting_data(&self) -> BTreeMap<Label, StructurePlot> {
        self.structures
            .iter()
            .map(|s| (s.label(), s.plotting_data()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{DoseMean, DosePercent};
    use crate::error::ErrorKind;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use sprs::TriMat;

    const TUMOR: Label = 0;
    const OAR: Label = 1;
    const M_TARG: usize = 20;
    const M_OAR: usize = 60;
    const BEAMS: usize = 10;

    fn prescriptions() -> Vec<Prescription> {
        vec![
            Prescription {
                label: TUMOR,
                name: "tumor".to_string(),
                is_target: true,
                dose: 1.0,
            },
            Prescription {
                label: OAR,
                name: "oar".to_string(),
                is_target: false,
                dose: 0.0,
            },
        ]
    }

    fn voxel_labels() -> Vec<Label> {
        let mut labels = vec![TUMOR; M_TARG];
        labels.extend(vec![OAR; M_OAR]);
        labels
    }

    /// Target rows uniform in [0, 1), organ-at-risk rows in [0, 0.5).
    fn random_matrix(seed: u64) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        DMatrix::from_fn(M_TARG + M_OAR, BEAMS, |i, _| {
            let scale = if i < M_TARG { 1.0 } else { 0.5 };
            scale * rng.gen_range(0.0..1.0)
        })
    }

    fn case(seed: u64) -> Case {
        Case::new(
            random_matrix(seed),
            &voxel_labels(),
            &[TUMOR, OAR],
            &prescriptions(),
        )
        .unwrap()
    }

    #[test]
    fn test_blocks_follow_label_order() {
        // interleaved labels still give contiguous blocks
        let a = DMatrix::from_row_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]);
        let cs = Case::new(a, &[OAR, TUMOR, OAR, TUMOR], &[TUMOR, OAR], &prescriptions()).unwrap();

        let tumor = cs.structure(TUMOR).unwrap();
        assert_eq!(tumor.start_index(), Some(0));
        assert_eq!(tumor.stop_index(), Some(2));
        assert!(tumor.is_target());
        let rows: Vec<_> = (0..2)
            .map(|i| tumor.full_matrix().unwrap().row_entries(i))
            .collect();
        assert_eq!(rows, vec![vec![(0, 2.0)], vec![(0, 4.0)]]);

        let oar = cs.structure(OAR).unwrap();
        assert_eq!(oar.start_index(), Some(2));
        assert_eq!(oar.dose(), 0.0);
        assert_eq!(cs.beams(), 1);
    }

    #[test]
    fn test_invalid_assembly() {
        let a = DMatrix::from_element(3, 2, 1.0);
        let err = Case::new(a.clone(), &[TUMOR, OAR], &[TUMOR, OAR], &prescriptions()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dimension);

        let err = Case::new(a.clone(), &[TUMOR, OAR, 7], &[TUMOR, OAR], &prescriptions())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingData);

        let err = Case::new(a.clone(), &[TUMOR; 3], &[TUMOR, 5], &prescriptions()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingData);

        let err = Case::new(a, &[TUMOR; 3], &[TUMOR, TUMOR], &prescriptions()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_sparse_case() {
        let mut tri = TriMat::new((4, 2));
        tri.add_triplet(0, 0, 1.0);
        tri.add_triplet(1, 1, 1.0);
        tri.add_triplet(2, 0, 0.2);
        tri.add_triplet(3, 1, 0.2);
        let mut cs = Case::new(
            tri.to_csr::<usize>(),
            &[TUMOR, TUMOR, OAR, OAR],
            &[TUMOR, OAR],
            &prescriptions(),
        )
        .unwrap();
        assert!(cs.structure(TUMOR).unwrap().full_matrix().unwrap().is_sparse());

        let report = cs.plan(PlanOptions::default()).unwrap();
        assert!((report.x[0] - 1.0).abs() < 1e-6);
        assert!((report.x[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_constraint_bookkeeping() {
        let mut cs = case(1);
        let a = cs
            .add_dvh_constraint(TUMOR, DosePercent(30.0).at_most(1.05).unwrap())
            .unwrap();
        let b = cs
            .add_dvh_constraint(OAR, DoseMean.at_most(0.5).unwrap())
            .unwrap();
        assert_ne!(a, b);
        assert!(cs.structure(TUMOR).unwrap().has_constraint(a));
        assert!(cs.structure(OAR).unwrap().has_constraint(b));

        cs.change_dvh_constraint(a, Some(1.1), Some(25.0), None).unwrap();
        let c = cs.structure(TUMOR).unwrap().constraints().get(a).unwrap();
        assert_eq!(c.dose(), 1.1);
        assert_eq!(c.percentile(), Some(25.0));

        let removed = cs.remove_dvh_constraint(b).unwrap();
        assert!(removed.is_mean());
        assert_eq!(
            cs.remove_dvh_constraint(b).unwrap_err().kind(),
            ErrorKind::MissingData
        );
        assert_eq!(
            cs.add_dvh_constraint(9, DoseMean.at_most(1.0).unwrap())
                .unwrap_err()
                .kind(),
            ErrorKind::MissingData
        );

        cs.clear_dvh_constraints();
        assert!(cs.structures().iter().all(|s| s.constraints().is_empty()));
    }

    #[test]
    fn test_basic_two_pass() {
        let mut cs = case(2);
        cs.add_dvh_constraint(TUMOR, DosePercent(30.0).at_most(1.05).unwrap())
            .unwrap();
        cs.add_dvh_constraint(TUMOR, DosePercent(20.0).at_least(0.8).unwrap())
            .unwrap();
        cs.add_dvh_constraint(OAR, DosePercent(50.0).at_most(0.5).unwrap())
            .unwrap();
        cs.add_dvh_constraint(OAR, DosePercent(10.0).at_least(0.55).unwrap())
            .unwrap();

        let report = cs
            .plan(PlanOptions {
                use_2pass: true,
                ..Default::default()
            })
            .unwrap();
        assert!(report.pass2.is_some());
        assert_eq!(report.constraints.len(), 4);
        assert_eq!(report.pass1.slacks.len(), 4);

        let summary = cs.summary();
        assert!(summary.contains("tumor"));
        assert!(summary.contains("D30 <= 1.05 Gy"));
        assert_eq!(cs.summary_table().len(), 2);
        let plots = cs.plotting_data();
        assert_eq!(plots[&TUMOR].constraints.len(), 2);
        assert_eq!(plots[&OAR].curve.dose.len(), M_OAR);
    }

    #[test]
    fn test_mean_constraint() {
        let mut cs = case(3);
        let id = cs
            .add_dvh_constraint(OAR, DoseMean.at_most(0.5).unwrap())
            .unwrap();
        cs.add_dvh_constraint(OAR, DosePercent(10.0).at_least(0.55).unwrap())
            .unwrap();

        let report = cs.plan(PlanOptions::default()).unwrap();
        let outcome = report.constraints.iter().find(|o| o.id == id).unwrap();
        let mean = cs.structure(OAR).unwrap().mean_dose().unwrap();
        assert!(mean <= outcome.threshold + 1e-6);
    }

    #[test]
    fn test_two_pass_without_constraints() {
        let mut cs = case(4);
        let one = cs.plan(PlanOptions::default()).unwrap();
        let two = cs
            .plan(PlanOptions {
                use_2pass: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(one.x, two.x);
        assert_eq!(one.objective, two.objective);
    }

    #[test]
    fn test_two_pass_without_slack() {
        let mut cs = case(5);
        cs.add_dvh_constraint(TUMOR, DosePercent(30.0).at_most(1.05).unwrap())
            .unwrap();
        cs.add_dvh_constraint(TUMOR, DosePercent(20.0).at_least(0.8).unwrap())
            .unwrap();
        cs.add_dvh_constraint(OAR, DosePercent(50.0).at_most(50.0).unwrap())
            .unwrap();

        let options = PlanOptions {
            use_slack: false,
            ..Default::default()
        };
        let one = cs.plan(options.clone()).unwrap();
        let two = cs
            .plan(PlanOptions {
                use_2pass: true,
                ..options
            })
            .unwrap();
        assert!(two.objective <= one.objective + 1e-7);
    }
}
