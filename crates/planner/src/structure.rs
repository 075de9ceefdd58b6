//! Anatomical structure: voxel block, prescription, influence matrix
//! representations and the dose statistics derived from a beam vector.

use crate::constants::{DOSE_DEFAULT, W_NONTARG_DEFAULT, W_OVER_DEFAULT, W_UNDER_DEFAULT};
use crate::constants::{REPR_CLUSTERED, REPR_FULL, REPR_MEAN};
use crate::constraints::{
    ConstraintId, ConstraintPlot, ConstraintSet, DoseConstraint, DoseRows, Relation,
};
use crate::dvh::{DensityPlot, DoseDensity, DoseSummary, DvhCurve, DvhPlot};
use crate::error::{PlanError, Result};
use crate::matrix::{DoseMatrix, DoseOperator};
use crate::optimize::problem::{LinearExpr, VarId};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Label = u32;

/// Influence matrix representation used for dose computation and planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Representation {
    #[default]
    Full,
    Clustered,
    Mean,
    /// no matrix available
    Absent,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Representation::Full => REPR_FULL,
            Representation::Clustered => REPR_CLUSTERED,
            Representation::Mean => REPR_MEAN,
            Representation::Absent => "none",
        };
        f.write_str(s)
    }
}

/// Voxel-clustered influence matrix (clusters x beams).
#[derive(Debug, Clone)]
pub struct ClusteredMatrix {
    matrix: DoseMatrix,
    voxel_to_cluster: Option<Vec<usize>>,
    voxels_per_cluster: Option<Vec<usize>>,
}

impl ClusteredMatrix {
    pub fn matrix(&self) -> &DoseMatrix {
        &self.matrix
    }

    pub fn voxel_to_cluster(&self) -> Option<&[usize]> {
        self.voxel_to_cluster.as_deref()
    }

    pub fn voxels_per_cluster(&self) -> Option<&[usize]> {
        self.voxels_per_cluster.as_deref()
    }

    /// matrix, map and counts all present
    pub fn is_complete(&self) -> bool {
        self.voxel_to_cluster.is_some() && self.voxels_per_cluster.is_some()
    }
}

/// Voxels per cluster, tallied over clusters `0..clusters`.
pub fn tally_clusters(voxel_to_cluster: &[usize], clusters: usize) -> Result<Vec<usize>> {
    let mut counts = vec![0usize; clusters];
    for &c in voxel_to_cluster {
        match counts.get_mut(c) {
            Some(n) => *n += 1,
            None => {
                return Err(PlanError::Index {
                    what: "cluster id",
                    index: c,
                    bound: clusters,
                });
            }
        }
    }
    Ok(counts)
}

/// Optional settings for [`Structure::new`].
#[derive(Debug, Clone, Default)]
pub struct StructureOptions {
    pub name: String,
    pub is_target: Option<bool>,
    pub dose: Option<f64>,
    pub w_under: Option<f64>,
    pub w_over: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructurePlot {
    pub density: DensityPlot,
    pub curve: DvhPlot,
    pub constraints: Vec<ConstraintPlot>,
}

#[derive(Debug, Clone)]
pub struct Structure {
    label: Label,
    pub name: String,
    is_target: bool,

    size: usize,
    start_index: Option<usize>,
    stop_index: Option<usize>,

    dose: f64,
    w_under: Option<f64>,
    w_over: Option<f64>,

    full: Option<DoseMatrix>,
    clustered: Option<ClusteredMatrix>,
    // 1 x beams
    mean: Option<DoseMatrix>,
    current: Representation,

    dose_vector: Option<DVector<f64>>,
    mean_dose: Option<f64>,

    constraints: ConstraintSet,
    dvh_curve: DvhCurve,
    dose_density: DoseDensity,
    dose_summary: DoseSummary,
}

impl Structure {
    /// New structure with `size` voxels.
    ///
    /// The target flag defaults to `dose > 0`. A target without a dose gets
    /// [`DOSE_DEFAULT`]; a non-target without a dose is prescribed zero.
    /// Missing weights take the target/non-target defaults.
    pub fn new(label: Label, size: usize, options: StructureOptions) -> Result<Self> {
        if size == 0 {
            return Err(PlanError::InvalidPrescription(format!(
                "structure {} has no voxels",
                label
            )));
        }
        if let Some(d) = options.dose
            && (!d.is_finite() || d < 0.0)
        {
            return Err(PlanError::InvalidPrescription(format!(
                "structure {}: dose must be finite and non-negative, got {}",
                label, d
            )));
        }
        for w in [options.w_under, options.w_over].into_iter().flatten() {
            check_weight(label, w)?;
        }

        let is_target = options
            .is_target
            .unwrap_or_else(|| options.dose.is_some_and(|d| d > 0.0));
        let dose = match (is_target, options.dose) {
            (_, Some(d)) => d,
            (true, None) => DOSE_DEFAULT,
            (false, None) => 0.0,
        };
        if is_target && dose <= 0.0 {
            return Err(PlanError::InvalidPrescription(format!(
                "target structure {} needs a positive dose",
                label
            )));
        }

        let (w_under, w_over) = if is_target {
            (
                Some(options.w_under.unwrap_or(W_UNDER_DEFAULT)),
                Some(options.w_over.unwrap_or(W_OVER_DEFAULT)),
            )
        } else {
            (
                options.w_under,
                Some(options.w_over.unwrap_or(W_NONTARG_DEFAULT)),
            )
        };

        Ok(Self {
            label,
            name: options.name,
            is_target,
            size,
            start_index: None,
            stop_index: None,
            dose,
            w_under,
            w_over,
            full: None,
            clustered: None,
            mean: None,
            current: Representation::Absent,
            dose_vector: None,
            mean_dose: None,
            constraints: ConstraintSet::new(),
            dvh_curve: DvhCurve::new(),
            dose_density: DoseDensity::new(),
            dose_summary: DoseSummary::new(),
        })
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn is_target(&self) -> bool {
        self.is_target
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dose(&self) -> f64 {
        self.dose
    }

    pub fn start_index(&self) -> Option<usize> {
        self.start_index
    }

    pub fn stop_index(&self) -> Option<usize> {
        self.stop_index
    }

    /// Block [start, stop) in the global voxel ordering.
    pub(crate) fn set_block_indices(&mut self, start: usize, stop: usize) -> Result<()> {
        if stop < start || stop - start != self.size {
            return Err(PlanError::Dimension {
                what: "voxel block",
                expected: self.size,
                got: stop.saturating_sub(start),
            });
        }
        self.start_index = Some(start);
        self.stop_index = Some(stop);
        Ok(())
    }

    // ---- matrices ----

    /// Beam count shared by all installed representations.
    pub fn beams(&self) -> Option<usize> {
        self.full
            .as_ref()
            .or(self.clustered.as_ref().map(|c| &c.matrix))
            .or(self.mean.as_ref())
            .map(|m| m.cols())
    }

    /// Checks `m` against the beam count of every slot other than `slot`.
    fn check_beams(&self, what: &'static str, slot: Representation, m: &DoseMatrix) -> Result<()> {
        let others = [
            (Representation::Full, self.full.as_ref()),
            (Representation::Clustered, self.clustered.as_ref().map(|c| &c.matrix)),
            (Representation::Mean, self.mean.as_ref()),
        ];
        for (kind, other) in others {
            if let Some(other) = other
                && kind != slot
                && other.cols() != m.cols()
            {
                return Err(PlanError::Dimension {
                    what,
                    expected: other.cols(),
                    got: m.cols(),
                });
            }
        }
        Ok(())
    }

    /// Installs the full-resolution matrix (voxels x beams). It becomes the
    /// active representation when none is active, and seeds the mean row if
    /// no mean was installed yet.
    pub fn set_full_matrix(&mut self, matrix: impl Into<DoseMatrix>) -> Result<()> {
        let matrix = matrix.into();
        if matrix.rows() != self.size {
            return Err(PlanError::Dimension {
                what: "full matrix rows",
                expected: self.size,
                got: matrix.rows(),
            });
        }
        self.check_beams("full matrix beams", Representation::Full, &matrix)?;

        self.full = Some(matrix);
        if self.mean.is_none() {
            self.set_mean_matrix(None)?;
        }
        if self.current == Representation::Absent {
            self.switch_representation(Representation::Full);
        }
        Ok(())
    }

    /// Installs `mean` (1 x beams), or derives it from the full matrix.
    /// A derived mean is cached; later calls without a matrix keep it.
    pub fn set_mean_matrix(&mut self, mean: Option<DoseMatrix>) -> Result<()> {
        match mean {
            Some(m) => {
                if m.rows() != 1 {
                    return Err(PlanError::Dimension {
                        what: "mean matrix rows",
                        expected: 1,
                        got: m.rows(),
                    });
                }
                self.check_beams("mean matrix beams", Representation::Mean, &m)?;
                self.mean = Some(m);
            }
            None if self.mean.is_some() => {}
            None => {
                let full = self.full.as_ref().ok_or_else(|| {
                    PlanError::MissingData(format!(
                        "structure {}: cannot derive mean matrix without a full matrix",
                        self.label
                    ))
                })?;
                let means = full.column_means();
                self.mean = Some(DoseMatrix::Dense(DMatrix::from_row_slice(
                    1,
                    means.len(),
                    means.as_slice(),
                )));
            }
        }
        Ok(())
    }

    pub fn set_full_and_mean(
        &mut self,
        full: impl Into<DoseMatrix>,
        mean: Option<DoseMatrix>,
    ) -> Result<()> {
        self.set_full_matrix(full)?;
        if mean.is_some() {
            self.set_mean_matrix(mean)?;
        }
        Ok(())
    }

    /// Installs the clustered matrix. Counts are tallied from the voxel map
    /// when not given. All checks run before anything is stored.
    pub fn set_clustered_matrix(
        &mut self,
        matrix: impl Into<DoseMatrix>,
        voxel_to_cluster: Option<Vec<usize>>,
        voxels_per_cluster: Option<Vec<usize>>,
    ) -> Result<()> {
        let matrix = matrix.into();
        self.check_beams("clustered matrix beams", Representation::Clustered, &matrix)?;
        let clusters = matrix.rows();

        if let Some(map) = &voxel_to_cluster
            && map.len() != self.size
        {
            return Err(PlanError::Dimension {
                what: "voxel to cluster map",
                expected: self.size,
                got: map.len(),
            });
        }

        let voxels_per_cluster = match (voxels_per_cluster, &voxel_to_cluster) {
            (Some(counts), map) => {
                if counts.len() != clusters {
                    return Err(PlanError::Dimension {
                        what: "voxels per cluster",
                        expected: clusters,
                        got: counts.len(),
                    });
                }
                if let Some(map) = map {
                    let tally = tally_clusters(map, clusters)?;
                    if let Some((&expected, &got)) =
                        tally.iter().zip(&counts).find(|(t, c)| t != c)
                    {
                        return Err(PlanError::Dimension {
                            what: "voxels in cluster",
                            expected,
                            got,
                        });
                    }
                } else {
                    let total: usize = counts.iter().sum();
                    if total != self.size {
                        return Err(PlanError::Dimension {
                            what: "voxels per cluster total",
                            expected: self.size,
                            got: total,
                        });
                    }
                }
                Some(counts)
            }
            (None, Some(map)) => Some(tally_clusters(map, clusters)?),
            (None, None) => None,
        };

        self.clustered = Some(ClusteredMatrix {
            matrix,
            voxel_to_cluster,
            voxels_per_cluster,
        });
        Ok(())
    }

    pub fn full_matrix(&self) -> Option<&DoseMatrix> {
        self.full.as_ref()
    }

    pub fn clustered(&self) -> Option<&ClusteredMatrix> {
        self.clustered.as_ref()
    }

    pub fn mean_matrix(&self) -> Option<&DoseMatrix> {
        self.mean.as_ref()
    }

    /// Activates `which` if it is installed (clustered needs matrix, map and
    /// counts); otherwise falls back to full, or to [`Representation::Absent`].
    /// Returns the representation actually activated.
    pub fn switch_representation(&mut self, which: Representation) -> Representation {
        let clustered_ready = self.clustered.as_ref().is_some_and(|c| c.is_complete());
        let chosen = match which {
            Representation::Mean if self.mean.is_some() => Representation::Mean,
            Representation::Clustered if clustered_ready => Representation::Clustered,
            _ if self.full.is_some() => Representation::Full,
            _ => Representation::Absent,
        };
        if chosen != which {
            log::warn!(
                "structure {} ({}): {} representation unavailable, using {}",
                self.label,
                self.name,
                which,
                chosen
            );
        }
        log::debug!(
            "switched representation of structure {} ({}) to {}",
            self.label,
            self.name,
            chosen
        );
        self.current = chosen;
        chosen
    }

    pub fn representation(&self) -> Representation {
        self.current
    }

    /// Reinstates a selection saved from [`Structure::representation`].
    pub(crate) fn restore_representation(&mut self, previous: Representation) {
        self.current = previous;
    }

    pub fn active_matrix(&self) -> Option<&DoseMatrix> {
        match self.current {
            Representation::Full => self.full.as_ref(),
            Representation::Clustered => self.clustered.as_ref().map(|c| &c.matrix),
            Representation::Mean => self.mean.as_ref(),
            Representation::Absent => None,
        }
    }

    /// Voxels represented by each row of the active matrix.
    pub fn row_weights(&self) -> Vec<f64> {
        match self.current {
            Representation::Full => vec![1.0; self.size],
            Representation::Clustered => self
                .clustered
                .as_ref()
                .and_then(|c| c.voxels_per_cluster.as_ref())
                .map(|counts| counts.iter().map(|&n| n as f64).collect())
                .unwrap_or_default(),
            Representation::Mean => vec![self.size as f64],
            Representation::Absent => Vec::new(),
        }
    }

    /// Active-representation row doses mapped back onto voxels.
    fn expand_to_voxels(&self, row_doses: DVector<f64>) -> DVector<f64> {
        match self.current {
            Representation::Clustered => {
                let map = self
                    .clustered
                    .as_ref()
                    .and_then(|c| c.voxel_to_cluster.as_ref());
                match map {
                    Some(map) => DVector::from_iterator(map.len(), map.iter().map(|&c| row_doses[c])),
                    None => row_doses,
                }
            }
            Representation::Mean => DVector::from_element(self.size, row_doses[0]),
            _ => row_doses,
        }
    }

    fn missing_representation(&self) -> PlanError {
        PlanError::MissingData(format!(
            "structure {} ({}) has no active dose matrix",
            self.label, self.name
        ))
    }

    /// Linear dose expressions of the active representation over `beams`.
    pub(crate) fn dose_rows(&self, beams: &[VarId]) -> Result<DoseRows> {
        let a = self
            .active_matrix()
            .ok_or_else(|| self.missing_representation())?;
        if a.cols() != beams.len() {
            return Err(PlanError::Dimension {
                what: "beam count",
                expected: beams.len(),
                got: a.cols(),
            });
        }

        let to_expr = |m: &DoseMatrix, i: usize| {
            let mut e = LinearExpr::new();
            for (j, v) in m.row_entries(i) {
                e.add_term(beams[j], v);
            }
            e
        };
        let rows: Vec<LinearExpr> = (0..a.rows()).map(|i| to_expr(a, i)).collect();
        let weights = self.row_weights();

        let mean = match &self.mean {
            Some(m) => to_expr(m, 0),
            None => {
                let mut e = LinearExpr::new();
                for (row, w) in rows.iter().zip(&weights) {
                    e.add_scaled(row, w / self.size as f64);
                }
                e
            }
        };

        Ok(DoseRows {
            rows,
            weights,
            mean,
            size: self.size,
        })
    }

    // ---- dose ----

    /// Recomputes the voxel dose vector and mean dose for beam intensities
    /// `x`, then refreshes the DVH curve, dose density and dose summary.
    pub fn compute_dose(&mut self, x: &DVector<f64>) -> Result<()> {
        let a = self
            .active_matrix()
            .ok_or_else(|| self.missing_representation())?;
        if x.len() != a.cols() {
            return Err(PlanError::Dimension {
                what: "beam vector",
                expected: a.cols(),
                got: x.len(),
            });
        }
        let row_doses = a.apply(x);
        let y = self.expand_to_voxels(row_doses);
        let mean_dose = match &self.mean {
            Some(m) => m.apply(x)[0],
            None => y.iter().sum::<f64>() / y.len() as f64,
        };

        self.dvh_curve.make(y.as_slice());
        self.dose_density.make(y.as_slice());
        self.dose_summary.make(y.as_slice());
        self.dose_vector = Some(y);
        self.mean_dose = Some(mean_dose);
        Ok(())
    }

    pub fn get_dose(&mut self, x: &DVector<f64>) -> Result<&DVector<f64>> {
        self.compute_dose(x)?;
        self.dose_vector
            .as_ref()
            .ok_or_else(|| self.missing_representation())
    }

    pub fn dose_vector(&self) -> Option<&DVector<f64>> {
        self.dose_vector.as_ref()
    }

    pub fn mean_dose(&self) -> Option<f64> {
        self.mean_dose
    }

    pub fn dvh_curve(&self) -> &DvhCurve {
        &self.dvh_curve
    }

    pub fn dose_density(&self) -> &DoseDensity {
        &self.dose_density
    }

    pub fn dose_summary(&self) -> &DoseSummary {
        &self.dose_summary
    }

    // ---- objective ----

    /// `dose` and `w_under` only apply to targets; `w_over` always applies.
    pub fn set_objective(
        &mut self,
        dose: Option<f64>,
        w_under: Option<f64>,
        w_over: Option<f64>,
    ) -> Result<()> {
        if self.is_target {
            if let Some(d) = dose
                && !(d.is_finite() && d > 0.0)
            {
                return Err(PlanError::InvalidPrescription(format!(
                    "target structure {} needs a positive dose, got {}",
                    self.label, d
                )));
            }
            if let Some(w) = w_under {
                check_weight(self.label, w)?;
            }
        }
        if let Some(w) = w_over {
            check_weight(self.label, w)?;
        }

        if self.is_target {
            if let Some(d) = dose {
                self.dose = d;
            }
            if w_under.is_some() {
                self.w_under = w_under;
            }
        }
        if w_over.is_some() {
            self.w_over = w_over;
        }
        Ok(())
    }

    /// Per-voxel underdose weight.
    pub fn w_under(&self) -> Option<f64> {
        self.w_under.map(|w| w / self.size as f64)
    }

    pub fn w_under_raw(&self) -> Option<f64> {
        self.w_under
    }

    /// Per-voxel overdose weight.
    pub fn w_over(&self) -> Option<f64> {
        self.w_over.map(|w| w / self.size as f64)
    }

    pub fn w_over_raw(&self) -> Option<f64> {
        self.w_over
    }

    // ---- constraints ----

    pub fn constraints(&self) -> &ConstraintSet {
        &self.constraints
    }

    pub(crate) fn constraints_mut(&mut self) -> &mut ConstraintSet {
        &mut self.constraints
    }

    pub fn has_constraint(&self, id: ConstraintId) -> bool {
        self.constraints.contains(id)
    }

    pub fn add_constraint(
        &mut self,
        id: ConstraintId,
        constraint: DoseConstraint,
    ) -> Option<DoseConstraint> {
        self.constraints.insert(id, constraint)
    }

    pub fn remove_constraint(&mut self, id: ConstraintId) -> Option<DoseConstraint> {
        self.constraints.remove(id)
    }

    pub fn remove_all_constraints(&mut self) {
        self.constraints.clear();
    }

    /// Edits an attached constraint; unknown ids are reported.
    pub fn set_constraint(
        &mut self,
        id: ConstraintId,
        dose: Option<f64>,
        percentile: Option<f64>,
        relation: Option<Relation>,
    ) -> Result<()> {
        let label = self.label;
        self.constraints
            .get_mut(id)
            .ok_or_else(|| {
                PlanError::MissingData(format!("structure {} has no constraint {}", label, id))
            })?
            .change(dose, percentile, relation)
    }

    // ---- reporting ----

    pub fn plotting_data(&self) -> StructurePlot {
        StructurePlot {
            density: self.dose_density.plotting_data(),
            curve: self.dvh_curve.plotting_data(),
            constraints: self.constraints.plotting_data(),
        }
    }

    fn header_string(&self) -> String {
        if self.name.is_empty() {
            format!("Structure: {}\n", self.label)
        } else {
            format!("Structure: {} ({})\n", self.label, self.name)
        }
    }

    pub fn objective_string(&self) -> String {
        let mut out = self.header_string();
        out += &format!("target? {}\n", self.is_target);
        out += &format!("rx dose: {}\n", self.dose);
        if self.is_target {
            out += &format!("weight_under: {}\n", fmt_weight(self.w_under));
            out += &format!("weight_over: {}\n", fmt_weight(self.w_over));
        } else {
            out += &format!("weight: {}\n", fmt_weight(self.w_over));
        }
        out
    }

    pub fn constraints_string(&self) -> String {
        let mut out = self.header_string();
        for (id, c) in self.constraints.iter() {
            out += &format!("{}: {}\n", id, c);
        }
        out
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.objective_string())?;
        for (id, c) in self.constraints.iter() {
            writeln!(f, "{}: {}", id, c)?;
        }
        Ok(())
    }
}

fn fmt_weight(w: Option<f64>) -> String {
    w.map(|w| w.to_string()).unwrap_or_else(|| "-".to_string())
}

fn check_weight(label: Label, w: f64) -> Result<()> {
    if !w.is_finite() || w < 0.0 {
        return Err(PlanError::InvalidPrescription(format!(
            "structure {}: weights must be finite and non-negative, got {}",
            label, w
        )));
    }
    Ok(())
}
