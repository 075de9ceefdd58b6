//! Dose statistics derived from a voxel dose vector.
//!
//! Each collector is stateful: `make` replaces whatever was derived from the
//! previous dose vector, and the accessors only ever read that snapshot.

use crate::constants::DENSITY_GRID_POINTS;
use serde::Serialize;

/// Cumulative dose-volume histogram.
#[derive(Debug, Clone, Default)]
pub struct DvhCurve {
    // sorted descending
    doses: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DvhPlot {
    /// ascending dose values
    pub dose: Vec<f64>,
    /// % of volume receiving at least `dose`
    pub percentile: Vec<f64>,
}

impl DvhCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make(&mut self, doses: &[f64]) {
        self.doses = doses.to_vec();
        self.doses.sort_by(|a, b| b.total_cmp(a));
    }

    pub fn is_empty(&self) -> bool {
        self.doses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.doses.len()
    }

    /// D_p: the dose received by at least `percentile`% of the voxels.
    pub fn dose_at_percentile(&self, percentile: f64) -> Option<f64> {
        dose_at_percentile_sorted(&self.doses, percentile)
    }

    /// V_d: % of voxels receiving at least `dose`.
    pub fn percentile_at_dose(&self, dose: f64) -> Option<f64> {
        if self.doses.is_empty() {
            return None;
        }
        let count = self.doses.iter().take_while(|&&d| d >= dose).count();
        Some(100.0 * count as f64 / self.doses.len() as f64)
    }

    pub fn max_dose(&self) -> Option<f64> {
        self.doses.first().copied()
    }

    pub fn min_dose(&self) -> Option<f64> {
        self.doses.last().copied()
    }

    pub fn plotting_data(&self) -> DvhPlot {
        let n = self.doses.len();
        let mut plot = DvhPlot {
            dose: Vec::with_capacity(n),
            percentile: Vec::with_capacity(n),
        };
        for (i, &d) in self.doses.iter().rev().enumerate() {
            plot.dose.push(d);
            plot.percentile.push(100.0 * (n - i) as f64 / n as f64);
        }
        plot
    }
}

/// `doses` must be sorted descending.
pub(crate) fn dose_at_percentile_sorted(doses: &[f64], percentile: f64) -> Option<f64> {
    if doses.is_empty() {
        return None;
    }
    let n = doses.len();
    let k = ((percentile / 100.0) * n as f64 - 1e-9).ceil() as usize;
    Some(doses[k.clamp(1, n) - 1])
}

/// Gaussian kernel density estimate of the dose distribution.
#[derive(Debug, Clone, Default)]
pub struct DoseDensity {
    grid: Vec<f64>,
    density: Vec<f64>,
    bandwidth: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DensityPlot {
    pub dose: Vec<f64>,
    pub density: Vec<f64>,
}

impl DoseDensity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make(&mut self, doses: &[f64]) {
        self.grid.clear();
        self.density.clear();
        if doses.is_empty() {
            self.bandwidth = 0.0;
            return;
        }

        let n = doses.len() as f64;
        let (mean, std) = mean_std(doses);
        let lo = doses.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = doses.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        // Silverman's rule; degenerate distributions get a small fixed width
        let h = if std > 0.0 {
            1.06 * std * n.powf(-0.2)
        } else {
            1e-3 * mean.abs().max(1.0)
        };
        self.bandwidth = h;

        let start = lo - 3.0 * h;
        let step = (hi - lo + 6.0 * h) / (DENSITY_GRID_POINTS - 1) as f64;
        let norm = 1.0 / (n * h * (2.0 * std::f64::consts::PI).sqrt());
        for g in 0..DENSITY_GRID_POINTS {
            let t = start + g as f64 * step;
            let value: f64 = doses
                .iter()
                .map(|&d| {
                    let u = (t - d) / h;
                    (-0.5 * u * u).exp()
                })
                .sum();
            self.grid.push(t);
            self.density.push(norm * value);
        }
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    pub fn plotting_data(&self) -> DensityPlot {
        DensityPlot {
            dose: self.grid.clone(),
            density: self.density.clone(),
        }
    }
}

/// Summary statistics of the dose over a structure.
#[derive(Debug, Clone, Default)]
pub struct DoseSummary {
    table: Option<DoseSummaryTable>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DoseSummaryTable {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    #[serde(rename = "D2")]
    pub d2: f64,
    #[serde(rename = "D50")]
    pub d50: f64,
    #[serde(rename = "D98")]
    pub d98: f64,
    /// (D2 - D98) / D50
    pub homogeneity_index: f64,
}

impl DoseSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make(&mut self, doses: &[f64]) {
        if doses.is_empty() {
            self.table = None;
            return;
        }
        let mut sorted = doses.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let (mean, std) = mean_std(doses);
        let d = |p: f64| dose_at_percentile_sorted(&sorted, p).unwrap_or(0.0);
        let (d2, d50, d98) = (d(2.0), d(50.0), d(98.0));
        self.table = Some(DoseSummaryTable {
            mean,
            std,
            min: sorted[sorted.len() - 1],
            max: sorted[0],
            d2,
            d50,
            d98,
            homogeneity_index: if d50 > 0.0 { (d2 - d98) / d50 } else { 0.0 },
        });
    }

    pub fn table_data(&self) -> Option<&DoseSummaryTable> {
        self.table.as_ref()
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
