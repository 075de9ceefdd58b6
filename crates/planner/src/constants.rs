/// Prescription defaults
pub const DOSE_DEFAULT: f64 = 1.0; // Gy, targets without an explicit dose
pub const W_UNDER_DEFAULT: f64 = 1.0; // target underdose weight
pub const W_OVER_DEFAULT: f64 = 0.05; // target overdose weight
pub const W_NONTARG_DEFAULT: f64 = 0.1; // non-target dose weight

/// Slack penalty per unit dose, indexed by constraint priority.
/// Priority 0 is hard and never receives a slack variable.
pub const SLACK_WEIGHTS_DEFAULT: [f64; 4] = [0.0, 100.0, 10.0, 1.0];
pub const PRIORITY_DEFAULT: u8 = 1;

/// Tolerance used when checking achieved doses against thresholds
pub const DOSE_TOLERANCE: f64 = 1e-6;

/// Dose density grid
pub const DENSITY_GRID_POINTS: usize = 100;

/// Environment variable naming a planner config file
pub const ENV_PLANNER_CONFIG: &str = "PLANNER_CONFIG";

/// Representation names used in config files
pub const REPR_FULL: &str = "full";
pub const REPR_CLUSTERED: &str = "clustered";
pub const REPR_MEAN: &str = "mean";

/// Storage format names accepted for influence matrices
pub const FORMAT_DENSE: &str = "dense";
pub const FORMAT_CSR: &str = "csr";
pub const FORMAT_CSC: &str = "csc";
