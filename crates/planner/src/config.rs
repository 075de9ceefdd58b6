use crate::constants::{ENV_PLANNER_CONFIG, SLACK_WEIGHTS_DEFAULT};
use crate::error::{PlanError, Result};
use crate::optimize::{Pass2Slack, PlanOptions};
use crate::structure::Representation;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub planner: PlannerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub use_slack: bool,
    pub use_2pass: bool,
    /// "keep" | "drop"
    pub pass2_slack: Pass2Slack,
    /// penalty per priority, index = priority
    pub slack_weights: Vec<f64>,
    /// "full" | "clustered" | "mean"; absent keeps each structure's own
    pub representation: Option<Representation>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            use_slack: true,
            use_2pass: false,
            pass2_slack: Pass2Slack::Keep,
            slack_weights: SLACK_WEIGHTS_DEFAULT.to_vec(),
            representation: Some(Representation::Full),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PlanError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            PlanError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reads the file named by `PLANNER_CONFIG`, or returns the defaults when
    /// the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(ENV_PLANNER_CONFIG) {
            Some(path) => {
                log::info!("loading planner config from {}", Path::new(&path).display());
                Self::load_from_file(path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let weights = &self.planner.slack_weights;
        if weights.is_empty() {
            return Err(PlanError::Config(
                "planner.slack_weights must not be empty".to_string(),
            ));
        }
        if let Some((i, w)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(PlanError::Config(format!(
                "planner.slack_weights[{}] must be finite and non-negative, got {}",
                i, w
            )));
        }
        if self.planner.representation == Some(Representation::Absent) {
            return Err(PlanError::Config(
                "planner.representation must be 'full', 'clustered' or 'mean'".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_plan_options(&self) -> PlanOptions {
        PlanOptions {
            use_slack: self.planner.use_slack,
            use_2pass: self.planner.use_2pass,
            pass2_slack: self.planner.pass2_slack,
            slack_weights: self.planner.slack_weights.clone(),
            representation: self.planner.representation,
        }
    }

    pub fn debug_print(&self) {
        log::debug!("=== planner config ===");
        log::debug!("use_slack: {}", self.planner.use_slack);
        log::debug!("use_2pass: {}", self.planner.use_2pass);
        log::debug!("pass2_slack: {:?}", self.planner.pass2_slack);
        log::debug!("slack_weights: {:?}", self.planner.slack_weights);
        log::debug!("representation: {:?}", self.planner.representation);
    }
}
