pub mod case;
pub mod config;
pub mod constants;
pub mod constraints;
pub mod dvh;
pub mod error;
pub mod export;
pub mod matrix;
pub mod optimize;
pub mod structure;

pub use case::{Case, Prescription};
pub use config::Config;
pub use constraints::{ConstraintId, DoseConstraint, DoseMean, DosePercent, Relation};
pub use error::{ErrorKind, PlanError, Result};
pub use matrix::{DoseMatrix, DoseOperator};
pub use optimize::{Pass2Slack, PlanOptions, PlanReport, Planner};
pub use structure::{Label, Representation, Structure, StructureOptions};
