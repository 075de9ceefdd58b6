use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlanError>;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Unsupported matrix container: {0}")]
    MatrixType(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Index out of range: {what} {index} (bound {bound})")]
    Index {
        what: &'static str,
        index: usize,
        bound: usize,
    },

    #[error("Dimension mismatch for {what}: expected {expected}, got {got}")]
    Dimension {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Problem infeasible: {0}")]
    Infeasible(String),

    #[error("Planning failed after voxel classification: {0}")]
    PlanningFailure(String),

    #[error("Optimization solver error: {0}")]
    Solver(String),

    #[error("Invalid prescription: {0}")]
    InvalidPrescription(String),

    #[error("Invalid dose constraint: {0}")]
    InvalidConstraint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(String),
}

/// Error category without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Type,
    MissingData,
    Index,
    Dimension,
    Infeasible,
    PlanningFailure,
    Solver,
    Input,
    Config,
    Io,
}

impl PlanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlanError::MatrixType(_) => ErrorKind::Type,
            PlanError::MissingData(_) => ErrorKind::MissingData,
            PlanError::Index { .. } => ErrorKind::Index,
            PlanError::Dimension { .. } => ErrorKind::Dimension,
            PlanError::Infeasible(_) => ErrorKind::Infeasible,
            PlanError::PlanningFailure(_) => ErrorKind::PlanningFailure,
            PlanError::Solver(_) => ErrorKind::Solver,
            PlanError::InvalidPrescription(_) | PlanError::InvalidConstraint(_) => {
                ErrorKind::Input
            }
            PlanError::Config(_) => ErrorKind::Config,
            PlanError::Io(_) | PlanError::Csv(_) | PlanError::Json(_) => ErrorKind::Io,
        }
    }
}

impl From<toml::de::Error> for PlanError {
    fn from(err: toml::de::Error) -> Self {
        PlanError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<serde_json::Error> for PlanError {
    fn from(err: serde_json::Error) -> Self {
        PlanError::Json(err.to_string())
    }
}
