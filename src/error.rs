use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorDbError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid arguments: {0}")]
    Validation(String),

    #[error("No record was found for {operation} on {model}")]
    NotFound { model: String, operation: String },

    #[error("Unique constraint failed on {model}.{constraint}")]
    UniqueConstraint { model: String, constraint: String },

    #[error("No related record found to connect on {model}.{field}")]
    RelationNotFound { model: String, field: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl MirrorDbError {
    /// Stable machine-readable code, matching the wire codes a real
    /// engine-backed client would emit. Callers pattern-match on these.
    pub fn code(&self) -> &'static str {
        match self {
            MirrorDbError::UniqueConstraint { .. } => "P2002",
            MirrorDbError::RelationNotFound { .. } => "P2018",
            MirrorDbError::NotFound { .. } => "P2025",
            MirrorDbError::Validation(_) | MirrorDbError::Schema(_) => "P2009",
            _ => "P0000",
        }
    }
}

pub type Result<T> = std::result::Result<T, MirrorDbError>;
