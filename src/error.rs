use thiserror::Error;

/// Engine-layer failures. State-conflict and not-found outcomes are surfaced
/// at the IPC boundary with their own codes; the engine itself distinguishes
/// rejected input, an unconfigured tenant, and storage failures (which
/// propagate only after the surrounding transaction has rolled back).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    /// A write path needed tenant configuration that was never set up.
    /// Read paths fall back to defaults instead of raising this.
    #[error("school {school_id} is not configured")]
    TenantNotConfigured { school_id: String },

    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl EngineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        EngineError::Validation(reason.into())
    }

    /// Stable code for the IPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_failed",
            EngineError::TenantNotConfigured { .. } => "tenant_not_configured",
            EngineError::Storage(_) => "db_query_failed",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
