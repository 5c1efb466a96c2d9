use thiserror::Error;

/// Classified failures raised by the ingestion engine.
///
/// These travel inside `anyhow::Error`; callers that need to tell a
/// structural problem from a per-observation failure use `downcast_ref`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{file}: {field}: {detail}")]
    Structural {
        file: String,
        field: String,
        detail: String,
    },
    #[error("membership reference {reference} is not present in the archive")]
    UnresolvedMember { reference: String },
    #[error("observation {observation}: {detail}")]
    Reconciliation { observation: String, detail: String },
    #[error("observation record is locked by another writer: {uri}")]
    Locked { uri: String },
    #[error("configuration invalid: {0}")]
    Config(String),
}

impl IngestError {
    pub fn structural(
        file: impl Into<String>,
        field: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Structural {
            file: file.into(),
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub fn reconciliation(observation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Reconciliation {
            observation: observation.into(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Structural { .. } => "structural",
            Self::UnresolvedMember { .. } => "unresolved-member",
            Self::Reconciliation { .. } => "reconciliation",
            Self::Locked { .. } => "locked",
            Self::Config(_) => "config",
        }
    }
}

/// Label an arbitrary error for reports: the taxonomy kind when the error
/// chain carries an `IngestError`, `unexpected` otherwise.
pub fn classify(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<IngestError>()
        .map(IngestError::kind)
        .unwrap_or("unexpected")
}
