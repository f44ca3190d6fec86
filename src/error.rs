//! Error types for the character sheet engine.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for sheet operations.
pub type SheetResult<T> = Result<T, SheetError>;

/// Errors that can occur while editing or generating a character sheet.
#[derive(Error, Debug)]
pub enum SheetError {
    /// Automerge error during document operations.
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    /// Autosurgeon hydration error.
    #[error("Hydration error: {0}")]
    Hydrate(#[from] autosurgeon::HydrateError),

    /// Autosurgeon reconcile error.
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] autosurgeon::ReconcileError),

    /// View, part or custom part not found in the store.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// A required source image is missing before a phase could start.
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// The entity has an outstanding regeneration or upscale.
    #[error("Entity is busy: {0}")]
    EntityBusy(String),

    /// The project pipeline is already running.
    #[error("Pipeline already running")]
    PipelineBusy,

    /// Reference balance outside of 0..=10.
    #[error("Reference balance {0} out of range 0..=10")]
    InvalidBalance(i64),

    /// A modification needs a prompt or an image.
    #[error("Modification must carry a prompt or an image")]
    EmptyModification,

    /// Modification id not present in the ledger.
    #[error("Modification not found: {0}")]
    ModificationNotFound(u64),

    /// The external collaborator failed.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// The external collaborator did not answer in time.
    #[error("Collaborator call timed out after {0:?}")]
    Timeout(Duration),

    /// Image payload is not a base64 data URI.
    #[error("Invalid data URI: {0}")]
    InvalidDataUri(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SheetError {
    /// Creates an EntityNotFound error.
    pub fn entity_not_found(id: impl Into<String>) -> Self {
        Self::EntityNotFound(id.into())
    }

    /// Creates a MissingInput error.
    pub fn missing_input(msg: impl Into<String>) -> Self {
        Self::MissingInput(msg.into())
    }

    /// Creates an EntityBusy error.
    pub fn entity_busy(id: impl Into<String>) -> Self {
        Self::EntityBusy(id.into())
    }

    /// Creates a Collaborator error.
    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    /// Creates an InvalidDataUri error.
    pub fn invalid_data_uri(msg: impl Into<String>) -> Self {
        Self::InvalidDataUri(msg.into())
    }

    /// Creates a Serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True for failures raised at the collaborator boundary.
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(self, Self::Collaborator(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for SheetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
