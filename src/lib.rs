//! Charsheet - generation orchestration and versioned state engine for character sheets.
//!
//! A project turns one reference image (or a text prompt) into four canonical views
//! (front, 3/4, side, back) plus per-part composite sheets, through an external
//! image collaborator:
//!
//! - **Entity store**: views and part sheets, each with bounded undo/redo
//! - **Reference resolver**: picks part sheet inputs according to a 0..=10 balance
//! - **Orchestrator**: the reference-view pipeline, per-entity regeneration and upscaling,
//!   part detection and ledger-driven regeneration, with per-entity in-flight gating
//! - **Batch coordinator**: parallel fan-out with isolated per-entity failures
//! - **Project document**: Automerge snapshot of the store for save/load/merge
//!
//! # Example
//!
//! ```rust
//! use charsheet::{EntityKey, EntityStore, ImageData, PartKind, ViewKind};
//!
//! let mut store = EntityStore::default();
//! store
//!     .upload_view_image(ViewKind::Front, ImageData::from_bytes("image/png", b"front"))
//!     .unwrap();
//!
//! // Ledger edits are snapshotted and can be undone.
//! let hair = EntityKey::from(PartKind::Hair);
//! store.append_modification(&hair, "silver braids", None).unwrap();
//! assert!(store.undo(&hair).unwrap());
//! assert!(store.modifications(&hair).unwrap().is_empty());
//! ```

pub mod batch;
pub mod collaborator;
pub mod config;
pub mod document;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod sheet;

// Re-exports for convenience
pub use batch::{BatchCoordinator, BatchOperation, BatchReport};
pub use collaborator::{CompositeRequest, Detections, ImageCollaborator, ViewRequest};
pub use config::OrchestratorConfig;
pub use document::{ProjectDocumentManager, ProjectRoot};
pub use error::{SheetError, SheetResult};
pub use image::{BoundingBox, CropRegion, Cropper, ImageData};
pub use orchestrator::{
    DetectionReport, DispatchOutcome, Orchestrator, Phase, PipelineAbort, PipelineReport, Progress,
};
pub use sheet::{
    Activity, CustomPart, CustomPartId, EntityKey, EntityStore, Ledger, Modification, PartKey,
    PartKind, PartSheet, Pose, View, ViewKind,
};
