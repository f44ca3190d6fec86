//! Project document module.
//!
//! This module provides:
//! - `model`: autosurgeon records mirroring the history-free part of the store
//! - `manager`: `ProjectDocumentManager` for save/load, targeted updates and merge

pub mod manager;
pub mod model;

pub use manager::ProjectDocumentManager;
pub use model::{
    CustomPartRecord, DetectedPartRecord, ModificationRecord, PartRecord, ProjectRoot, ViewRecord,
};
