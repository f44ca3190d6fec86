//! ProjectDocumentManager: Automerge document for a character sheet project.
//!
//! Uses a hybrid approach:
//! - `update_state()` for bulk struct operations (hydrate/reconcile)
//! - `set_view_*()` and `set_part_image()` for targeted O(1) image updates
//! - `store_snapshot()` / `load_store()` to move state in and out of an [`EntityStore`]

use automerge::{transaction::Transactable, AutoCommit, ChangeHash, ObjId, ReadDoc, ScalarValue, Value, ROOT};
use autosurgeon::{hydrate, reconcile};
use paste::paste;
use tracing::debug;

use super::model::{record_path, ProjectRoot};
use crate::error::{SheetError, SheetResult};
use crate::image::ImageData;
use crate::sheet::{EntityKey, EntityStore, PartKey, ViewKind};

/// Generates O(1) setters for the image fields of a view record.
macro_rules! view_image_setters {
    ($($field:ident),* $(,)?) => {
        paste! {
            $(
                #[doc = concat!("Sets the view's `", stringify!($field), "` (O(1) targeted update).")]
                pub fn [<set_view_ $field>](&mut self, kind: ViewKind, image: Option<&ImageData>) -> SheetResult<()> {
                    self.set_field_opt_str(
                        &record_path(&EntityKey::View(kind)),
                        stringify!($field),
                        image.map(ImageData::as_str),
                    )
                }
            )*
        }
    };
}

/// Document manager for one project.
pub struct ProjectDocumentManager {
    doc: AutoCommit,
    /// Cached hydrated state - invalidated after direct document mutations.
    cached_state: Option<ProjectRoot>,
}

impl ProjectDocumentManager {
    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Creates a document for a new project.
    pub fn new(id: impl Into<String>) -> SheetResult<Self> {
        let mut doc = AutoCommit::new();
        let root = ProjectRoot::new(id);
        reconcile(&mut doc, &root)?;
        Ok(Self {
            doc,
            cached_state: Some(root),
        })
    }

    /// Creates a manager from saved binary data.
    pub fn from_bytes(bytes: &[u8]) -> SheetResult<Self> {
        let doc = AutoCommit::load(bytes)?;
        Ok(Self {
            doc,
            cached_state: None,
        })
    }

    /// Saves the document to binary format.
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    pub fn get_heads(&mut self) -> Vec<ChangeHash> {
        self.doc.get_heads()
    }

    /// Gets the actor ID for this document instance.
    pub fn actor_id(&self) -> String {
        self.doc.get_actor().to_hex_string()
    }

    // =========================================================================
    // HIGH-LEVEL OPERATIONS (via Hydrate/Reconcile)
    // =========================================================================

    /// Hydrates the entire document state.
    pub fn get_state(&mut self) -> SheetResult<ProjectRoot> {
        if let Some(ref cached) = self.cached_state {
            return Ok(cached.clone());
        }
        let state: ProjectRoot = hydrate(&self.doc)?;
        self.cached_state = Some(state.clone());
        Ok(state)
    }

    /// Applies a function to mutate the state, then reconciles back to the document.
    pub fn update_state<F>(&mut self, f: F) -> SheetResult<()>
    where
        F: FnOnce(&mut ProjectRoot),
    {
        let mut state = self.get_state()?;
        f(&mut state);
        reconcile(&mut self.doc, &state)?;
        self.cached_state = Some(state);
        Ok(())
    }

    /// Writes the store's current sheet state into the document.
    pub fn store_snapshot(&mut self, store: &EntityStore) -> SheetResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.update_state(|state| {
            state.apply_store(store);
            state.last_updated = now;
        })?;
        debug!(actor = %self.actor_id(), "stored project snapshot");
        Ok(())
    }

    /// Rebuilds a store from the document. Histories start empty.
    pub fn load_store(&mut self, history_limit: usize) -> SheetResult<EntityStore> {
        self.get_state()?.to_store(history_limit)
    }

    // =========================================================================
    // ROOT METADATA OPERATIONS
    // =========================================================================

    /// Sets the project title (O(1)).
    pub fn set_title(&mut self, title: &str) -> SheetResult<()> {
        self.cached_state = None;
        self.doc.put(&ROOT, "title", ScalarValue::Str(title.into()))?;
        Ok(())
    }

    /// Updates the last_updated timestamp (O(1)).
    pub fn touch_last_updated(&mut self, timestamp: i64) -> SheetResult<()> {
        self.cached_state = None;
        self.doc
            .put(&ROOT, "last_updated", ScalarValue::Int(timestamp))?;
        Ok(())
    }

    // =========================================================================
    // IMAGE FIELD SETTERS
    // =========================================================================

    view_image_setters!(original_image, generated_image, user_uploaded_image);

    /// Sets a part sheet image (O(1) targeted update).
    pub fn set_part_image(&mut self, key: &PartKey, image: Option<&ImageData>) -> SheetResult<()> {
        self.set_field_opt_str(
            &record_path(&EntityKey::Part(key.clone())),
            "img_url",
            image.map(ImageData::as_str),
        )
    }

    /// Replaces the color palette.
    pub fn set_color_palette(&mut self, palette: Vec<String>) -> SheetResult<()> {
        self.update_state(|state| state.color_palette = palette)
    }

    // =========================================================================
    // SYNC OPERATIONS
    // =========================================================================

    /// Merges another document into this one.
    pub fn merge(&mut self, other: &mut Self) -> SheetResult<()> {
        self.cached_state = None;
        self.doc.merge(&mut other.doc)?;
        Ok(())
    }

    /// Changes since `their_heads`, or `None` when there are none.
    pub fn generate_sync_message(&mut self, their_heads: &[ChangeHash]) -> Option<Vec<u8>> {
        let changes = self.doc.get_changes(their_heads);
        if changes.is_empty() {
            return None;
        }
        let mut bytes = Vec::new();
        for change in changes {
            bytes.extend(change.raw_bytes());
        }
        Some(bytes)
    }

    /// Applies changes produced by [`Self::generate_sync_message`] on a peer.
    pub fn apply_sync_message(&mut self, msg: &[u8]) -> SheetResult<()> {
        self.cached_state = None;
        self.doc.load_incremental(msg)?;
        Ok(())
    }

    // =========================================================================
    // INTERNAL HELPERS - O(1) OPERATIONS
    // =========================================================================

    fn set_field_opt_str(&mut self, path: &[&str], key: &str, value: Option<&str>) -> SheetResult<()> {
        self.cached_state = None;
        let obj = self.get_obj_at_path(path)?;
        match value {
            Some(v) => self.doc.put(&obj, key, ScalarValue::Str(v.into()))?,
            None => {
                self.doc.delete(&obj, key)?;
            }
        }
        Ok(())
    }

    fn get_obj_at_path(&self, path: &[&str]) -> SheetResult<ObjId> {
        let mut current = ROOT;
        for key in path {
            current = self.get_obj_at_key(&current, key)?;
        }
        Ok(current)
    }

    fn get_obj_at_key(&self, parent: &ObjId, key: &str) -> SheetResult<ObjId> {
        match self.doc.get(parent, key) {
            Ok(Some((Value::Object(_), obj_id))) => Ok(obj_id),
            Ok(Some(_)) => Err(SheetError::serialization(format!(
                "'{}' is not an object",
                key
            ))),
            Ok(None) => Err(SheetError::entity_not_found(key)),
            Err(e) => Err(SheetError::Automerge(e)),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
