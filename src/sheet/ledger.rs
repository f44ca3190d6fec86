//! Modification ledger: ordered user refinement requests attached to a view or part.
//!
//! Entries are kept in the order they were appended. Removal never renumbers the
//! remaining ids. The ledger is replayed into every regeneration of its entity.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{SheetError, SheetResult};
use crate::image::ImageData;

/// Preamble sent ahead of the numbered instruction list. Later steps win.
pub const CUMULATIVE_OVERRIDE_PREAMBLE: &str = "Apply the following modifications in chronological order. \
Each step overrides the reference images and every earlier step for the aspects it mentions; \
keep everything it does not mention faithful to the references.";

/// Immutable refinement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub id: u64,
    /// Free text. May be empty only when `image` is present.
    pub prompt: String,
    pub image: Option<ImageData>,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

impl Modification {
    /// Creates a modification stamped with the current time.
    pub fn new(id: u64, prompt: impl Into<String>, image: Option<ImageData>) -> SheetResult<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() && image.is_none() {
            return Err(SheetError::EmptyModification);
        }
        Ok(Self {
            id,
            prompt,
            image,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Builder: Set timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Ordered list of modifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    entries: Vec<Modification>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<Modification>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Modification] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Modification> {
        self.entries.iter().find(|m| m.id == id)
    }

    /// Highest id in the ledger, if any.
    pub fn max_id(&self) -> Option<u64> {
        self.entries.iter().map(|m| m.id).max()
    }

    /// Appends at the end.
    pub fn append(&mut self, modification: Modification) {
        self.entries.push(modification);
    }

    /// Removes the entry with `id`, keeping the order of the rest.
    pub fn remove(&mut self, id: u64) -> SheetResult<Modification> {
        let index = self
            .entries
            .iter()
            .position(|m| m.id == id)
            .ok_or(SheetError::ModificationNotFound(id))?;
        Ok(self.entries.remove(index))
    }

    /// Renders the ledger as a numbered, chronological instruction list.
    /// Returns `None` for an empty ledger.
    pub fn render_instructions(&self) -> Option<String> {
        render_instructions(&self.entries)
    }
}

/// Renders modifications as the cumulative-override instruction block handed to
/// the collaborator.
pub fn render_instructions(modifications: &[Modification]) -> Option<String> {
    if modifications.is_empty() {
        return None;
    }
    let mut out = String::from(CUMULATIVE_OVERRIDE_PREAMBLE);
    for (i, m) in modifications.iter().enumerate() {
        let text = m.prompt.trim();
        let line = match (text.is_empty(), m.image.is_some()) {
            (true, _) => "Match the attached reference image.".to_string(),
            (false, true) => format!("{} (see attached reference image)", text),
            (false, false) => text.to_string(),
        };
        out.push_str(&format!("\n{}. {}", i + 1, line));
    }
    Some(out)
}

// =============================================================================
// TESTS
// =============================================================================
