//! Orchestrator configuration.
//!
//! Loaded from JSON; every field has a default so partial documents are accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SheetResult;
use crate::image::DEFAULT_PADDING_RATIO;
use crate::sheet::{EntityStore, Pose, DEFAULT_HISTORY_LIMIT};

/// Settings for one orchestrator instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Undo depth per entity.
    pub history_limit: usize,
    /// Per-call collaborator timeout in seconds. `None` waits forever.
    pub call_timeout_secs: Option<u64>,
    /// Pose requested for generated views.
    pub pose: Pose,
    /// Only the front view takes part in generation.
    pub single_view_mode: bool,
    /// Reference balance a fresh store starts with.
    pub initial_balance: u8,
    /// Global style override passed to part sheet generation.
    pub style_prompt: Option<String>,
    /// Padding around detected boxes, as a fraction of the box size.
    pub padding_ratio: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            call_timeout_secs: Some(120),
            pose: Pose::default(),
            single_view_mode: false,
            initial_balance: 5,
            style_prompt: None,
            padding_ratio: DEFAULT_PADDING_RATIO,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    pub fn from_json(json: &str) -> SheetResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> SheetResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Builder: Set history limit.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Builder: Set collaborator timeout.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout_secs = timeout.map(|d| d.as_secs().max(1));
        self
    }

    /// Builder: Set pose.
    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = pose;
        self
    }

    /// Builder: Set single-view mode.
    pub fn with_single_view_mode(mut self, enabled: bool) -> Self {
        self.single_view_mode = enabled;
        self
    }

    /// Builder: Set initial balance.
    pub fn with_initial_balance(mut self, balance: u8) -> Self {
        self.initial_balance = balance;
        self
    }

    /// Builder: Set style prompt.
    pub fn with_style_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.style_prompt = Some(prompt.into());
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }

    /// Builds an empty store honoring these settings.
    pub fn build_store(&self) -> SheetResult<EntityStore> {
        let mut store = EntityStore::new(self.history_limit);
        store.set_reference_balance(i64::from(self.initial_balance))?;
        store.set_single_view_mode(self.single_view_mode);
        Ok(store)
    }
}

// =============================================================================
// TESTS
// =============================================================================
