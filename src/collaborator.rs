//! Contract with the external image generation/analysis service.
//!
//! The orchestrator treats the collaborator as an opaque async boundary: given
//! reference images and instructions it returns zero or one image. `Ok(None)`
//! and `Err(_)` are both handled as "no change" by the caller.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::SheetResult;
use crate::image::{BoundingBox, ImageData};
use crate::sheet::{render_instructions, Modification, PartKey, Pose, ViewKind};

/// Boxes keyed by part name: a standard slug (`"face"`) or a custom label.
pub type Detections = HashMap<String, BoundingBox>;

/// Maximum number of palette entries kept.
pub const MAX_PALETTE_LEN: usize = 8;

/// Input of `generate_view`.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRequest {
    pub source: ImageData,
    pub target: ViewKind,
    pub pose: Pose,
    /// Full ledger of the target view, oldest first.
    pub modifications: Vec<Modification>,
    /// Secondary context image (e.g. the 3/4 view when normalizing the front).
    pub context: Option<ImageData>,
}

impl ViewRequest {
    /// Numbered cumulative-override instructions for the ledger.
    pub fn instructions(&self) -> Option<String> {
        render_instructions(&self.modifications)
    }
}

/// Input of `generate_composite_sheet`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRequest {
    /// Ordered references as chosen by the resolver.
    pub images: Vec<ImageData>,
    pub part: PartKey,
    pub label: String,
    pub modifications: Vec<Modification>,
    /// Global style override plus any balance weighting note.
    pub style_prompt: Option<String>,
}

impl CompositeRequest {
    pub fn instructions(&self) -> Option<String> {
        render_instructions(&self.modifications)
    }
}

/// The image generation/analysis service boundary.
///
/// Generated images keep the source's art style on a pure white background.
/// Composite sheets use a wide multi-angle layout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageCollaborator: Send + Sync {
    /// Locates standard parts plus `custom_labels`. Zero boxes mean "not present".
    async fn analyze_image(
        &self,
        image: ImageData,
        custom_labels: Vec<String>,
    ) -> SheetResult<Option<Detections>>;

    async fn generate_view(&self, request: ViewRequest) -> SheetResult<Option<ImageData>>;

    async fn generate_composite_sheet(
        &self,
        request: CompositeRequest,
    ) -> SheetResult<Option<ImageData>>;

    /// Best effort; 6 to 8 hex colors, or empty.
    async fn extract_palette(&self, image: ImageData) -> SheetResult<Vec<String>>;

    async fn upscale_image(&self, image: ImageData) -> SheetResult<Option<ImageData>>;

    /// Text-to-image seed for a project without an upload.
    async fn generate_from_prompt(&self, prompt: String) -> SheetResult<Option<ImageData>>;
}

/// Keeps well-formed `#RRGGBB` entries, uppercased, de-duplicated, at most
/// [`MAX_PALETTE_LEN`].
pub fn normalize_palette(colors: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(MAX_PALETTE_LEN);
    for color in colors {
        let trimmed = color.trim();
        let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let normalized = format!("#{}", hex.to_ascii_uppercase());
        if !out.contains(&normalized) {
            out.push(normalized);
        }
        if out.len() == MAX_PALETTE_LEN {
            break;
        }
    }
    out
}

// =============================================================================
// TESTS
// =============================================================================
