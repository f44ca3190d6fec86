//! Data models for the character sheet: views, part sheets and their keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::history::{HistoryState, Versioned};
use super::ledger::Ledger;
use crate::image::{BoundingBox, ImageData};

// =============================================================================
// VIEW KIND / POSE
// =============================================================================

/// One of the four canonical character orientations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Front,
    SemiSide,
    Side,
    Back,
}

impl ViewKind {
    pub const ALL: [ViewKind; 4] = [
        ViewKind::Front,
        ViewKind::SemiSide,
        ViewKind::Side,
        ViewKind::Back,
    ];

    /// Stable identifier used in documents and logs.
    pub fn slug(&self) -> &'static str {
        match self {
            ViewKind::Front => "front",
            ViewKind::SemiSide => "semi_side",
            ViewKind::Side => "side",
            ViewKind::Back => "back",
        }
    }

    /// Human readable name passed to the collaborator.
    pub fn label(&self) -> &'static str {
        match self {
            ViewKind::Front => "front view",
            ViewKind::SemiSide => "3/4 view",
            ViewKind::Side => "side view",
            ViewKind::Back => "back view",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.slug() == slug)
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Pose requested for a generated view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pose {
    /// Keep whatever pose the source shows.
    Original,
    /// Neutral standing pose, arms slightly away from the body.
    #[default]
    APose,
    TPose,
}

// =============================================================================
// PART KEYS
// =============================================================================

/// Standard body/costume regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Face,
    Hair,
    Upper,
    Lower,
    Shoes,
    Hands,
    Accessories,
}

impl PartKind {
    pub const ALL: [PartKind; 7] = [
        PartKind::Face,
        PartKind::Hair,
        PartKind::Upper,
        PartKind::Lower,
        PartKind::Shoes,
        PartKind::Hands,
        PartKind::Accessories,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            PartKind::Face => "face",
            PartKind::Hair => "hair",
            PartKind::Upper => "upper",
            PartKind::Lower => "lower",
            PartKind::Shoes => "shoes",
            PartKind::Hands => "hands",
            PartKind::Accessories => "accessories",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PartKind::Face => "Face",
            PartKind::Hair => "Hair",
            PartKind::Upper => "Upper body clothing",
            PartKind::Lower => "Lower body clothing",
            PartKind::Shoes => "Shoes",
            PartKind::Hands => "Hands",
            PartKind::Accessories => "Accessories",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.slug() == slug)
    }
}

/// Opaque id of a user-defined part, derived at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomPartId(String);

impl CustomPartId {
    pub const PREFIX: &'static str = "custom-";

    /// Generates a fresh id.
    pub fn generate() -> Self {
        Self(format!("{}{}", Self::PREFIX, Uuid::new_v4().simple()))
    }

    /// Wraps an existing id (e.g. one loaded from a document).
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomPartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a part sheet: a standard region or a user-defined one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKey {
    Standard(PartKind),
    Custom(CustomPartId),
}

impl PartKey {
    /// Stable string form: the standard slug or the custom id.
    pub fn slug(&self) -> &str {
        match self {
            PartKey::Standard(kind) => kind.slug(),
            PartKey::Custom(id) => id.as_str(),
        }
    }

    /// Inverse of [`PartKey::slug`]. Unknown strings are treated as custom ids.
    pub fn from_slug(slug: &str) -> Self {
        match PartKind::from_slug(slug) {
            Some(kind) => PartKey::Standard(kind),
            None => PartKey::Custom(CustomPartId::from_raw(slug)),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, PartKey::Custom(_))
    }
}

impl From<PartKind> for PartKey {
    fn from(kind: PartKind) -> Self {
        PartKey::Standard(kind)
    }
}

impl fmt::Display for PartKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Anything that owns a history and can be regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKey {
    View(ViewKind),
    Part(PartKey),
}

impl From<ViewKind> for EntityKey {
    fn from(kind: ViewKind) -> Self {
        EntityKey::View(kind)
    }
}

impl From<PartKey> for EntityKey {
    fn from(key: PartKey) -> Self {
        EntityKey::Part(key)
    }
}

impl From<PartKind> for EntityKey {
    fn from(kind: PartKind) -> Self {
        EntityKey::Part(PartKey::Standard(kind))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::View(kind) => write!(f, "view:{}", kind),
            EntityKey::Part(key) => write!(f, "part:{}", key),
        }
    }
}

/// What an entity is currently waiting on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    #[default]
    Idle,
    Regenerating,
    Upscaling,
}

// =============================================================================
// CUSTOM PART
// =============================================================================

/// A user-defined part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPart {
    pub id: CustomPartId,
    /// User-editable free text, also used as the detection label.
    pub label: String,
}

impl CustomPart {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: CustomPartId::generate(),
            label: label.into(),
        }
    }

    pub fn key(&self) -> PartKey {
        PartKey::Custom(self.id.clone())
    }
}

// =============================================================================
// VIEW
// =============================================================================

/// A detected crop of a part inside one image.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPart {
    pub bbox: BoundingBox,
    pub image: ImageData,
}

impl DetectedPart {
    pub fn new(bbox: BoundingBox, image: ImageData) -> Self {
        Self { bbox, image }
    }
}

/// Detection results for one image; `None` marks a part looked for but not found.
pub type PartCrops = BTreeMap<PartKey, Option<DetectedPart>>;

/// Canonical view state.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub kind: ViewKind,
    /// Current working image. Always the upload, the generated image, or a
    /// value restored from history.
    pub original_image: Option<ImageData>,
    /// Raw upload; untouched by generation.
    pub user_uploaded_image: Option<ImageData>,
    /// Last image produced for this view.
    pub generated_image: Option<ImageData>,
    pub parts: PartCrops,
    pub modifications: Ledger,
    pub history: HistoryState<ViewSnapshot>,
}

/// Visible fields of a view captured for undo.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub original_image: Option<ImageData>,
    pub user_uploaded_image: Option<ImageData>,
    pub generated_image: Option<ImageData>,
    pub parts: PartCrops,
    pub modifications: Ledger,
}

impl View {
    pub fn new(kind: ViewKind, history_limit: usize) -> Self {
        Self {
            kind,
            original_image: None,
            user_uploaded_image: None,
            generated_image: None,
            parts: BTreeMap::new(),
            modifications: Ledger::new(),
            history: HistoryState::new(history_limit),
        }
    }

    /// Detected crop for a part, if present.
    pub fn crop(&self, key: &PartKey) -> Option<&DetectedPart> {
        self.parts.get(key).and_then(|p| p.as_ref())
    }

    /// Image a regeneration or upscale would start from.
    pub fn working_image(&self) -> Option<&ImageData> {
        self.original_image
            .as_ref()
            .or(self.user_uploaded_image.as_ref())
    }
}

impl Versioned for View {
    type Snapshot = ViewSnapshot;

    fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            original_image: self.original_image.clone(),
            user_uploaded_image: self.user_uploaded_image.clone(),
            generated_image: self.generated_image.clone(),
            parts: self.parts.clone(),
            modifications: self.modifications.clone(),
        }
    }

    fn restore(&mut self, snapshot: ViewSnapshot) {
        self.original_image = snapshot.original_image;
        self.user_uploaded_image = snapshot.user_uploaded_image;
        self.generated_image = snapshot.generated_image;
        self.parts = snapshot.parts;
        self.modifications = snapshot.modifications;
    }

    fn history(&self) -> &HistoryState<ViewSnapshot> {
        &self.history
    }

    fn history_mut(&mut self) -> &mut HistoryState<ViewSnapshot> {
        &mut self.history
    }
}

// =============================================================================
// PART SHEET
// =============================================================================

/// Composite multi-angle sheet for one part.
#[derive(Debug, Clone, PartialEq)]
pub struct PartSheet {
    pub key: PartKey,
    pub img_url: Option<ImageData>,
    /// Mirrors the store's activity registry for this part.
    pub is_loading: bool,
    pub modifications: Ledger,
    pub history: HistoryState<PartSnapshot>,
}

/// Visible fields of a part sheet captured for undo.
#[derive(Debug, Clone, PartialEq)]
pub struct PartSnapshot {
    pub img_url: Option<ImageData>,
    pub modifications: Ledger,
}

impl PartSheet {
    pub fn new(key: PartKey, history_limit: usize) -> Self {
        Self {
            key,
            img_url: None,
            is_loading: false,
            modifications: Ledger::new(),
            history: HistoryState::new(history_limit),
        }
    }
}

impl Versioned for PartSheet {
    type Snapshot = PartSnapshot;

    fn snapshot(&self) -> PartSnapshot {
        PartSnapshot {
            img_url: self.img_url.clone(),
            modifications: self.modifications.clone(),
        }
    }

    fn restore(&mut self, snapshot: PartSnapshot) {
        self.img_url = snapshot.img_url;
        self.modifications = snapshot.modifications;
    }

    fn history(&self) -> &HistoryState<PartSnapshot> {
        &self.history
    }

    fn history_mut(&mut self) -> &mut HistoryState<PartSnapshot> {
        &mut self.history
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::ledger::Modification;

    #[test]
    fn test_part_key_slug_round_trip() {
        for kind in PartKind::ALL {
            assert_eq!(PartKey::from_slug(kind.slug()), PartKey::Standard(kind));
        }
        let custom = CustomPart::new("Cape");
        assert!(custom.id.as_str().starts_with(CustomPartId::PREFIX));
        assert_eq!(PartKey::from_slug(custom.id.as_str()), custom.key());
    }

    #[test]
    fn test_view_kind_slugs() {
        for kind in ViewKind::ALL {
            assert_eq!(ViewKind::from_slug(kind.slug()), Some(kind));
        }
        assert_eq!(ViewKind::from_slug("top"), None);
    }

    #[test]
    fn test_entity_key_display() {
        assert_eq!(EntityKey::from(ViewKind::SemiSide).to_string(), "view:semi_side");
        assert_eq!(EntityKey::from(PartKind::Hair).to_string(), "part:hair");
    }

    #[test]
    fn test_view_snapshot_excludes_upload() {
        let upload = ImageData::from_bytes("image/png", b"upload");
        let generated = ImageData::from_bytes("image/png", b"generated");

        let mut view = View::new(ViewKind::Front, 10);
        view.user_uploaded_image = Some(upload.clone());
        view.original_image = Some(upload.clone());

        view.snapshot_before_change();
        view.original_image = Some(generated.clone());
        view.generated_image = Some(generated);

        assert!(view.undo());
        assert_eq!(view.original_image, Some(upload.clone()));
        assert_eq!(view.generated_image, None);
        assert_eq!(view.user_uploaded_image, Some(upload));
        assert_eq!(view.history.undo_len(), 0);
        assert_eq!(view.history.redo_len(), 1);
    }

    #[test]
    fn test_part_sheet_undo_restores_ledger() {
        let mut sheet = PartSheet::new(PartKind::Face.into(), 10);
        sheet.snapshot_before_change();
        sheet
            .modifications
            .append(Modification::new(1, "freckles", None).unwrap());
        sheet.img_url = Some(ImageData::from_bytes("image/png", b"sheet"));

        assert!(sheet.undo());
        assert!(sheet.modifications.is_empty());
        assert!(sheet.img_url.is_none());

        assert!(sheet.redo());
        assert_eq!(sheet.modifications.len(), 1);
        assert!(sheet.img_url.is_some());
    }
}
