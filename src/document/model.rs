//! Document records for a saved character sheet project.
//!
//! These structs use autosurgeon derives for automatic CRDT serialization. They
//! hold a history-free copy of the store: undo stacks, activity and the reference
//! balance are session state and are never written to the document.

use std::collections::{BTreeMap, HashMap};

use autosurgeon::{Hydrate, Reconcile};
use serde::{Deserialize, Serialize};

use crate::error::{SheetError, SheetResult};
use crate::image::{BoundingBox, ImageData};
use crate::sheet::{
    CustomPart, CustomPartId, DetectedPart, EntityKey, EntityStore, Ledger, Modification,
    PartCrops, PartKey, ViewKind,
};

// =============================================================================
// DOCUMENT ROOT
// =============================================================================

/// Root document structure for a character sheet project.
#[derive(Debug, Clone, Default, Reconcile, Hydrate, Serialize, Deserialize, PartialEq)]
pub struct ProjectRoot {
    /// Unique identifier
    pub id: String,
    pub title: String,

    /// Timestamps (milliseconds since epoch)
    pub created_at: i64,
    pub last_updated: i64,

    pub single_view_mode: bool,

    /// View ordering (view slugs)
    pub view_order: Vec<String>,
    /// Views keyed by slug
    pub views: HashMap<String, ViewRecord>,

    /// Part sheet ordering (standard slugs, then custom ids)
    pub part_order: Vec<String>,
    /// Part sheets keyed by slug or custom id
    pub parts: HashMap<String, PartRecord>,

    /// Custom parts in creation order
    pub custom_parts: Vec<CustomPartRecord>,

    /// Crops detected on the raw front upload, keyed by part
    pub source_crops: HashMap<String, DetectedPartRecord>,

    /// Manual references keyed by part, in attachment order
    pub manual_references: HashMap<String, Vec<String>>,

    pub color_palette: Vec<String>,
}

impl ProjectRoot {
    /// Creates an empty project root with the given ID.
    pub fn new(id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            created_at: now,
            last_updated: now,
            ..Default::default()
        }
    }

    /// Builder: Set title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Replaces every sheet field with the store's current state. Identity and
    /// timestamps are kept.
    pub fn apply_store(&mut self, store: &EntityStore) {
        self.single_view_mode = store.single_view_mode();

        self.view_order = ViewKind::ALL.iter().map(|k| k.slug().to_string()).collect();
        self.views = store
            .views()
            .map(|view| (view.kind.slug().to_string(), ViewRecord::from_view(view)))
            .collect();

        let keys = store.part_keys();
        self.part_order = keys.iter().map(|k| k.slug().to_string()).collect();
        self.parts = store
            .parts()
            .map(|sheet| {
                (
                    sheet.key.slug().to_string(),
                    PartRecord {
                        img_url: sheet.img_url.as_ref().map(|i| i.as_str().to_string()),
                        modifications: ModificationRecord::from_ledger(&sheet.modifications),
                    },
                )
            })
            .collect();

        self.custom_parts = store
            .custom_parts()
            .iter()
            .map(|c| CustomPartRecord {
                id: c.id.as_str().to_string(),
                label: c.label.clone(),
            })
            .collect();

        self.source_crops = keys
            .iter()
            .filter_map(|key| {
                store
                    .source_crop(key)
                    .map(|crop| (key.slug().to_string(), DetectedPartRecord::from_detected(crop)))
            })
            .collect();

        self.manual_references = keys
            .iter()
            .filter_map(|key| {
                let refs = store.manual_references(key);
                if refs.is_empty() {
                    return None;
                }
                let uris = refs.iter().map(|r| r.as_str().to_string()).collect();
                Some((key.slug().to_string(), uris))
            })
            .collect();

        self.color_palette = store.color_palette().to_vec();
    }

    /// Rebuilds a store with empty histories. Image payloads are validated.
    pub fn to_store(&self, history_limit: usize) -> SheetResult<EntityStore> {
        let mut store = EntityStore::new(history_limit);
        store.set_single_view_mode(self.single_view_mode);

        for custom in &self.custom_parts {
            store.insert_custom_part(CustomPart {
                id: CustomPartId::from_raw(custom.id.as_str()),
                label: custom.label.clone(),
            });
        }

        let mut max_id = 0;
        for (slug, record) in &self.views {
            let kind = ViewKind::from_slug(slug)
                .ok_or_else(|| SheetError::serialization(format!("unknown view '{}'", slug)))?;
            let modifications = record.ledger()?;
            max_id = max_id.max(modifications.max_id().unwrap_or(0));

            let view = store.view_mut(kind);
            view.original_image = parse_opt(&record.original_image)?;
            view.user_uploaded_image = parse_opt(&record.user_uploaded_image)?;
            view.generated_image = parse_opt(&record.generated_image)?;
            view.parts = record.crops()?;
            view.modifications = modifications;
        }

        for (slug, record) in &self.parts {
            let key = PartKey::from_slug(slug);
            let modifications = record.ledger()?;
            max_id = max_id.max(modifications.max_id().unwrap_or(0));

            let sheet = store.part_mut(&key)?;
            sheet.img_url = parse_opt(&record.img_url)?;
            sheet.modifications = modifications;
        }

        let mut source_crops = BTreeMap::new();
        for (slug, record) in &self.source_crops {
            source_crops.insert(PartKey::from_slug(slug), record.to_detected()?);
        }
        // Only crops of the current upload are saved.
        if let Some(upload) = store.view(ViewKind::Front).user_uploaded_image.clone() {
            store.set_source_crops(upload, source_crops);
        }

        for (slug, uris) in &self.manual_references {
            let key = PartKey::from_slug(slug);
            for uri in uris {
                store.attach_reference(&key, ImageData::from_uri(uri.as_str())?)?;
            }
        }

        store.set_color_palette(self.color_palette.clone());
        store.reserve_modification_ids(max_id);
        Ok(store)
    }
}

fn parse_opt(uri: &Option<String>) -> SheetResult<Option<ImageData>> {
    uri.as_deref().map(ImageData::from_uri).transpose()
}

// =============================================================================
// VIEW
// =============================================================================

/// Persisted view state.
#[derive(Debug, Clone, Default, Reconcile, Hydrate, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewRecord {
    pub original_image: Option<String>,
    pub user_uploaded_image: Option<String>,
    pub generated_image: Option<String>,
    /// Detected crops keyed by part
    pub parts: HashMap<String, DetectedPartRecord>,
    /// Parts looked for but not found
    pub absent_parts: Vec<String>,
    pub modifications: Vec<ModificationRecord>,
}

impl ViewRecord {
    fn from_view(view: &crate::sheet::View) -> Self {
        let mut parts = HashMap::new();
        let mut absent_parts = Vec::new();
        for (key, crop) in &view.parts {
            match crop {
                Some(crop) => {
                    parts.insert(key.slug().to_string(), DetectedPartRecord::from_detected(crop));
                }
                None => absent_parts.push(key.slug().to_string()),
            }
        }
        Self {
            original_image: view.original_image.as_ref().map(|i| i.as_str().to_string()),
            user_uploaded_image: view
                .user_uploaded_image
                .as_ref()
                .map(|i| i.as_str().to_string()),
            generated_image: view.generated_image.as_ref().map(|i| i.as_str().to_string()),
            parts,
            absent_parts,
            modifications: ModificationRecord::from_ledger(&view.modifications),
        }
    }

    fn crops(&self) -> SheetResult<PartCrops> {
        let mut crops = PartCrops::new();
        for (slug, record) in &self.parts {
            crops.insert(PartKey::from_slug(slug), Some(record.to_detected()?));
        }
        for slug in &self.absent_parts {
            crops.insert(PartKey::from_slug(slug), None);
        }
        Ok(crops)
    }

    fn ledger(&self) -> SheetResult<Ledger> {
        ModificationRecord::to_ledger(&self.modifications)
    }
}

/// Persisted crop: `[ymin, xmin, ymax, xmax]` plus the cropped image.
#[derive(Debug, Clone, Default, Reconcile, Hydrate, Serialize, Deserialize, PartialEq)]
pub struct DetectedPartRecord {
    pub bbox: Vec<f64>,
    pub image: String,
}

impl DetectedPartRecord {
    fn from_detected(crop: &DetectedPart) -> Self {
        let b = crop.bbox;
        Self {
            bbox: vec![b.ymin, b.xmin, b.ymax, b.xmax],
            image: crop.image.as_str().to_string(),
        }
    }

    fn to_detected(&self) -> SheetResult<DetectedPart> {
        let values: [f64; 4] = self
            .bbox
            .as_slice()
            .try_into()
            .map_err(|_| SheetError::serialization(format!("bbox needs 4 values, got {}", self.bbox.len())))?;
        Ok(DetectedPart::new(
            BoundingBox::from_array(values),
            ImageData::from_uri(self.image.as_str())?,
        ))
    }
}

// =============================================================================
// PART SHEET
// =============================================================================

/// Persisted part sheet state. `is_loading` is never persisted.
#[derive(Debug, Clone, Default, Reconcile, Hydrate, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PartRecord {
    pub img_url: Option<String>,
    pub modifications: Vec<ModificationRecord>,
}

impl PartRecord {
    fn ledger(&self) -> SheetResult<Ledger> {
        ModificationRecord::to_ledger(&self.modifications)
    }
}

/// User-defined part.
#[derive(Debug, Clone, Default, Reconcile, Hydrate, Serialize, Deserialize, PartialEq)]
pub struct CustomPartRecord {
    pub id: String,
    pub label: String,
}

// =============================================================================
// MODIFICATION
// =============================================================================

/// Persisted ledger entry.
#[derive(Debug, Clone, Default, Reconcile, Hydrate, Serialize, Deserialize, PartialEq)]
pub struct ModificationRecord {
    pub id: i64,
    pub prompt: String,
    pub image: Option<String>,
    /// Milliseconds since epoch
    pub timestamp: i64,
}

impl ModificationRecord {
    fn from_ledger(ledger: &Ledger) -> Vec<Self> {
        ledger
            .entries()
            .iter()
            .map(|m| Self {
                id: m.id as i64,
                prompt: m.prompt.clone(),
                image: m.image.as_ref().map(|i| i.as_str().to_string()),
                timestamp: m.timestamp,
            })
            .collect()
    }

    fn to_ledger(records: &[Self]) -> SheetResult<Ledger> {
        let entries = records
            .iter()
            .map(|r| {
                let id = u64::try_from(r.id)
                    .map_err(|_| SheetError::serialization(format!("negative modification id {}", r.id)))?;
                Ok(Modification::new(id, r.prompt.as_str(), parse_opt(&r.image)?)?.with_timestamp(r.timestamp))
            })
            .collect::<SheetResult<Vec<_>>>()?;
        Ok(Ledger::from_entries(entries))
    }
}

/// Document path of an entity's record.
pub(crate) fn record_path(key: &EntityKey) -> [&str; 2] {
    match key {
        EntityKey::View(kind) => ["views", kind.slug()],
        EntityKey::Part(part) => ["parts", part.slug()],
    }
}

// =============================================================================
// TESTS
// =============================================================================
