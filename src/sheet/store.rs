//! Entity store: the owned, injectable state container for one project session.
//!
//! All views and part sheets live here. Every mutation replaces fields with values
//! derived from the previous ones; images are copied by value, never shared.
//!
//! The store also keeps the per-entity activity registry. A dispatch is admitted
//! with a [`RequestTicket`]; a later dispatch for the same entity bumps its
//! request counter so the earlier ticket can no longer commit.

use std::collections::{BTreeMap, HashMap};

use super::history::{Versioned, DEFAULT_HISTORY_LIMIT};
use super::ledger::{Ledger, Modification};
use super::model::*;
use crate::error::{SheetError, SheetResult};
use crate::image::ImageData;

/// Highest accepted reference balance.
pub const MAX_BALANCE: u8 = 10;

/// Admission token for one in-flight collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTicket {
    pub key: EntityKey,
    pub activity: Activity,
    seq: u64,
}

impl RequestTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Canonical state of a character sheet project.
#[derive(Debug, Clone)]
pub struct EntityStore {
    views: BTreeMap<ViewKind, View>,
    parts: BTreeMap<PartKey, PartSheet>,
    /// Creation order of custom parts.
    custom_parts: Vec<CustomPart>,
    /// Crops detected on the raw front upload (pre-normalization), keyed to the
    /// upload they were taken from.
    source_crops: BTreeMap<PartKey, DetectedPart>,
    source_origin: Option<ImageData>,
    manual_references: BTreeMap<PartKey, Vec<ImageData>>,
    reference_balance: u8,
    single_view_mode: bool,
    color_palette: Vec<String>,
    history_limit: usize,
    next_modification_id: u64,
    activity: HashMap<EntityKey, Activity>,
    request_seq: HashMap<EntityKey, u64>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl EntityStore {
    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Creates a store with all four views and every standard part sheet.
    pub fn new(history_limit: usize) -> Self {
        let views = ViewKind::ALL
            .into_iter()
            .map(|kind| (kind, View::new(kind, history_limit)))
            .collect();
        let parts = PartKind::ALL
            .into_iter()
            .map(|kind| {
                let key = PartKey::Standard(kind);
                (key.clone(), PartSheet::new(key, history_limit))
            })
            .collect();
        Self {
            views,
            parts,
            custom_parts: Vec::new(),
            source_crops: BTreeMap::new(),
            source_origin: None,
            manual_references: BTreeMap::new(),
            reference_balance: 5,
            single_view_mode: false,
            color_palette: Vec::new(),
            history_limit,
            next_modification_id: 1,
            activity: HashMap::new(),
            request_seq: HashMap::new(),
        }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    // =========================================================================
    // VIEWS
    // =========================================================================

    pub fn view(&self, kind: ViewKind) -> &View {
        // Every ViewKind is inserted by the constructor and never removed.
        &self.views[&kind]
    }

    pub(crate) fn view_mut(&mut self, kind: ViewKind) -> &mut View {
        self.views
            .entry(kind)
            .or_insert_with(|| View::new(kind, DEFAULT_HISTORY_LIMIT))
    }

    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    /// Views taking part in generation: only FRONT in single-view mode.
    pub fn active_views(&self) -> Vec<ViewKind> {
        if self.single_view_mode {
            vec![ViewKind::Front]
        } else {
            ViewKind::ALL.to_vec()
        }
    }

    /// Installs a raw upload as the view's working image.
    pub fn upload_view_image(&mut self, kind: ViewKind, image: ImageData) -> SheetResult<()> {
        self.ensure_idle(&EntityKey::View(kind))?;
        self.view_mut(kind).snapshot_before_change();
        self.set_view_upload(kind, image);
        Ok(())
    }

    pub(crate) fn set_view_upload(&mut self, kind: ViewKind, image: ImageData) {
        let view = self.view_mut(kind);
        view.user_uploaded_image = Some(image.clone());
        view.original_image = Some(image);
    }

    /// Drops the upload and every derived image of a view.
    pub fn clear_view(&mut self, kind: ViewKind) -> SheetResult<()> {
        self.ensure_idle(&EntityKey::View(kind))?;
        let view = self.view_mut(kind);
        view.snapshot_before_change();
        view.user_uploaded_image = None;
        view.original_image = None;
        view.generated_image = None;
        view.parts.clear();
        Ok(())
    }

    /// Writes a generation result; `user_uploaded_image` is left alone.
    pub(crate) fn commit_view_image(&mut self, kind: ViewKind, image: ImageData) {
        let view = self.view_mut(kind);
        view.original_image = Some(image.clone());
        view.generated_image = Some(image);
    }

    pub(crate) fn set_view_parts(&mut self, kind: ViewKind, parts: PartCrops) {
        self.view_mut(kind).parts = parts;
    }

    // =========================================================================
    // PART SHEETS
    // =========================================================================

    pub fn part(&self, key: &PartKey) -> Option<&PartSheet> {
        self.parts.get(key)
    }

    pub(crate) fn part_mut(&mut self, key: &PartKey) -> SheetResult<&mut PartSheet> {
        self.parts
            .get_mut(key)
            .ok_or_else(|| SheetError::entity_not_found(key.to_string()))
    }

    /// Standard parts first, then custom parts in creation order.
    pub fn part_keys(&self) -> Vec<PartKey> {
        PartKind::ALL
            .into_iter()
            .map(PartKey::Standard)
            .chain(self.custom_parts.iter().map(CustomPart::key))
            .collect()
    }

    pub fn parts(&self) -> impl Iterator<Item = &PartSheet> {
        self.parts.values()
    }

    /// Display label handed to the collaborator.
    pub fn part_label(&self, key: &PartKey) -> SheetResult<String> {
        match key {
            PartKey::Standard(kind) => Ok(kind.label().to_string()),
            PartKey::Custom(id) => self
                .custom_parts
                .iter()
                .find(|c| &c.id == id)
                .map(|c| c.label.clone())
                .ok_or_else(|| SheetError::entity_not_found(id.to_string())),
        }
    }

    pub(crate) fn set_part_image(&mut self, key: &PartKey, image: Option<ImageData>) -> SheetResult<()> {
        self.part_mut(key)?.img_url = image;
        Ok(())
    }

    // =========================================================================
    // CUSTOM PARTS
    // =========================================================================

    pub fn custom_parts(&self) -> &[CustomPart] {
        &self.custom_parts
    }

    /// Creates a custom part and its empty sheet.
    pub fn add_custom_part(&mut self, label: impl Into<String>) -> CustomPart {
        let part = CustomPart::new(label);
        self.insert_custom_part(part.clone());
        part
    }

    pub(crate) fn insert_custom_part(&mut self, part: CustomPart) {
        let key = part.key();
        if !self.parts.contains_key(&key) {
            self.parts
                .insert(key.clone(), PartSheet::new(key, self.history_limit));
        }
        if !self.custom_parts.iter().any(|c| c.id == part.id) {
            self.custom_parts.push(part);
        }
    }

    pub fn rename_custom_part(&mut self, id: &CustomPartId, label: impl Into<String>) -> SheetResult<()> {
        let part = self
            .custom_parts
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| SheetError::entity_not_found(id.to_string()))?;
        part.label = label.into();
        Ok(())
    }

    /// Removes a custom part with its sheet, history, manual references and crops.
    /// Any in-flight request for it is invalidated.
    pub fn remove_custom_part(&mut self, id: &CustomPartId) -> SheetResult<CustomPart> {
        let index = self
            .custom_parts
            .iter()
            .position(|c| &c.id == id)
            .ok_or_else(|| SheetError::entity_not_found(id.to_string()))?;
        let part = self.custom_parts.remove(index);
        let key = part.key();
        self.parts.remove(&key);
        self.manual_references.remove(&key);
        self.source_crops.remove(&key);
        for view in self.views.values_mut() {
            view.parts.remove(&key);
        }
        let entity = EntityKey::Part(key);
        self.activity.remove(&entity);
        *self.request_seq.entry(entity).or_insert(0) += 1;
        Ok(part)
    }

    // =========================================================================
    // REFERENCES
    // =========================================================================

    pub fn reference_balance(&self) -> u8 {
        self.reference_balance
    }

    pub fn set_reference_balance(&mut self, balance: i64) -> SheetResult<()> {
        if !(0..=i64::from(MAX_BALANCE)).contains(&balance) {
            return Err(SheetError::InvalidBalance(balance));
        }
        self.reference_balance = balance as u8;
        Ok(())
    }

    pub fn single_view_mode(&self) -> bool {
        self.single_view_mode
    }

    pub fn set_single_view_mode(&mut self, enabled: bool) {
        self.single_view_mode = enabled;
    }

    /// Crop of a part taken from the raw front upload. Crops of any other
    /// upload (replaced, cleared or undone) are hidden until it is current again.
    pub fn source_crop(&self, key: &PartKey) -> Option<&DetectedPart> {
        let front = self.view(ViewKind::Front).user_uploaded_image.as_ref();
        if front.is_none() || self.source_origin.as_ref() != front {
            return None;
        }
        self.source_crops.get(key)
    }

    pub(crate) fn set_source_crops(
        &mut self,
        origin: ImageData,
        crops: BTreeMap<PartKey, DetectedPart>,
    ) {
        self.source_origin = Some(origin);
        self.source_crops = crops;
    }

    pub fn manual_references(&self, key: &PartKey) -> &[ImageData] {
        self.manual_references
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Attaches a reference image to a part, after any existing ones.
    pub fn attach_reference(&mut self, key: &PartKey, image: ImageData) -> SheetResult<()> {
        if !self.parts.contains_key(key) {
            return Err(SheetError::entity_not_found(key.to_string()));
        }
        self.manual_references
            .entry(key.clone())
            .or_default()
            .push(image);
        Ok(())
    }

    pub fn detach_reference(&mut self, key: &PartKey, index: usize) -> SheetResult<ImageData> {
        let refs = self
            .manual_references
            .get_mut(key)
            .filter(|refs| index < refs.len())
            .ok_or_else(|| SheetError::entity_not_found(format!("{}#{}", key, index)))?;
        let image = refs.remove(index);
        if refs.is_empty() {
            self.manual_references.remove(key);
        }
        Ok(image)
    }

    // =========================================================================
    // PALETTE
    // =========================================================================

    pub fn color_palette(&self) -> &[String] {
        &self.color_palette
    }

    pub fn set_color_palette(&mut self, palette: Vec<String>) {
        self.color_palette = palette;
    }

    // =========================================================================
    // MODIFICATION LEDGER
    // =========================================================================

    pub fn modifications(&self, key: &EntityKey) -> SheetResult<&Ledger> {
        match key {
            EntityKey::View(kind) => Ok(&self.view(*kind).modifications),
            EntityKey::Part(part) => self
                .parts
                .get(part)
                .map(|p| &p.modifications)
                .ok_or_else(|| SheetError::entity_not_found(part.to_string())),
        }
    }

    fn ledger_mut(&mut self, key: &EntityKey) -> SheetResult<&mut Ledger> {
        match key {
            EntityKey::View(kind) => Ok(&mut self.view_mut(*kind).modifications),
            EntityKey::Part(part) => Ok(&mut self.part_mut(part)?.modifications),
        }
    }

    /// Appends a modification after snapshotting the entity.
    pub fn append_modification(
        &mut self,
        key: &EntityKey,
        prompt: impl Into<String>,
        image: Option<ImageData>,
    ) -> SheetResult<Modification> {
        let modification = Modification::new(self.next_modification_id, prompt, image)?;
        self.snapshot_before_change(key)?;
        self.next_modification_id += 1;
        self.ledger_mut(key)?.append(modification.clone());
        Ok(modification)
    }

    /// Removes a modification after snapshotting the entity.
    pub fn remove_modification(&mut self, key: &EntityKey, id: u64) -> SheetResult<Modification> {
        if self.modifications(key)?.get(id).is_none() {
            return Err(SheetError::ModificationNotFound(id));
        }
        self.snapshot_before_change(key)?;
        self.ledger_mut(key)?.remove(id)
    }

    /// Keeps id allocation ahead of ids restored from a document.
    pub(crate) fn reserve_modification_ids(&mut self, max_seen: u64) {
        self.next_modification_id = self.next_modification_id.max(max_seen + 1);
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    /// Pushes the entity's current visible state onto its undo stack.
    pub fn snapshot_before_change(&mut self, key: &EntityKey) -> SheetResult<()> {
        match key {
            EntityKey::View(kind) => self.view_mut(*kind).snapshot_before_change(),
            EntityKey::Part(part) => self.part_mut(part)?.snapshot_before_change(),
        }
        Ok(())
    }

    /// Undoes the last change of an idle entity.
    pub fn undo(&mut self, key: &EntityKey) -> SheetResult<bool> {
        self.ensure_idle(key)?;
        match key {
            EntityKey::View(kind) => Ok(self.view_mut(*kind).undo()),
            EntityKey::Part(part) => Ok(self.part_mut(part)?.undo()),
        }
    }

    /// Redoes the last undone change of an idle entity.
    pub fn redo(&mut self, key: &EntityKey) -> SheetResult<bool> {
        self.ensure_idle(key)?;
        match key {
            EntityKey::View(kind) => Ok(self.view_mut(*kind).redo()),
            EntityKey::Part(part) => Ok(self.part_mut(part)?.redo()),
        }
    }

    // =========================================================================
    // ACTIVITY REGISTRY
    // =========================================================================

    pub fn activity(&self, key: &EntityKey) -> Activity {
        self.activity.get(key).copied().unwrap_or_default()
    }

    pub fn is_idle(&self, key: &EntityKey) -> bool {
        self.activity(key) == Activity::Idle
    }

    /// Entities with an outstanding call of the given kind.
    pub fn in_flight(&self, activity: Activity) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .activity
            .iter()
            .filter(|(_, a)| **a == activity)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn ensure_idle(&self, key: &EntityKey) -> SheetResult<()> {
        if self.is_idle(key) {
            Ok(())
        } else {
            Err(SheetError::entity_busy(key.to_string()))
        }
    }

    fn ensure_exists(&self, key: &EntityKey) -> SheetResult<()> {
        match key {
            EntityKey::View(_) => Ok(()),
            EntityKey::Part(part) if self.parts.contains_key(part) => Ok(()),
            EntityKey::Part(part) => Err(SheetError::entity_not_found(part.to_string())),
        }
    }

    /// Admits a dispatch only from `Idle`. Returns `None` when the entity is busy.
    pub fn try_begin(&mut self, key: &EntityKey, activity: Activity) -> SheetResult<Option<RequestTicket>> {
        self.ensure_exists(key)?;
        if !self.is_idle(key) {
            return Ok(None);
        }
        Ok(Some(self.begin(key, activity)))
    }

    /// Admits a dispatch unconditionally, invalidating any in-flight ticket.
    pub fn supersede(&mut self, key: &EntityKey, activity: Activity) -> SheetResult<RequestTicket> {
        self.ensure_exists(key)?;
        Ok(self.begin(key, activity))
    }

    fn begin(&mut self, key: &EntityKey, activity: Activity) -> RequestTicket {
        let seq = self.request_seq.entry(key.clone()).or_insert(0);
        *seq += 1;
        let seq = *seq;
        self.activity.insert(key.clone(), activity);
        self.set_loading_flag(key, true);
        RequestTicket {
            key: key.clone(),
            activity,
            seq,
        }
    }

    /// True while no later dispatch for the same entity has been admitted.
    pub fn is_current(&self, ticket: &RequestTicket) -> bool {
        self.request_seq.get(&ticket.key).copied() == Some(ticket.seq)
    }

    /// Releases a ticket. Returns whether it was still current; only a current
    /// ticket returns the entity to `Idle` and may commit its result.
    pub fn finish(&mut self, ticket: &RequestTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.activity.remove(&ticket.key);
        self.set_loading_flag(&ticket.key, false);
        true
    }

    fn set_loading_flag(&mut self, key: &EntityKey, loading: bool) {
        if let EntityKey::Part(part) = key {
            if let Some(sheet) = self.parts.get_mut(part) {
                sheet.is_loading = loading;
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
