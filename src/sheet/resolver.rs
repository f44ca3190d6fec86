//! Reference resolver: decides which images feed a part sheet generation.
//!
//! The reference balance (0..=10) mixes crops from the user's original upload with
//! crops from the AI-normalized views. The collaborator takes images without
//! weights, so intermediate balances add a textual weighting note instead.

use super::model::{PartKey, ViewKind};
use super::store::{EntityStore, MAX_BALANCE};
use crate::image::ImageData;

/// Ordered generation inputs for one part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedSources {
    pub images: Vec<ImageData>,
    /// Weighting note for the style instructions, set when 0 < balance < 10.
    pub annotation: Option<String>,
}

impl ResolvedSources {
    /// An empty list means the part cannot be generated.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Resolves sources using the store's balance, manual references and view mode.
pub fn resolve_sources(part: &PartKey, store: &EntityStore) -> ResolvedSources {
    resolve_sources_with(
        part,
        store,
        store.reference_balance(),
        store.manual_references(part),
        store.single_view_mode(),
    )
}

/// Pure resolution over explicit inputs.
///
/// 1. `balance < 10`: the part's crop from the original upload, or the whole raw
///    front upload when that crop is missing.
/// 2. `balance > 0`: the part's crop from each active view, in view order.
/// 3. Always: every manual reference, in attachment order.
pub fn resolve_sources_with(
    part: &PartKey,
    store: &EntityStore,
    balance: u8,
    manual_refs: &[ImageData],
    single_view_mode: bool,
) -> ResolvedSources {
    let balance = balance.min(MAX_BALANCE);
    let mut images = Vec::new();

    if balance < MAX_BALANCE {
        // The whole-image fallback only exists on this branch; a pure generated
        // request (balance 10) never pulls in the raw upload.
        let original = store
            .source_crop(part)
            .map(|crop| crop.image.clone())
            .or_else(|| store.view(ViewKind::Front).user_uploaded_image.clone());
        images.extend(original);
    }

    if balance > 0 {
        let views: &[ViewKind] = if single_view_mode {
            &[ViewKind::Front]
        } else {
            &ViewKind::ALL
        };
        for kind in views {
            if let Some(crop) = store.view(*kind).crop(part) {
                images.push(crop.image.clone());
            }
        }
    }

    images.extend(manual_refs.iter().cloned());

    ResolvedSources {
        images,
        annotation: weighting_annotation(balance),
    }
}

/// `Original weight = (10-b)/10, Generated weight = b/10` for 0 < b < 10.
pub fn weighting_annotation(balance: u8) -> Option<String> {
    if balance == 0 || balance >= MAX_BALANCE {
        return None;
    }
    let generated = f64::from(balance) / f64::from(MAX_BALANCE);
    Some(format!(
        "Original weight = {:.1}, Generated weight = {:.1}",
        1.0 - generated,
        generated
    ))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::BoundingBox;
    use crate::sheet::model::{DetectedPart, PartCrops, PartKind};
    use std::collections::BTreeMap;

    fn png(tag: &str) -> ImageData {
        ImageData::from_bytes("image/png", tag.as_bytes())
    }

    fn crop(tag: &str) -> DetectedPart {
        DetectedPart::new(BoundingBox::new(100.0, 100.0, 400.0, 400.0), png(tag))
    }

    fn face() -> PartKey {
        PartKey::Standard(PartKind::Face)
    }

    /// Store with an upload, a source crop and a face crop on every view.
    fn populated_store() -> EntityStore {
        let mut store = EntityStore::default();
        store
            .upload_view_image(ViewKind::Front, png("upload"))
            .unwrap();
        store.set_source_crops(png("upload"), BTreeMap::from([(face(), crop("source-face"))]));
        for kind in ViewKind::ALL {
            let crops: PartCrops = BTreeMap::from([(face(), Some(crop(kind.slug())))]);
            store.set_view_parts(kind, crops);
        }
        store
    }

    #[test]
    fn test_balance_zero_only_original() {
        let store = populated_store();
        let sources = resolve_sources_with(&face(), &store, 0, &[], false);
        assert_eq!(sources.images, vec![png("source-face")]);
        assert!(sources.annotation.is_none());
    }

    #[test]
    fn test_balance_ten_only_views() {
        let store = populated_store();
        let sources = resolve_sources_with(&face(), &store, 10, &[], false);
        let expected: Vec<ImageData> = ViewKind::ALL.iter().map(|k| png(k.slug())).collect();
        assert_eq!(sources.images, expected);
        assert!(sources.annotation.is_none());
    }

    #[test]
    fn test_intermediate_balance_mixes_and_annotates() {
        let store = populated_store();
        let sources = resolve_sources_with(&face(), &store, 3, &[png("manual")], false);
        assert_eq!(sources.images.len(), 6);
        assert_eq!(sources.images[0], png("source-face"));
        assert_eq!(sources.images[5], png("manual"));
        assert_eq!(
            sources.annotation.as_deref(),
            Some("Original weight = 0.7, Generated weight = 0.3")
        );
    }

    #[test]
    fn test_single_view_mode_uses_front_only() {
        let store = populated_store();
        let sources = resolve_sources_with(&face(), &store, 10, &[], true);
        assert_eq!(sources.images, vec![png("front")]);
    }

    #[test]
    fn test_missing_crop_falls_back_to_upload_below_ten() {
        let store = populated_store();
        let hair = PartKey::Standard(PartKind::Hair);

        let low = resolve_sources_with(&hair, &store, 4, &[], false);
        assert_eq!(low.images, vec![png("upload")]);

        let high = resolve_sources_with(&hair, &store, 10, &[], false);
        assert!(high.is_empty());
    }

    #[test]
    fn test_manual_refs_always_included() {
        let store = EntityStore::default();
        let refs = [png("r1"), png("r2")];
        for balance in [0, 5, 10] {
            let sources = resolve_sources_with(&face(), &store, balance, &refs, false);
            assert_eq!(sources.images, refs.to_vec());
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let store = populated_store();
        let a = resolve_sources(&face(), &store);
        let b = resolve_sources(&face(), &store);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_store_yields_nothing() {
        let store = EntityStore::default();
        assert!(resolve_sources(&face(), &store).is_empty());
    }
}
