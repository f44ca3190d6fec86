//! Pipeline walkthrough for the character sheet engine.
//!
//! Drives a full session against an in-process echo collaborator: reference views,
//! part detection, part sheets, a ledger edit, undo and a document round trip.
//!
//! Run with: cargo run --example pipeline_walkthrough

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use charsheet::collaborator::Detections;
use charsheet::{
    BoundingBox, CompositeRequest, CropRegion, Cropper, EntityKey, ImageCollaborator, ImageData,
    Orchestrator, OrchestratorConfig, PartKind, ProjectDocumentManager, SheetResult, ViewKind,
    ViewRequest,
};

/// Answers every request with a small labelled payload.
struct EchoCollaborator;

#[async_trait]
impl ImageCollaborator for EchoCollaborator {
    async fn analyze_image(&self, _image: ImageData, custom_labels: Vec<String>) -> SheetResult<Option<Detections>> {
        let mut boxes = Detections::new();
        for (i, kind) in PartKind::ALL.into_iter().enumerate() {
            let top = 120.0 * i as f64;
            boxes.insert(kind.slug().to_string(), BoundingBox::new(top, 200.0, top + 120.0, 800.0));
        }
        for label in custom_labels {
            boxes.insert(label, BoundingBox::new(50.0, 50.0, 950.0, 950.0));
        }
        Ok(Some(boxes))
    }

    async fn generate_view(&self, request: ViewRequest) -> SheetResult<Option<ImageData>> {
        let text = format!("{} ({} edits)", request.target.label(), request.modifications.len());
        Ok(Some(ImageData::from_bytes("image/png", text.as_bytes())))
    }

    async fn generate_composite_sheet(&self, request: CompositeRequest) -> SheetResult<Option<ImageData>> {
        let text = format!("{} sheet from {} refs", request.label, request.images.len());
        Ok(Some(ImageData::from_bytes("image/png", text.as_bytes())))
    }

    async fn extract_palette(&self, _image: ImageData) -> SheetResult<Vec<String>> {
        Ok(["#2B2D42", "#8D99AE", "#EDF2F4", "#EF233C", "#D90429", "#F4A261"]
            .iter()
            .map(|c| c.to_string())
            .collect())
    }

    async fn upscale_image(&self, image: ImageData) -> SheetResult<Option<ImageData>> {
        Ok(Some(image))
    }

    async fn generate_from_prompt(&self, prompt: String) -> SheetResult<Option<ImageData>> {
        Ok(Some(ImageData::from_bytes("image/png", prompt.as_bytes())))
    }
}

struct IdentityCropper;

impl Cropper for IdentityCropper {
    fn crop(&self, image: &ImageData, _region: &CropRegion) -> SheetResult<ImageData> {
        Ok(image.clone())
    }
}

#[tokio::main]
async fn main() -> SheetResult<()> {
    println!("========================================");
    println!(" Charsheet Pipeline Walkthrough");
    println!("========================================\n");

    let config = OrchestratorConfig::new().with_style_prompt("clean line art, flat colors");
    let orch = Orchestrator::new(Arc::new(EchoCollaborator), Arc::new(IdentityCropper), config)?;

    let start = Instant::now();
    orch.seed_front_from_prompt("wandering knight, green cloak").await?;
    let report = orch.run_pipeline().await?;
    println!("Pipeline: {:?} phases, palette {:?}", report.completed.len(), report.palette);

    let detection = orch.detect_parts().await?;
    println!("Detection: views analyzed {:?}", detection.analyzed);

    let batch = orch.generate_all_parts().await;
    println!(
        "Part sheets: {} succeeded, {} failed ({:.2?})",
        batch.succeeded.len(),
        batch.failed.len(),
        start.elapsed()
    );

    let cloak = EntityKey::from(PartKind::Upper);
    let (modification, outcome) = orch.add_modification(&cloak, "make the cloak tattered", None).await?;
    println!("Modification #{} -> {:?}", modification.id, outcome);
    orch.undo(&cloak)?;
    println!(
        "After undo: {} modifications on {}",
        orch.read(|s| s.modifications(&cloak).map(|l| l.len()).unwrap_or(0)),
        cloak
    );

    let mut document = ProjectDocumentManager::new("walkthrough")?;
    document.set_title("Wandering Knight")?;
    document.store_snapshot(&orch.snapshot())?;
    let bytes = document.save();
    let restored = ProjectDocumentManager::from_bytes(&bytes)?.load_store(10)?;
    println!(
        "Document: {} bytes, front restored: {}",
        bytes.len(),
        restored.view(ViewKind::Front).original_image.is_some()
    );

    Ok(())
}
