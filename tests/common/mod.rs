//! Shared test fixtures: a scripted collaborator and a deterministic cropper.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use charsheet::collaborator::Detections;
use charsheet::{
    BoundingBox, CompositeRequest, CropRegion, Cropper, ImageCollaborator, ImageData, Orchestrator,
    OrchestratorConfig, PartKind, SheetError, SheetResult, ViewKind, ViewRequest,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

pub const PALETTE: [&str; 6] = ["#1A1A2E", "#16213E", "#0F3460", "#E94560", "#F5F5F5", "#C0A080"];

pub fn png(tag: &str) -> ImageData {
    ImageData::from_bytes("image/png", tag.as_bytes())
}

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Analyze { custom_labels: Vec<String> },
    View { target: ViewKind, has_context: bool, modifications: Vec<String> },
    Composite { label: String, images: usize, style: Option<String>, modifications: Vec<String> },
    Palette,
    Upscale,
    Prompt(String),
}

/// Collaborator double that records calls, fails selected targets and can hold
/// calls open until released.
pub struct ScriptedCollaborator {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<String>>,
    empty: Mutex<HashSet<String>>,
    held: AtomicBool,
    gate: Semaphore,
}

impl ScriptedCollaborator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            empty: Mutex::new(HashSet::new()),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    /// Fails calls for a view slug, a part label, `"palette"`, `"upscale"` or `"analyze"`.
    pub fn fail_on(&self, target: &str) {
        self.failing.lock().insert(target.to_string());
    }

    /// Answers calls for `target` with no image.
    pub fn return_nothing_for(&self, target: &str) {
        self.empty.lock().insert(target.to_string());
    }

    /// Parks every subsequent call until [`Self::release`].
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Lets `n` parked calls continue and stops holding new ones.
    pub fn release(&self, n: usize) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.add_permits(n);
    }

    /// Yields until at least `n` calls have been recorded in total.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls.lock().len() < n {
            tokio::task::yield_now().await;
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn composite_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Composite { .. }))
            .collect()
    }

    pub fn view_calls(&self) -> Vec<ViewKind> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::View { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    async fn enter(&self, call: Call, target: &str) -> SheetResult<bool> {
        self.calls.lock().push(call);
        if self.held.load(Ordering::SeqCst) {
            self.gate
                .acquire()
                .await
                .map_err(|e| SheetError::collaborator(e.to_string()))?
                .forget();
        }
        if self.failing.lock().contains(target) {
            return Err(SheetError::collaborator(format!("scripted failure for {}", target)));
        }
        Ok(!self.empty.lock().contains(target))
    }
}

#[async_trait]
impl ImageCollaborator for ScriptedCollaborator {
    async fn analyze_image(
        &self,
        _image: ImageData,
        custom_labels: Vec<String>,
    ) -> SheetResult<Option<Detections>> {
        let call = Call::Analyze {
            custom_labels: custom_labels.clone(),
        };
        if !self.enter(call, "analyze").await? {
            return Ok(None);
        }
        let mut detections = Detections::new();
        for (i, kind) in PartKind::ALL.into_iter().enumerate() {
            let bbox = if kind == PartKind::Accessories {
                BoundingBox::default()
            } else {
                let top = 100.0 * i as f64;
                BoundingBox::new(top, 100.0, top + 100.0, 900.0)
            };
            detections.insert(kind.slug().to_string(), bbox);
        }
        for label in custom_labels {
            detections.insert(label, BoundingBox::new(0.0, 0.0, 500.0, 500.0));
        }
        Ok(Some(detections))
    }

    async fn generate_view(&self, request: ViewRequest) -> SheetResult<Option<ImageData>> {
        let call = Call::View {
            target: request.target,
            has_context: request.context.is_some(),
            modifications: request.modifications.iter().map(|m| m.prompt.clone()).collect(),
        };
        if !self.enter(call, request.target.slug()).await? {
            return Ok(None);
        }
        let round = request.modifications.len();
        Ok(Some(png(&format!("view:{}:{}", request.target.slug(), round))))
    }

    async fn generate_composite_sheet(
        &self,
        request: CompositeRequest,
    ) -> SheetResult<Option<ImageData>> {
        let call = Call::Composite {
            label: request.label.clone(),
            images: request.images.len(),
            style: request.style_prompt.clone(),
            modifications: request.modifications.iter().map(|m| m.prompt.clone()).collect(),
        };
        if !self.enter(call, &request.label).await? {
            return Ok(None);
        }
        let round = request.modifications.len();
        Ok(Some(png(&format!("sheet:{}:{}", request.part, round))))
    }

    async fn extract_palette(&self, _image: ImageData) -> SheetResult<Vec<String>> {
        self.enter(Call::Palette, "palette").await?;
        Ok(PALETTE.iter().map(|c| c.to_lowercase()).collect())
    }

    async fn upscale_image(&self, image: ImageData) -> SheetResult<Option<ImageData>> {
        if !self.enter(Call::Upscale, "upscale").await? {
            return Ok(None);
        }
        let bytes = image.decode()?;
        Ok(Some(ImageData::from_bytes(
            "image/png",
            &[b"hd:".as_slice(), bytes.as_slice()].concat(),
        )))
    }

    async fn generate_from_prompt(&self, prompt: String) -> SheetResult<Option<ImageData>> {
        if !self.enter(Call::Prompt(prompt.clone()), "prompt").await? {
            return Ok(None);
        }
        Ok(Some(png(&format!("seed:{}", prompt))))
    }
}

/// Encodes the region into the output so crops of different boxes differ.
pub struct TaggingCropper;

impl Cropper for TaggingCropper {
    fn crop(&self, image: &ImageData, region: &CropRegion) -> SheetResult<ImageData> {
        let source = image.decode()?;
        Ok(png(&format!(
            "crop:{}:{:.3}:{:.3}:{:.3}:{:.3}",
            String::from_utf8_lossy(&source),
            region.top,
            region.left,
            region.bottom,
            region.right
        )))
    }
}

pub fn orchestrator(collaborator: &Arc<ScriptedCollaborator>, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(collaborator.clone(), Arc::new(TaggingCropper), config)
        .expect("valid test config")
}

/// Orchestrator with a front upload, a finished pipeline and detected parts.
pub async fn prepared_orchestrator(collaborator: &Arc<ScriptedCollaborator>) -> Orchestrator {
    let orch = orchestrator(collaborator, OrchestratorConfig::new());
    orch.upload_view_image(ViewKind::Front, png("hero-front"))
        .expect("upload");
    let report = orch.run_pipeline().await.expect("pipeline input");
    assert!(report.is_complete(), "pipeline aborted: {:?}", report.aborted);
    orch.detect_parts().await.expect("detection input");
    orch
}
