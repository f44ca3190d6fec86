//! Generation orchestrator.
//!
//! Drives the reference-view pipeline, single view/part regeneration, upscaling,
//! part detection and ledger-driven regeneration against an [`ImageCollaborator`].
//!
//! # Concurrency
//!
//! The store sits behind a `parking_lot::Mutex` that is only held for synchronous
//! state transitions, never across a collaborator call. Suspension points are
//! exactly the collaborator calls. Same-entity dispatches are gated by the store's
//! activity registry; different entities proceed independently and commit as
//! they complete.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::batch::{BatchCoordinator, BatchOperation, BatchReport};
use crate::collaborator::{normalize_palette, CompositeRequest, Detections, ImageCollaborator, ViewRequest};
use crate::config::OrchestratorConfig;
use crate::error::{SheetError, SheetResult};
use crate::image::{Cropper, ImageData};
use crate::sheet::{
    resolve_sources, Activity, DetectedPart, EntityKey, EntityStore, Modification, PartCrops,
    PartKey, RequestTicket, ViewKind,
};

// =============================================================================
// PROGRESS
// =============================================================================

/// What the orchestrator is currently doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    CheckingInput,
    DerivingSemiSide,
    NormalizingFront,
    DerivingSideBack,
    ExtractingPalette,
    DetectingParts,
    GeneratingParts,
    Regenerating,
    Upscaling,
}

/// Coarse progress snapshot published on a watch channel.
///
/// The pipeline reports fixed checkpoints (5/35/65/90/100); fan-out operations
/// report `completed / total` as calls resolve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub phase: Phase,
    pub percent: u8,
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn checkpoint(phase: Phase, percent: u8) -> Self {
        Self {
            phase,
            percent,
            completed: 0,
            total: 0,
        }
    }

    pub fn counted(phase: Phase, completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (completed * 100 / total) as u8
        };
        Self {
            phase,
            percent,
            completed,
            total,
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of one per-entity dispatch. Collaborator failures land here, never in `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Result committed to the store.
    Completed,
    /// The collaborator failed, timed out or returned nothing; store unchanged.
    Failed(String),
    /// The entity already had a call in flight; nothing was dispatched.
    Skipped,
    /// A newer request for the same entity was admitted; this result was dropped.
    Superseded,
    /// The resolver found no inputs; the part sheet was cleared without a call.
    NoSources,
}

impl DispatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed)
    }
}

/// Where and why the pipeline stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineAbort {
    pub phase: Phase,
    pub reason: String,
}

/// Summary of a pipeline run. Phases completed before an abort stay committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub completed: Vec<Phase>,
    pub palette: Vec<String>,
    pub aborted: Option<PipelineAbort>,
}

impl PipelineReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }

    fn abort(mut self, phase: Phase, reason: String) -> Self {
        self.aborted = Some(PipelineAbort { phase, reason });
        self
    }
}

/// Summary of a detection pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionReport {
    /// Source crops were refreshed from the raw front upload.
    pub source_detected: bool,
    pub analyzed: Vec<ViewKind>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Accept only from `Idle`; otherwise skip.
    IfIdle,
    /// Accept always; older in-flight results are discarded.
    Supersede,
}

/// A request admitted under the store lock, or the outcome that made it unnecessary.
enum Dispatch {
    View(RequestTicket, ViewRequest),
    Part(RequestTicket, CompositeRequest),
    Settled(DispatchOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectionTarget {
    Source,
    View(ViewKind),
}

/// Clears the pipeline flag even if the run future is dropped.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// Cheaply cloneable handle over one project session.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<Mutex<EntityStore>>,
    collaborator: Arc<dyn ImageCollaborator>,
    cropper: Arc<dyn Cropper>,
    config: Arc<OrchestratorConfig>,
    progress: Arc<watch::Sender<Progress>>,
    pipeline_running: Arc<AtomicBool>,
}

impl Orchestrator {
    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Creates an orchestrator over a fresh store built from `config`.
    pub fn new(
        collaborator: Arc<dyn ImageCollaborator>,
        cropper: Arc<dyn Cropper>,
        config: OrchestratorConfig,
    ) -> SheetResult<Self> {
        let store = config.build_store()?;
        Ok(Self::with_store(store, collaborator, cropper, config))
    }

    /// Creates an orchestrator over an existing store.
    pub fn with_store(
        store: EntityStore,
        collaborator: Arc<dyn ImageCollaborator>,
        cropper: Arc<dyn Cropper>,
        config: OrchestratorConfig,
    ) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            store: Arc::new(Mutex::new(store)),
            collaborator,
            cropper,
            config: Arc::new(config),
            progress: Arc::new(progress),
            pipeline_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // STATE ACCESS
    // =========================================================================

    /// Runs `f` against the store under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&EntityStore) -> R) -> R {
        f(&*self.store.lock())
    }

    /// Applies a synchronous mutation under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut EntityStore) -> R) -> R {
        f(&mut *self.store.lock())
    }

    /// Value copy of the whole store.
    pub fn snapshot(&self) -> EntityStore {
        self.store.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub(crate) fn report_progress(&self, progress: Progress) {
        self.progress.send_replace(progress);
    }

    pub fn is_pipeline_running(&self) -> bool {
        self.pipeline_running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // LOCAL EDITS
    // =========================================================================

    pub fn undo(&self, key: &EntityKey) -> SheetResult<bool> {
        self.update(|store| store.undo(key))
    }

    pub fn redo(&self, key: &EntityKey) -> SheetResult<bool> {
        self.update(|store| store.redo(key))
    }

    pub fn upload_view_image(&self, kind: ViewKind, image: ImageData) -> SheetResult<()> {
        self.update(|store| store.upload_view_image(kind, image))
    }

    pub fn set_reference_balance(&self, balance: i64) -> SheetResult<()> {
        self.update(|store| store.set_reference_balance(balance))
    }

    // =========================================================================
    // COLLABORATOR PLUMBING
    // =========================================================================

    /// Awaits a collaborator call, bounded by the configured timeout.
    async fn call<T, F>(&self, fut: F) -> SheetResult<T>
    where
        F: Future<Output = SheetResult<T>>,
    {
        match self.config.call_timeout() {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(SheetError::Timeout(limit)),
            },
            None => fut.await,
        }
    }

    /// Releases `ticket` and applies `result` if the ticket is still current.
    fn commit<F>(
        &self,
        ticket: RequestTicket,
        result: SheetResult<Option<ImageData>>,
        apply: F,
    ) -> DispatchOutcome
    where
        F: FnOnce(&mut EntityStore, ImageData) -> SheetResult<()>,
    {
        let mut store = self.store.lock();
        if !store.finish(&ticket) {
            debug!(entity = %ticket.key, seq = ticket.seq(), "discarding superseded result");
            return DispatchOutcome::Superseded;
        }
        let image = match result {
            Ok(Some(image)) => image,
            Ok(None) => {
                warn!(entity = %ticket.key, "collaborator returned no image");
                return DispatchOutcome::Failed("collaborator returned no image".to_string());
            }
            Err(e) => {
                warn!(entity = %ticket.key, error = %e, "collaborator call failed");
                return DispatchOutcome::Failed(e.to_string());
            }
        };
        match apply(&mut *store, image) {
            Ok(()) => DispatchOutcome::Completed,
            Err(e) => DispatchOutcome::Failed(e.to_string()),
        }
    }

    // =========================================================================
    // VIEWS
    // =========================================================================

    /// Regenerates one view. A view already in flight is skipped.
    ///
    /// The history snapshot is taken right before dispatch, so even a failed
    /// attempt leaves an undo point.
    pub async fn regenerate_view(&self, kind: ViewKind) -> SheetResult<DispatchOutcome> {
        self.dispatch_view(kind, Admission::IfIdle, true).await
    }

    async fn dispatch_view(
        &self,
        kind: ViewKind,
        admission: Admission,
        snapshot: bool,
    ) -> SheetResult<DispatchOutcome> {
        let dispatch = self.update(|store| self.prepare_view(store, kind, admission, snapshot))?;
        Ok(self.send(dispatch).await)
    }

    /// Admits a view request and builds it from the store as it is under this lock.
    fn prepare_view(
        &self,
        store: &mut EntityStore,
        kind: ViewKind,
        admission: Admission,
        snapshot: bool,
    ) -> SheetResult<Dispatch> {
        let key = EntityKey::View(kind);
        let (source, context) = view_inputs(store, kind)
            .ok_or_else(|| SheetError::missing_input(format!("no source image for {}", kind)))?;
        let ticket = match admission {
            Admission::IfIdle => match store.try_begin(&key, Activity::Regenerating)? {
                Some(ticket) => ticket,
                None => {
                    debug!(view = %kind, "view already in flight, skipping");
                    return Ok(Dispatch::Settled(DispatchOutcome::Skipped));
                }
            },
            Admission::Supersede => store.supersede(&key, Activity::Regenerating)?,
        };
        if snapshot {
            store.snapshot_before_change(&key)?;
        }
        let request = ViewRequest {
            source,
            target: kind,
            pose: self.config.pose,
            modifications: store.view(kind).modifications.entries().to_vec(),
            context,
        };
        Ok(Dispatch::View(ticket, request))
    }

    /// Issues a prepared request and commits its result.
    async fn send(&self, dispatch: Dispatch) -> DispatchOutcome {
        match dispatch {
            Dispatch::Settled(outcome) => outcome,
            Dispatch::View(ticket, request) => {
                let kind = request.target;
                info!(view = %kind, seq = ticket.seq(), "generating view");
                let result = self.call(self.collaborator.generate_view(request)).await;
                self.commit(ticket, result, |store, image| {
                    store.commit_view_image(kind, image);
                    Ok(())
                })
            }
            Dispatch::Part(ticket, request) => {
                let part = request.part.clone();
                info!(part = %part, images = request.images.len(), seq = ticket.seq(), "generating part sheet");
                let result = self
                    .call(self.collaborator.generate_composite_sheet(request))
                    .await;
                self.commit(ticket, result, move |store, image| {
                    store.set_part_image(&part, Some(image))
                })
            }
        }
    }

    /// Upscales a view's working image in place.
    pub async fn upscale_view(&self, kind: ViewKind) -> SheetResult<DispatchOutcome> {
        self.upscale_entity(EntityKey::View(kind)).await
    }

    /// Generates a front image from a text prompt and installs it as the upload.
    pub async fn seed_front_from_prompt(&self, prompt: &str) -> SheetResult<DispatchOutcome> {
        if prompt.trim().is_empty() {
            return Err(SheetError::missing_input("empty prompt"));
        }
        let key = EntityKey::View(ViewKind::Front);
        let ticket = self.update(|store| -> SheetResult<Option<RequestTicket>> {
            let ticket = store.try_begin(&key, Activity::Regenerating)?;
            if ticket.is_some() {
                store.snapshot_before_change(&key)?;
            }
            Ok(ticket)
        })?;
        let Some(ticket) = ticket else {
            return Ok(DispatchOutcome::Skipped);
        };

        info!("seeding front view from prompt");
        let result = self
            .call(self.collaborator.generate_from_prompt(prompt.to_string()))
            .await;
        Ok(self.commit(ticket, result, |store, image| {
            store.set_view_upload(ViewKind::Front, image);
            Ok(())
        }))
    }

    // =========================================================================
    // PART SHEETS
    // =========================================================================

    /// Generates one part sheet. Skipped while the part is loading; cleared without
    /// a collaborator call when no sources resolve.
    pub async fn generate_part(&self, part: &PartKey) -> SheetResult<DispatchOutcome> {
        self.dispatch_part(part, Admission::IfIdle, true).await
    }

    async fn dispatch_part(
        &self,
        part: &PartKey,
        admission: Admission,
        snapshot: bool,
    ) -> SheetResult<DispatchOutcome> {
        let dispatch = self.update(|store| self.prepare_part(store, part, admission, snapshot))?;
        Ok(self.send(dispatch).await)
    }

    fn prepare_part(
        &self,
        store: &mut EntityStore,
        part: &PartKey,
        admission: Admission,
        snapshot: bool,
    ) -> SheetResult<Dispatch> {
        let key = EntityKey::Part(part.clone());
        let label = store.part_label(part)?;
        if admission == Admission::IfIdle && !store.is_idle(&key) {
            debug!(part = %part, "part already in flight, skipping");
            return Ok(Dispatch::Settled(DispatchOutcome::Skipped));
        }

        let sources = resolve_sources(part, store);
        if sources.is_empty() {
            if admission == Admission::Supersede {
                // Drop whatever is still in flight for this part.
                let stale = store.supersede(&key, Activity::Regenerating)?;
                store.finish(&stale);
            }
            if snapshot {
                store.snapshot_before_change(&key)?;
            }
            store.set_part_image(part, None)?;
            debug!(part = %part, "no sources, part cleared");
            return Ok(Dispatch::Settled(DispatchOutcome::NoSources));
        }

        let ticket = match admission {
            Admission::IfIdle => match store.try_begin(&key, Activity::Regenerating)? {
                Some(ticket) => ticket,
                None => return Ok(Dispatch::Settled(DispatchOutcome::Skipped)),
            },
            Admission::Supersede => store.supersede(&key, Activity::Regenerating)?,
        };
        if snapshot {
            store.snapshot_before_change(&key)?;
        }
        let request = CompositeRequest {
            images: sources.images,
            part: part.clone(),
            label,
            modifications: store.modifications(&key)?.entries().to_vec(),
            style_prompt: combine_style(self.config.style_prompt.clone(), sources.annotation),
        };
        Ok(Dispatch::Part(ticket, request))
    }

    /// Upscales a part sheet in place.
    pub async fn upscale_part(&self, part: &PartKey) -> SheetResult<DispatchOutcome> {
        self.upscale_entity(EntityKey::Part(part.clone())).await
    }

    /// Generates every standard and custom part sheet in parallel.
    pub async fn generate_all_parts(&self) -> BatchReport {
        let keys: Vec<EntityKey> = self
            .read(|store| store.part_keys())
            .into_iter()
            .map(EntityKey::Part)
            .collect();
        BatchCoordinator::new(self.clone())
            .run(keys, BatchOperation::Regenerate, Phase::GeneratingParts)
            .await
    }

    async fn upscale_entity(&self, key: EntityKey) -> SheetResult<DispatchOutcome> {
        let prepared = self.update(|store| -> SheetResult<Option<(RequestTicket, ImageData)>> {
            let source = match &key {
                EntityKey::View(kind) => store.view(*kind).original_image.clone(),
                EntityKey::Part(part) => store
                    .part(part)
                    .ok_or_else(|| SheetError::entity_not_found(part.to_string()))?
                    .img_url
                    .clone(),
            }
            .ok_or_else(|| SheetError::missing_input(format!("nothing to upscale for {}", key)))?;
            let Some(ticket) = store.try_begin(&key, Activity::Upscaling)? else {
                return Ok(None);
            };
            store.snapshot_before_change(&key)?;
            Ok(Some((ticket, source)))
        })?;

        let Some((ticket, source)) = prepared else {
            debug!(entity = %key, "entity busy, skipping upscale");
            return Ok(DispatchOutcome::Skipped);
        };

        info!(entity = %key, "upscaling");
        let result = self.call(self.collaborator.upscale_image(source)).await;
        Ok(self.commit(ticket, result, |store, image| match &key {
            EntityKey::View(kind) => {
                store.commit_view_image(*kind, image);
                Ok(())
            }
            EntityKey::Part(part) => store.set_part_image(part, Some(image)),
        }))
    }

    // =========================================================================
    // MODIFICATION LEDGER
    // =========================================================================

    /// Appends a modification and immediately regenerates with the updated ledger.
    ///
    /// The regeneration supersedes any request already in flight for the entity.
    pub async fn add_modification(
        &self,
        key: &EntityKey,
        prompt: impl Into<String>,
        image: Option<ImageData>,
    ) -> SheetResult<(Modification, DispatchOutcome)> {
        let prompt = prompt.into();
        let (modification, dispatch) = self.update(|store| -> SheetResult<(Modification, Dispatch)> {
            ensure_regenerable(store, key)?;
            let modification = store.append_modification(key, prompt, image)?;
            Ok((modification, self.prepare_superseding(store, key)?))
        })?;
        info!(entity = %key, id = modification.id, "modification added");
        Ok((modification, self.send(dispatch).await))
    }

    /// Removes a modification and immediately regenerates with the updated ledger.
    pub async fn remove_modification(&self, key: &EntityKey, id: u64) -> SheetResult<DispatchOutcome> {
        let dispatch = self.update(|store| -> SheetResult<Dispatch> {
            ensure_regenerable(store, key)?;
            store.remove_modification(key, id)?;
            self.prepare_superseding(store, key)
        })?;
        info!(entity = %key, id, "modification removed");
        Ok(self.send(dispatch).await)
    }

    /// Builds the follow-up request of a ledger edit under the same lock as the
    /// edit, so the entity is never idle between the two.
    fn prepare_superseding(&self, store: &mut EntityStore, key: &EntityKey) -> SheetResult<Dispatch> {
        // The ledger edit already recorded the undo point.
        match key {
            EntityKey::View(kind) => self.prepare_view(store, *kind, Admission::Supersede, false),
            EntityKey::Part(part) => self.prepare_part(store, part, Admission::Supersede, false),
        }
    }

    // =========================================================================
    // REFERENCE-VIEW PIPELINE
    // =========================================================================

    /// Runs the reference-view pipeline:
    /// `CheckingInput → [DerivingSemiSide] → NormalizingFront → [DerivingSideBack] → ExtractingPalette`.
    ///
    /// Missing input is an `Err` raised before any call. A collaborator failure
    /// aborts the remaining phases and is reported in [`PipelineReport::aborted`];
    /// results of phases that already finished stay committed.
    pub async fn run_pipeline(&self) -> SheetResult<PipelineReport> {
        if self.pipeline_running.swap(true, Ordering::SeqCst) {
            return Err(SheetError::PipelineBusy);
        }
        let _guard = RunningGuard(self.pipeline_running.clone());

        let result = self.run_pipeline_phases().await;
        let percent = match &result {
            Ok(report) if report.is_complete() => 100,
            _ => self.progress().percent,
        };
        self.report_progress(Progress::checkpoint(Phase::Idle, percent));
        result
    }

    async fn run_pipeline_phases(&self) -> SheetResult<PipelineReport> {
        let mut report = PipelineReport::default();

        self.enter_phase(Phase::CheckingInput, 5);
        let single_view = self.read(|store| -> SheetResult<bool> {
            if view_inputs(store, ViewKind::Front).is_none() {
                return Err(SheetError::missing_input("front view has no image"));
            }
            Ok(store.single_view_mode())
        })?;
        report.completed.push(Phase::CheckingInput);

        if !single_view {
            self.enter_phase(Phase::DerivingSemiSide, 5);
            if let Err(reason) = self.pipeline_view(ViewKind::SemiSide).await {
                return Ok(report.abort(Phase::DerivingSemiSide, reason));
            }
            report.completed.push(Phase::DerivingSemiSide);
        }

        self.enter_phase(Phase::NormalizingFront, 35);
        if let Err(reason) = self.pipeline_view(ViewKind::Front).await {
            return Ok(report.abort(Phase::NormalizingFront, reason));
        }
        report.completed.push(Phase::NormalizingFront);

        if !single_view {
            self.enter_phase(Phase::DerivingSideBack, 65);
            // Side and back only depend on the normalized front.
            let (side, back) = futures::join!(
                self.pipeline_view(ViewKind::Side),
                self.pipeline_view(ViewKind::Back)
            );
            let failures: Vec<String> = [side, back].into_iter().filter_map(Result::err).collect();
            if !failures.is_empty() {
                return Ok(report.abort(Phase::DerivingSideBack, failures.join("; ")));
            }
            report.completed.push(Phase::DerivingSideBack);
        }

        self.enter_phase(Phase::ExtractingPalette, 90);
        report.palette = self.refresh_palette().await;
        report.completed.push(Phase::ExtractingPalette);

        info!(phases = report.completed.len(), "pipeline complete");
        Ok(report)
    }

    fn enter_phase(&self, phase: Phase, percent: u8) {
        info!(?phase, percent, "pipeline phase");
        self.report_progress(Progress::checkpoint(phase, percent));
    }

    async fn pipeline_view(&self, kind: ViewKind) -> Result<(), String> {
        match self.dispatch_view(kind, Admission::IfIdle, true).await {
            Ok(DispatchOutcome::Completed) => Ok(()),
            Ok(DispatchOutcome::Failed(reason)) => Err(format!("{}: {}", kind, reason)),
            Ok(DispatchOutcome::Skipped) => Err(format!("{}: view is busy", kind)),
            Ok(DispatchOutcome::Superseded) => Err(format!("{}: superseded by a newer request", kind)),
            Ok(DispatchOutcome::NoSources) => Err(format!("{}: no sources", kind)),
            Err(e) => Err(format!("{}: {}", kind, e)),
        }
    }

    /// Best-effort palette extraction from the normalized front; never fatal.
    async fn refresh_palette(&self) -> Vec<String> {
        let Some(front) = self.read(|store| store.view(ViewKind::Front).original_image.clone()) else {
            return Vec::new();
        };
        match self.call(self.collaborator.extract_palette(front)).await {
            Ok(colors) => {
                let palette = normalize_palette(colors);
                self.update(|store| store.set_color_palette(palette.clone()));
                palette
            }
            Err(e) => {
                warn!(error = %e, "palette extraction failed");
                self.read(|store| store.color_palette().to_vec())
            }
        }
    }

    // =========================================================================
    // PART DETECTION
    // =========================================================================

    /// Analyzes the raw front upload (source crops) and each active view's working
    /// image (view crops) in parallel, then crops every detected part.
    pub async fn detect_parts(&self) -> SheetResult<DetectionReport> {
        let (labels, names, targets) = self.read(|store| {
            let labels: Vec<String> = store.custom_parts().iter().map(|c| c.label.clone()).collect();
            let names: Vec<(PartKey, String)> = store
                .part_keys()
                .into_iter()
                .map(|key| {
                    let name = match &key {
                        PartKey::Standard(kind) => kind.slug().to_string(),
                        PartKey::Custom(_) => store.part_label(&key).unwrap_or_default(),
                    };
                    (key, name)
                })
                .collect();
            let mut targets: Vec<(DetectionTarget, ImageData)> = Vec::new();
            if let Some(upload) = store.view(ViewKind::Front).user_uploaded_image.clone() {
                targets.push((DetectionTarget::Source, upload));
            }
            for kind in store.active_views() {
                if let Some(image) = store.view(kind).original_image.clone() {
                    targets.push((DetectionTarget::View(kind), image));
                }
            }
            (labels, names, targets)
        });
        if targets.is_empty() {
            return Err(SheetError::missing_input("no image to analyze"));
        }

        let total = targets.len();
        self.report_progress(Progress::counted(Phase::DetectingParts, 0, total));

        let mut pending: FuturesUnordered<_> = targets
            .into_iter()
            .map(|(target, image)| {
                let labels = labels.clone();
                async move {
                    let result = self
                        .call(self.collaborator.analyze_image(image.clone(), labels))
                        .await;
                    (target, image, result)
                }
            })
            .collect();

        let mut report = DetectionReport::default();
        let mut completed = 0;
        while let Some((target, image, result)) = pending.next().await {
            completed += 1;
            self.report_progress(Progress::counted(Phase::DetectingParts, completed, total));

            let detections = match result {
                Ok(Some(detections)) => detections,
                Ok(None) => {
                    warn!(?target, "analysis returned nothing");
                    report.failed.push(format!("{:?}: no detections", target));
                    continue;
                }
                Err(e) => {
                    warn!(?target, error = %e, "analysis failed");
                    report.failed.push(format!("{:?}: {}", target, e));
                    continue;
                }
            };
            let crops = self.crop_detections(&image, &detections, &names);

            match target {
                DetectionTarget::Source => {
                    let found = crops
                        .into_iter()
                        .filter_map(|(key, crop)| crop.map(|c| (key, c)))
                        .collect();
                    self.update(|store| store.set_source_crops(image, found));
                    report.source_detected = true;
                }
                DetectionTarget::View(kind) => {
                    let key = EntityKey::View(kind);
                    let committed = self.update(|store| -> SheetResult<bool> {
                        // A view that started regenerating meanwhile would get
                        // crops of a stale image.
                        if !store.is_idle(&key) {
                            return Ok(false);
                        }
                        if store.view(kind).parts != crops {
                            store.snapshot_before_change(&key)?;
                            store.set_view_parts(kind, crops);
                        }
                        Ok(true)
                    })?;
                    if committed {
                        report.analyzed.push(kind);
                    } else {
                        warn!(view = %kind, "view busy, dropping detections");
                        report.failed.push(format!("{}: view busy", kind));
                    }
                }
            }
        }

        report.analyzed.sort();
        info!(
            analyzed = report.analyzed.len(),
            failed = report.failed.len(),
            "part detection finished"
        );
        Ok(report)
    }

    fn crop_detections(
        &self,
        image: &ImageData,
        detections: &Detections,
        names: &[(PartKey, String)],
    ) -> PartCrops {
        let mut crops = PartCrops::new();
        for (key, name) in names {
            let bbox = detections.get(name).copied().or_else(|| {
                detections
                    .iter()
                    .find(|(label, _)| label.eq_ignore_ascii_case(name))
                    .map(|(_, bbox)| *bbox)
            });
            let crop = match bbox {
                Some(bbox) if !bbox.is_empty() => {
                    let region = bbox.padded(self.config.padding_ratio);
                    match self.cropper.crop(image, &region) {
                        Ok(cropped) => Some(DetectedPart::new(bbox, cropped)),
                        Err(e) => {
                            warn!(part = %key, error = %e, "crop failed");
                            None
                        }
                    }
                }
                _ => None,
            };
            crops.insert(key.clone(), crop);
        }
        crops
    }
}

/// Source and optional context image for generating `kind`.
///
/// - FRONT: its own upload (or working image), with the 3/4 view as context.
/// - SEMI_SIDE: its own upload, else the raw front.
/// - SIDE/BACK: their own upload, else the normalized front, with the 3/4 view as context.
pub(crate) fn view_inputs(store: &EntityStore, kind: ViewKind) -> Option<(ImageData, Option<ImageData>)> {
    let front = store.view(ViewKind::Front);
    let semi = store.view(ViewKind::SemiSide);
    let own = store.view(kind);
    let semi_context = if store.single_view_mode() {
        None
    } else {
        semi.original_image.clone()
    };
    match kind {
        ViewKind::Front => {
            let source = own.user_uploaded_image.clone().or_else(|| own.original_image.clone())?;
            Some((source, semi_context))
        }
        ViewKind::SemiSide => {
            let source = own
                .user_uploaded_image
                .clone()
                .or_else(|| front.user_uploaded_image.clone())
                .or_else(|| front.original_image.clone())?;
            Some((source, None))
        }
        ViewKind::Side | ViewKind::Back => {
            let source = own
                .user_uploaded_image
                .clone()
                .or_else(|| front.original_image.clone())?;
            Some((source, semi_context))
        }
    }
}

/// Input check run before a ledger edit touches the store.
fn ensure_regenerable(store: &EntityStore, key: &EntityKey) -> SheetResult<()> {
    match key {
        EntityKey::View(kind) => view_inputs(store, *kind)
            .map(|_| ())
            .ok_or_else(|| SheetError::missing_input(format!("no source image for {}", kind))),
        EntityKey::Part(part) => store.part_label(part).map(|_| ()),
    }
}

fn combine_style(style: Option<String>, annotation: Option<String>) -> Option<String> {
    match (style, annotation) {
        (Some(style), Some(note)) => Some(format!("{}\n{}", style, note)),
        (style, note) => style.or(note),
    }
}

// =============================================================================
// TESTS
// =============================================================================
