// Processing coordinator: owns the run lifecycle and the canonical status.
//
// A run is a driver task that feeds sampler segments on the blocking pool
// and a detection worker that classifies sampled frames off an mpsc channel.
// Every state change is published as a snapshot on a watch channel.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::batch::BatchRunner;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::detection::{Classified, DetectionClassifier};
use crate::pipeline::sampler::{FrameSampler, SamplerCursor, SamplerOutcome};
use crate::pipeline::types::{
    DetectedFrame, ProcessingStatus, RunState, StatusSnapshot,
};
use crate::run_context::VideoMetadata;
use crate::video::VideoSource;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;

/// Releases classified frames strictly in frame-number order.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    next_frame_number: u64,
    pending: BTreeMap<u64, DetectedFrame>,
}

impl ReorderBuffer {
    /// Buffers `frame` and returns every frame that is now contiguous with
    /// what was already released. Stale or duplicate numbers are dropped.
    pub fn push(&mut self, frame: DetectedFrame) -> Vec<DetectedFrame> {
        if frame.frame_number < self.next_frame_number {
            tracing::warn!("Dropping stale frame {}", frame.frame_number);
            return Vec::new();
        }
        self.pending.insert(frame.frame_number, frame);

        let mut ready = Vec::new();
        while let Some(frame) = self.pending.remove(&self.next_frame_number) {
            ready.push(frame);
            self.next_frame_number += 1;
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

struct Inner {
    /// Bumped by every start and clear; work tagged with an older value is ignored.
    generation: u64,
    state: RunState,
    status: ProcessingStatus,
    metadata: Option<VideoMetadata>,
    detections: Vec<Arc<DetectedFrame>>,
    reorder: ReorderBuffer,
    /// Only the coordinator cancels; the sampler only reads it.
    cancel: CancellationToken,
}

impl Inner {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            status: self.status.clone(),
            metadata: self.metadata.clone(),
            detections: self.detections.clone(),
        }
    }

    fn accepts(&self, generation: u64) -> bool {
        self.generation == generation && self.state.is_active()
    }
}

struct Shared {
    inner: Mutex<Inner>,
    status_tx: watch::Sender<StatusSnapshot>,
    resumed: Notify,
    sampler: FrameSampler,
    runner: BatchRunner,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        self.status_tx.send_replace(inner.snapshot());
    }

    /// Counts a freshly sampled frame. Returns false once the run is no
    /// longer accepting work, in which case the frame must not be classified.
    fn record_sampled(&self, generation: u64, frame: &DetectedFrame) -> bool {
        let mut inner = self.lock();
        if !inner.accepts(generation) {
            return false;
        }
        inner.status.processed_frames += 1;
        tracing::debug!(
            "Sampled frame {} at {:.3}s",
            frame.frame_number,
            frame.timestamp
        );
        self.publish(&inner);
        true
    }

    fn accepts(&self, generation: u64) -> bool {
        self.lock().accepts(generation)
    }

    fn record_progress(&self, generation: u64, percent: f64, current_time: f64) {
        let mut inner = self.lock();
        if !inner.accepts(generation) {
            return;
        }
        let status = &mut inner.status;
        if percent <= status.progress && current_time <= status.current_timestamp {
            return;
        }
        status.progress = status.progress.max(percent.clamp(0.0, 100.0));
        status.current_timestamp = status.current_timestamp.max(current_time);
        self.publish(&inner);
    }

    fn commit(&self, generation: u64, classified: Classified) {
        let mut inner = self.lock();
        if !inner.accepts(generation) {
            tracing::debug!(
                "Ignoring result for frame {} from an inactive run",
                classified.frame.frame_number
            );
            return;
        }

        if let Some(err) = classified.error {
            inner
                .status
                .errors
                .push(format!("Frame {}: {}", classified.frame.frame_number, err));
        }

        for frame in inner.reorder.push(classified.frame) {
            if frame.human_detected {
                tracing::info!(
                    "Human detected in frame {} at {:.2}s (confidence {:.2})",
                    frame.frame_number,
                    frame.timestamp,
                    frame.confidence
                );
                inner.detections.push(Arc::new(frame));
            }
        }
        inner.status.detected_frames = inner.detections.len() as u64;
        self.publish(&inner);
    }

    fn complete(&self, generation: u64) {
        let mut inner = self.lock();
        if !inner.accepts(generation) {
            return;
        }
        if inner.reorder.pending() > 0 {
            tracing::warn!(
                "{} classified frame(s) never became contiguous",
                inner.reorder.pending()
            );
        }
        inner.state = RunState::Completed;
        inner.status.is_processing = false;
        inner.status.progress = 100.0;
        tracing::info!(
            "Run completed: {} frames sampled, {} detections, {} errors",
            inner.status.processed_frames,
            inner.status.detected_frames,
            inner.status.errors.len()
        );
        self.publish(&inner);
    }

    fn fail(&self, generation: u64, err: PipelineError) {
        let mut inner = self.lock();
        if !inner.accepts(generation) {
            return;
        }
        tracing::error!("Run failed: {}", err);
        inner.cancel.cancel();
        inner.state = RunState::Failed;
        inner.status.is_processing = false;
        inner.status.errors.push(err.to_string());
        self.publish(&inner);
    }

    /// Parks a paused driver. Returns the fresh token once the run is resumed,
    /// or `None` if it was cancelled, cleared or superseded meanwhile.
    async fn wait_for_resume(&self, generation: u64) -> Option<CancellationToken> {
        loop {
            let notified = self.resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.lock();
                if inner.generation != generation {
                    return None;
                }
                match inner.state {
                    RunState::Running => return Some(inner.cancel.clone()),
                    RunState::Paused => {}
                    _ => return None,
                }
            }

            notified.await;
        }
    }
}

/// Orchestrates sampling and classification for one video at a time.
#[derive(Clone)]
pub struct ProcessingCoordinator {
    shared: Arc<Shared>,
}

impl ProcessingCoordinator {
    pub fn new(config: &PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        let sampler = FrameSampler::new(config.sample_rate)?;
        let classifier = config.build_classifier()?;
        Self::with_classifier(sampler, classifier, config.batch_size)
    }

    /// Without a batch size, classification is serialized one frame at a time.
    pub fn with_classifier(
        sampler: FrameSampler,
        classifier: DetectionClassifier,
        batch_size: Option<usize>,
    ) -> PipelineResult<Self> {
        let runner = BatchRunner::new(classifier, batch_size.unwrap_or(1))?;
        let (status_tx, _) = watch::channel(StatusSnapshot::default());

        let inner = Inner {
            generation: 0,
            state: RunState::Idle,
            status: ProcessingStatus::default(),
            metadata: None,
            detections: Vec::new(),
            reorder: ReorderBuffer::default(),
            cancel: CancellationToken::new(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                status_tx,
                resumed: Notify::new(),
                sampler,
                runner,
            }),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.shared.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.shared.lock().snapshot()
    }

    /// Begins a run over `video`. Rejected while another run is active.
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        video: Box<dyn VideoSource>,
        metadata: VideoMetadata,
    ) -> PipelineResult<()> {
        let (generation, cancel) = {
            let mut inner = self.shared.lock();
            if inner.state.is_active() {
                return Err(PipelineError::InvalidState(format!(
                    "a run is already {:?}",
                    inner.state
                )));
            }

            inner.generation += 1;
            inner.state = RunState::Running;
            inner.status = ProcessingStatus::for_run(&metadata);
            inner.metadata = Some(metadata);
            inner.detections.clear();
            inner.reorder = ReorderBuffer::default();
            inner.cancel = CancellationToken::new();
            self.shared.publish(&inner);

            tracing::info!(
                "Starting run {} ({} frames estimated, classifier={}, batch={})",
                inner.generation,
                inner.status.total_frames,
                self.shared.runner.classifier().name(),
                self.shared.runner.batch_size()
            );
            (inner.generation, inner.cancel.clone())
        };

        tokio::spawn(drive(self.shared.clone(), generation, video, cancel));
        Ok(())
    }

    /// Stops capture and playback without discarding anything.
    pub fn pause(&self) -> PipelineResult<()> {
        let mut inner = self.shared.lock();
        if inner.state != RunState::Running {
            return Err(PipelineError::InvalidState(format!(
                "cannot pause while {:?}",
                inner.state
            )));
        }
        inner.state = RunState::Paused;
        inner.cancel.cancel();
        tracing::info!("Run paused at {:.2}s", inner.status.current_timestamp);
        self.shared.publish(&inner);
        Ok(())
    }

    /// Continues sampling from the current playback position.
    pub fn resume(&self) -> PipelineResult<()> {
        let mut inner = self.shared.lock();
        if inner.state != RunState::Paused {
            return Err(PipelineError::InvalidState(format!(
                "cannot resume while {:?}",
                inner.state
            )));
        }
        inner.state = RunState::Running;
        inner.cancel = CancellationToken::new();
        tracing::info!("Run resumed at {:.2}s", inner.status.current_timestamp);
        self.shared.publish(&inner);
        drop(inner);

        self.shared.resumed.notify_waiters();
        Ok(())
    }

    /// Ends the active run, keeping partial results.
    pub fn cancel(&self) -> PipelineResult<()> {
        let mut inner = self.shared.lock();
        if !inner.state.is_active() {
            return Err(PipelineError::InvalidState(format!(
                "no active run to cancel ({:?})",
                inner.state
            )));
        }
        inner.cancel.cancel();
        inner.state = RunState::Cancelled;
        inner.status.is_processing = false;
        tracing::info!(
            "Run cancelled after {} frames",
            inner.status.processed_frames
        );
        self.shared.publish(&inner);
        drop(inner);

        self.shared.resumed.notify_waiters();
        Ok(())
    }

    /// Discards everything and returns to `Idle`, cancelling any active run.
    pub fn clear(&self) {
        let mut inner = self.shared.lock();
        inner.cancel.cancel();
        inner.generation += 1;
        inner.state = RunState::Idle;
        inner.status = ProcessingStatus::default();
        inner.metadata = None;
        inner.detections.clear();
        inner.reorder = ReorderBuffer::default();
        self.shared.publish(&inner);
        drop(inner);

        self.shared.resumed.notify_waiters();
    }
}

/// Runs sampler segments until the video ends, fails or the run is stopped.
async fn drive(
    shared: Arc<Shared>,
    generation: u64,
    mut video: Box<dyn VideoSource>,
    mut cancel: CancellationToken,
) {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(detection_worker(
        shared.clone(),
        generation,
        shared.runner.clone(),
        frame_rx,
    ));
    let mut cursor = SamplerCursor::default();

    loop {
        let segment = run_segment(
            shared.clone(),
            generation,
            video,
            cursor,
            cancel.clone(),
            frame_tx.clone(),
        )
        .await;

        let outcome = match segment {
            Ok((returned, outcome)) => {
                video = returned;
                outcome
            }
            Err(e) => {
                shared.fail(generation, e);
                return;
            }
        };

        match outcome {
            Ok(SamplerOutcome::Finished(_)) => {
                // Let queued classifications land before declaring completion
                drop(frame_tx);
                if let Err(e) = worker.await {
                    tracing::error!("Detection worker failed: {}", e);
                }
                shared.complete(generation);
                return;
            }
            Ok(SamplerOutcome::Stopped(stopped_at)) => {
                cursor = stopped_at;
                match shared.wait_for_resume(generation).await {
                    Some(token) => cancel = token,
                    None => {
                        tracing::debug!("Driver for run {} exiting", generation);
                        return;
                    }
                }
            }
            Err(e) => {
                shared.fail(generation, e);
                return;
            }
        }
    }
}

type SegmentResult = (Box<dyn VideoSource>, PipelineResult<SamplerOutcome>);

/// One uninterrupted stretch of sampling on the blocking pool. The video is
/// moved in and handed back so no two segments can drive it at once.
async fn run_segment(
    shared: Arc<Shared>,
    generation: u64,
    mut video: Box<dyn VideoSource>,
    cursor: SamplerCursor,
    cancel: CancellationToken,
    frame_tx: mpsc::UnboundedSender<DetectedFrame>,
) -> PipelineResult<SegmentResult> {
    let handle = tokio::task::spawn_blocking(move || {
        let sampler = shared.sampler;
        let outcome = sampler.extract(
            video.as_mut(),
            cursor,
            &mut |frame| {
                if !shared.record_sampled(generation, &frame) {
                    return;
                }
                if frame_tx.send(frame).is_err() {
                    tracing::warn!("Detection worker is gone, frame dropped");
                }
            },
            &mut |percent, current_time| shared.record_progress(generation, percent, current_time),
            &cancel,
        );
        (video, outcome)
    });

    handle
        .await
        .map_err(|e| PipelineError::MediaDecode(format!("sampler task failed: {}", e)))
}

async fn detection_worker(
    shared: Arc<Shared>,
    generation: u64,
    runner: BatchRunner,
    mut frame_rx: mpsc::UnboundedReceiver<DetectedFrame>,
) {
    while let Some(first) = frame_rx.recv().await {
        // Frames queued behind a cancelled, cleared or failed run are never classified
        if !shared.accepts(generation) {
            tracing::debug!("Detection worker for run {} stopping", generation);
            break;
        }
        let mut group = vec![first];
        while group.len() < runner.batch_size() {
            match frame_rx.try_recv() {
                Ok(frame) => group.push(frame),
                Err(_) => break,
            }
        }

        for classified in runner.classify_all(group).await {
            shared.commit(generation, classified);
        }
    }
}
