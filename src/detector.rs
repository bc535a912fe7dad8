//! Detector lifecycle management.
//!
//! Detector models load asynchronously and may take seconds; the pipeline
//! keeps exactly one slot per detector kind and reconciles each slot's
//! actual state against the currently requested entity count every tick.
//! While a creation is in flight the slot produces no results, and a count
//! change during loading is resolved by the close-after-resolve rule: the
//! resolved detector is closed immediately if it is no longer wanted.

use std::fmt;

use crate::detection::{FaceResult, HandResult, PoseResult};
use crate::error::DetectorError;
use crate::pending::{Pending, PendingPoll};

/// The detector families the pipeline can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorKind {
    Face,
    Hand,
    Pose,
    Segmentation,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectorKind::Face => "face",
            DetectorKind::Hand => "hand",
            DetectorKind::Pose => "pose",
            DetectorKind::Segmentation => "segmentation",
        };
        f.write_str(name)
    }
}

/// Inference backend preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delegate {
    Gpu,
    Cpu,
}

/// Creation/reconfiguration parameters for one detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorOptions {
    /// Maximum number of entities the detector tracks simultaneously.
    pub max_tracked: u32,
    pub delegate: Delegate,
    pub model_url: String,
    /// Whether the detector should output 4x4 pose matrices (faces only).
    pub output_transforms: bool,
    /// Whether the detector should output blendshape categories (faces only).
    pub output_categories: bool,
}

impl DetectorOptions {
    /// Default options for a detector kind, pointing at the hosted models.
    pub fn for_kind(kind: DetectorKind, max_tracked: u32) -> Self {
        let (model_url, output_transforms, output_categories) = match kind {
            DetectorKind::Face => (
                "https://storage.googleapis.com/mediapipe-models/face_landmarker/face_landmarker/float16/1/face_landmarker.task",
                true,
                true,
            ),
            DetectorKind::Hand => (
                "https://storage.googleapis.com/mediapipe-models/hand_landmarker/hand_landmarker/float16/1/hand_landmarker.task",
                false,
                false,
            ),
            DetectorKind::Pose => (
                "https://storage.googleapis.com/mediapipe-models/pose_landmarker/pose_landmarker_full/float16/1/pose_landmarker_full.task",
                false,
                false,
            ),
            DetectorKind::Segmentation => (
                "https://storage.googleapis.com/mediapipe-models/image_segmenter/selfie_segmenter/float16/latest/selfie_segmenter.tflite",
                false,
                false,
            ),
        };
        Self {
            max_tracked,
            delegate: Delegate::Gpu,
            model_url: model_url.to_owned(),
            output_transforms,
            output_categories,
        }
    }
}

/// One frame's worth of output from a detector.
#[derive(Debug, Clone)]
pub enum Detection {
    Face(FaceResult),
    Hand(HandResult),
    Pose(PoseResult),
    /// Segmentation masks stay on the host side; the pipeline only drives
    /// the detector's lifecycle.
    Segmentation,
}

/// A live detector instance provided by the host.
pub trait Detector {
    /// Run inference for the frame at `timestamp_ms` (video time,
    /// milliseconds, strictly increasing). `Ok(None)` means the detector
    /// produced no output for this frame (tracking lost entirely).
    fn detect(&mut self, timestamp_ms: f64) -> Result<Option<Detection>, DetectorError>;

    /// Reconfigure the live detector in place (e.g. a new entity count).
    fn set_options(&mut self, options: &DetectorOptions) -> Result<(), DetectorError>;

    /// Release the model and its GPU resources. Must be idempotent.
    fn close(&mut self);
}

/// Host factory for detector instances. Creation resolves asynchronously;
/// a `None` resolution means the model could not be created.
///
/// The pipeline may abandon a creation before it resolves (teardown during
/// model load), dropping its receiver. The host's `send` then fails and
/// hands the detector back; the host must close it.
pub trait DetectorFactory {
    fn create(
        &mut self,
        kind: DetectorKind,
        options: &DetectorOptions,
    ) -> Pending<Option<Box<dyn Detector>>>;
}

enum SlotState {
    Absent,
    Loading(Pending<Option<Box<dyn Detector>>>),
    Ready(Box<dyn Detector>),
}

impl fmt::Debug for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Absent => "Absent",
            SlotState::Loading(_) => "Loading",
            SlotState::Ready(_) => "Ready",
        };
        f.write_str(name)
    }
}

/// Lifecycle state for one detector kind.
///
/// `requested` is the desired entity count (0 means the detector should not
/// exist), `applied` is the count the live detector was last configured
/// with. At most one creation is in flight at a time; requests arriving
/// while loading are absorbed into `requested` and the latest value wins
/// once the creation resolves.
pub struct DetectorSlot {
    kind: DetectorKind,
    state: SlotState,
    requested: u32,
    applied: u32,
    /// Count at which the last creation failed. The slot stays absent until
    /// the requested count changes away from this value.
    failed_at: Option<u32>,
}

impl fmt::Debug for DetectorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorSlot")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("requested", &self.requested)
            .field("applied", &self.applied)
            .field("failed_at", &self.failed_at)
            .finish()
    }
}

impl DetectorSlot {
    pub fn new(kind: DetectorKind) -> Self {
        Self {
            kind,
            state: SlotState::Absent,
            requested: 0,
            applied: 0,
            failed_at: None,
        }
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    /// Desired entity count for this detector. Changing the count clears
    /// failure memory so the next reconcile may retry creation.
    pub fn set_requested(&mut self, count: u32) {
        if count != self.requested {
            self.requested = count;
            if self.failed_at != Some(count) {
                self.failed_at = None;
            }
        }
    }

    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, SlotState::Loading(_))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, SlotState::Ready(_))
    }

    /// Access the live detector for inference, if any.
    pub fn detector_mut(&mut self) -> Option<&mut dyn Detector> {
        match &mut self.state {
            SlotState::Ready(detector) => Some(detector.as_mut()),
            _ => None,
        }
    }

    /// Drive the slot toward the requested count. Called once per tick.
    pub fn reconcile(&mut self, factory: &mut dyn DetectorFactory) {
        match &mut self.state {
            SlotState::Loading(pending) => match pending.poll() {
                PendingPoll::InFlight => {}
                PendingPoll::Resolved(Some(mut detector)) => {
                    if self.requested == 0 {
                        // Wanted count dropped to zero while the model was
                        // loading. Close it now that we finally hold it.
                        tracing::debug!(kind = %self.kind, "closing detector resolved after cancel");
                        detector.close();
                        self.state = SlotState::Absent;
                        self.applied = 0;
                    } else {
                        tracing::info!(kind = %self.kind, count = self.requested, "detector ready");
                        self.applied = self.requested;
                        self.state = SlotState::Ready(detector);
                    }
                }
                PendingPoll::Resolved(None) | PendingPoll::Dropped => {
                    tracing::warn!(kind = %self.kind, count = self.requested, "detector creation failed");
                    self.failed_at = Some(self.requested);
                    self.state = SlotState::Absent;
                    self.applied = 0;
                }
            },
            SlotState::Absent => {
                if self.requested > 0 && self.failed_at != Some(self.requested) {
                    let options = DetectorOptions::for_kind(self.kind, self.requested);
                    tracing::info!(kind = %self.kind, count = self.requested, "creating detector");
                    self.state = SlotState::Loading(factory.create(self.kind, &options));
                }
            }
            SlotState::Ready(detector) => {
                if self.requested == 0 {
                    tracing::info!(kind = %self.kind, "closing detector");
                    detector.close();
                    self.state = SlotState::Absent;
                    self.applied = 0;
                } else if self.requested != self.applied {
                    let options = DetectorOptions::for_kind(self.kind, self.requested);
                    match detector.set_options(&options) {
                        Ok(()) => {
                            tracing::info!(kind = %self.kind, count = self.requested, "detector reconfigured");
                            self.applied = self.requested;
                        }
                        Err(err) => {
                            // Rebuild from scratch next tick.
                            tracing::warn!(kind = %self.kind, error = %err, "reconfigure failed, recreating");
                            detector.close();
                            self.state = SlotState::Absent;
                            self.applied = 0;
                        }
                    }
                }
            }
        }
    }

    /// Immediately close and forget the detector, whatever its state.
    /// A creation still in flight is abandoned by dropping its receiver;
    /// a model resolving afterwards bounces back to the host, which closes
    /// it (see [`DetectorFactory`]).
    pub fn close(&mut self) {
        if let SlotState::Ready(detector) = &mut self.state {
            detector.close();
        }
        self.state = SlotState::Absent;
        self.requested = 0;
        self.applied = 0;
        self.failed_at = None;
    }
}

/// The full set of detector slots, one per kind.
#[derive(Debug)]
pub struct DetectorSet {
    pub face: DetectorSlot,
    pub hand: DetectorSlot,
    pub pose: DetectorSlot,
    pub segmentation: DetectorSlot,
}

impl DetectorSet {
    pub fn new() -> Self {
        Self {
            face: DetectorSlot::new(DetectorKind::Face),
            hand: DetectorSlot::new(DetectorKind::Hand),
            pose: DetectorSlot::new(DetectorKind::Pose),
            segmentation: DetectorSlot::new(DetectorKind::Segmentation),
        }
    }

    pub fn reconcile_all(&mut self, factory: &mut dyn DetectorFactory) {
        self.face.reconcile(factory);
        self.hand.reconcile(factory);
        self.pose.reconcile(factory);
        self.segmentation.reconcile(factory);
    }

    pub fn close_all(&mut self) {
        self.face.close();
        self.hand.close();
        self.pose.close();
        self.segmentation.close();
    }
}

impl Default for DetectorSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Steps the tracked-face budget down when the frame rate stays low.
///
/// A downscale fires when the smoothed fps has been below the threshold
/// continuously for the cooldown period. Downscaling is monotone within a
/// session (the governor never raises the count back) with a floor of one
/// face; recovery above the threshold only resets the observation window.
#[derive(Debug)]
pub struct PerformanceGovernor {
    fps_threshold: f32,
    cooldown_secs: f64,
    below_since: Option<f64>,
}

impl PerformanceGovernor {
    pub fn new(fps_threshold: f32, cooldown_secs: f64) -> Self {
        Self {
            fps_threshold,
            cooldown_secs,
            below_since: None,
        }
    }

    /// Feed one tick's smoothed fps. Returns the reduced face count when a
    /// downscale should be applied.
    pub fn update(&mut self, smoothed_fps: f32, now: f64, current_count: u32) -> Option<u32> {
        if current_count <= 1 || smoothed_fps >= self.fps_threshold {
            self.below_since = None;
            return None;
        }
        match self.below_since {
            None => {
                self.below_since = Some(now);
                None
            }
            Some(since) if now - since > self.cooldown_secs => {
                // Restart the window so the next step waits a full cooldown.
                self.below_since = Some(now);
                Some(current_count - 1)
            }
            Some(_) => None,
        }
    }
}
