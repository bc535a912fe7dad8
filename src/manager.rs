//! The tracking orchestrator.
//!
//! `TrackingManager` owns the whole per-frame pipeline: it acquires the
//! camera, keeps detector slots reconciled against the configured entity
//! counts, runs inference, smooths and mirrors results, maintains the pool
//! of per-face and per-hand scene instances, and manages filter selection.
//!
//! The manager is driven cooperatively by the host in two phases per frame:
//! [`TrackingManager::update`] (detection and state reconciliation) followed
//! by [`TrackingManager::prepare_render`] (writing transforms into the
//! scene). Neither phase ever blocks; everything asynchronous is polled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use glam::Vec3;

use crate::assets::{AssetLoader, AssetReference};
use crate::behaviours::{FilterBehaviour, HandBehaviour};
use crate::config::FilterConfig;
use crate::detection::{FaceResult, HandResult, MirrorMap, PoseResult, ResultSmoother};
use crate::detector::{Detection, DetectorFactory, DetectorSet, PerformanceGovernor};
use crate::error::CameraError;
use crate::instance::{
    FaceInstance, FaceRenderSettings, HandInstance, InstanceBinding, OccluderSpec,
};
use crate::pending::{Pending, PendingPoll};
use crate::scene::{NodeId, SceneGraph};

/// Exponential smoothing factor for the fps estimate.
const FPS_SMOOTHING: f32 = 0.1;
/// Base delay before the first camera retry, in seconds.
const CAMERA_RETRY_BASE_SECS: f64 = 0.2;
/// Additional delay per previous attempt.
const CAMERA_RETRY_STEP_SECS: f64 = 0.5;
/// Retries after the initial attempt before giving up.
const CAMERA_MAX_RETRIES: u32 = 2;
/// A stalled video gets a play() nudge every this many frames.
const VIDEO_NUDGE_INTERVAL: u64 = 20;

static MANAGER_ACTIVE: AtomicBool = AtomicBool::new(false);

/// A live video feed provided by the host camera layer.
pub trait VideoSource {
    /// Playback position in seconds. Detection timestamps derive from this.
    fn current_time(&self) -> f64;
    /// 0..4 readiness as reported by the host; frames are usable from 2.
    fn ready_state(&self) -> u32;
    /// (Re)start playback. Used to nudge a stalled feed.
    fn play(&mut self);
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// Host camera acquisition. Opening resolves asynchronously and may fail
/// (permissions, device busy).
pub trait CameraDevice {
    fn open(&mut self) -> Pending<Result<Box<dyn VideoSource>, CameraError>>;
}

/// Persistence for the selected-filter URL parameter.
pub trait ParamStore {
    fn get(&self, key: &str) -> Option<String>;
    /// Write (or clear, with `None`) a parameter without reloading the page.
    fn set_without_reload(&mut self, key: &str, value: Option<&str>);
}

/// In-memory [`ParamStore`] for hosts without a URL bar.
#[derive(Debug, Default)]
pub struct MemoryParams {
    values: HashMap<String, String>,
}

impl MemoryParams {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParamStore for MemoryParams {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_without_reload(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(value) => {
                self.values.insert(key.to_owned(), value.to_owned());
            }
            None => {
                self.values.remove(key);
            }
        }
    }
}

/// A user-facing advisory produced by the pipeline (e.g. camera failure).
/// Non-fatal; the host decides how to surface it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
}

/// Everything the manager needs from the host for one call.
pub struct HostBindings<'a> {
    pub scene: &'a mut dyn SceneGraph,
    pub assets: &'a mut dyn AssetLoader,
    pub detectors: &'a mut dyn DetectorFactory,
    pub camera: &'a mut dyn CameraDevice,
    pub params: &'a mut dyn ParamStore,
}

/// One selectable filter: its asset, optional behaviour, and (for the
/// single-face case) the lazily created shared scene node.
pub struct FilterSlot {
    pub reference: AssetReference,
    pub behaviour: Option<Box<dyn FilterBehaviour>>,
    shared_node: Option<NodeId>,
}

impl FilterSlot {
    pub fn new(reference: AssetReference, behaviour: Option<Box<dyn FilterBehaviour>>) -> Self {
        Self {
            reference,
            behaviour,
            shared_node: None,
        }
    }
}

enum VideoState {
    Idle,
    Requesting {
        pending: Pending<Result<Box<dyn VideoSource>, CameraError>>,
        attempt: u32,
    },
    RetryWait {
        at: f64,
        attempt: u32,
    },
    Ready(Box<dyn VideoSource>),
    Failed,
}

/// Orchestrates camera, detectors, smoothing, instances and filters.
pub struct TrackingManager {
    config: FilterConfig,
    filters: Vec<FilterSlot>,
    active_filter: Option<usize>,
    occluder_asset: Option<AssetReference>,

    detectors: DetectorSet,
    governor: PerformanceGovernor,
    smoother: ResultSmoother,
    mirror_map: Option<MirrorMap>,

    faces: Vec<FaceInstance>,
    hands: Vec<HandInstance>,
    hand_behaviours: Vec<Box<dyn HandBehaviour>>,

    video: VideoState,
    last_video_time: f64,
    video_size: (u32, u32),

    last_face: Option<FaceResult>,
    last_hand: Option<HandResult>,
    last_pose: Option<PoseResult>,

    frame: u64,
    last_tick_time: Option<f64>,
    smoothed_fps: f32,

    enabled: bool,
    notices: Vec<Notice>,
}

impl TrackingManager {
    pub fn new(config: FilterConfig) -> Self {
        if MANAGER_ACTIVE.swap(true, Ordering::SeqCst) {
            tracing::warn!("multiple TrackingManager instances active; tracking results may conflict");
        }
        let governor = PerformanceGovernor::new(
            config.tuning.fps_threshold,
            config.tuning.downscale_cooldown_secs,
        );
        let smoother = ResultSmoother::new(
            config.tuning.matrix_min_cutoff,
            config.tuning.matrix_beta,
            config.tuning.blendshape_min_cutoff,
            config.tuning.blendshape_beta,
        );
        let occluder_asset = config
            .occluder_url
            .as_deref()
            .map(AssetReference::from_url);
        Self {
            config,
            filters: Vec::new(),
            active_filter: None,
            occluder_asset,
            detectors: DetectorSet::new(),
            governor,
            smoother,
            mirror_map: None,
            faces: Vec::new(),
            hands: Vec::new(),
            hand_behaviours: Vec::new(),
            video: VideoState::Idle,
            last_video_time: -1.0,
            video_size: (0, 0),
            last_face: None,
            last_hand: None,
            last_pose: None,
            frame: 0,
            last_tick_time: None,
            smoothed_fps: 0.0,
            enabled: false,
            notices: Vec::new(),
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn smoothed_fps(&self) -> f32 {
        self.smoothed_fps
    }

    /// Number of face instances currently alive (including ones inside
    /// their retirement grace period).
    pub fn active_faces(&self) -> usize {
        self.faces.len()
    }

    pub fn active_filter(&self) -> Option<usize> {
        self.active_filter
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Most recent (smoothed, mirrored) face result, if any.
    pub fn face_result(&self) -> Option<&FaceResult> {
        self.last_face.as_ref()
    }

    /// Most recent hand result, if any.
    pub fn hand_result(&self) -> Option<&HandResult> {
        self.last_hand.as_ref()
    }

    /// Most recent pose result, if any.
    pub fn pose_result(&self) -> Option<&PoseResult> {
        self.last_pose.as_ref()
    }

    /// Smoothed blendshape score from the most recent face result.
    pub fn get_blendshape_value(&self, face_index: usize, name: &str) -> Option<f32> {
        self.last_face.as_ref()?.blendshape(face_index, name)
    }

    /// Drain advisories accumulated since the last call.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Append a filter slot. Returns its index.
    pub fn add_filter(
        &mut self,
        reference: AssetReference,
        behaviour: Option<Box<dyn FilterBehaviour>>,
    ) -> usize {
        self.filters.push(FilterSlot::new(reference, behaviour));
        self.filters.len() - 1
    }

    /// Remove a filter slot, destroying its shared node if it has one.
    pub fn remove_filter(&mut self, index: usize, host: &mut HostBindings<'_>) {
        if index >= self.filters.len() {
            return;
        }
        let slot = self.filters.remove(index);
        if let Some(node) = slot.shared_node {
            host.scene.destroy(node);
        }
        match self.active_filter {
            Some(active) if active == index => {
                self.active_filter = None;
                self.detach_face_visuals(host.scene);
            }
            Some(active) if active > index => {
                self.active_filter = Some(active - 1);
            }
            _ => {}
        }
    }

    /// Start tracking. Applies the persisted filter selection if the URL
    /// parameter holds a valid index, otherwise selects the first filter.
    pub fn enable(&mut self, host: &mut HostBindings<'_>) {
        self.enabled = true;
        if self.filters.is_empty() {
            return;
        }
        let persisted = self
            .config
            .url_parameter
            .as_deref()
            .and_then(|key| host.params.get(key))
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|&index| index < self.filters.len());
        self.select(persisted.unwrap_or(0), host);
    }

    /// Stop tracking and release everything: detectors, instances, camera.
    pub fn close(&mut self, host: &mut HostBindings<'_>) {
        self.enabled = false;
        self.detectors.close_all();
        for face in &mut self.faces {
            face.remove(host.scene);
        }
        self.faces.clear();
        for hand in &mut self.hands {
            hand.remove(host.scene);
        }
        self.hands.clear();
        for slot in &mut self.filters {
            if let Some(node) = slot.shared_node.take() {
                host.scene.destroy(node);
            }
        }
        self.video = VideoState::Idle;
        self.last_video_time = -1.0;
        self.last_face = None;
        self.last_hand = None;
        self.last_pose = None;
        tracing::info!("tracking closed");
    }

    /// Register a hand behaviour driven from [`Self::prepare_render`].
    pub fn add_hand_behaviour(&mut self, behaviour: Box<dyn HandBehaviour>) {
        self.hand_behaviours.push(behaviour);
    }

    /// Activate the filter at `index`. Returns false if out of range.
    pub fn select(&mut self, index: usize, host: &mut HostBindings<'_>) -> bool {
        if index >= self.filters.len() {
            return false;
        }
        if self.active_filter != Some(index) {
            // Existing visuals belong to the old filter; rebuild lazily.
            self.detach_face_visuals(host.scene);
        }
        self.active_filter = Some(index);
        self.filters[index].reference.ensure_loading(host.assets);
        tracing::info!(index, "filter selected");

        if let Some(key) = self.config.url_parameter.as_deref() {
            if index > 0 {
                host.params.set_without_reload(key, Some(&index.to_string()));
            } else {
                host.params.set_without_reload(key, None);
            }
        }

        // Warm up the next filter so cycling feels instant.
        let preload = (index + 1) % self.filters.len();
        if preload != index {
            self.filters[preload].reference.ensure_loading(host.assets);
        }
        true
    }

    /// Activate the filter whose behaviour carries `id`, appending a new
    /// slot from `fallback` when no existing slot matches. Returns the
    /// activated index.
    pub fn select_behaviour(
        &mut self,
        id: crate::behaviours::BehaviourId,
        fallback: impl FnOnce() -> (AssetReference, Box<dyn FilterBehaviour>),
        host: &mut HostBindings<'_>,
    ) -> usize {
        let index = self
            .filters
            .iter()
            .position(|slot| slot.behaviour.as_ref().map(|b| b.id()) == Some(id))
            .unwrap_or_else(|| {
                let (reference, behaviour) = fallback();
                self.add_filter(reference, Some(behaviour))
            });
        self.select(index, host);
        index
    }

    /// Clear the active filter without removing any slots.
    pub fn deactivate(&mut self, host: &mut HostBindings<'_>) {
        if self.active_filter.take().is_some() {
            self.detach_face_visuals(host.scene);
            if let Some(key) = self.config.url_parameter.as_deref() {
                host.params.set_without_reload(key, None);
            }
        }
    }

    /// Scene nodes of the currently live face instances.
    pub fn active_face_nodes(&self) -> Vec<NodeId> {
        self.faces.iter().filter_map(FaceInstance::node).collect()
    }

    pub fn select_next(&mut self, host: &mut HostBindings<'_>) -> bool {
        if self.filters.is_empty() {
            return false;
        }
        let next = self
            .active_filter
            .map(|index| (index + 1) % self.filters.len())
            .unwrap_or(0);
        self.select(next, host)
    }

    pub fn select_previous(&mut self, host: &mut HostBindings<'_>) -> bool {
        if self.filters.is_empty() {
            return false;
        }
        let previous = match self.active_filter {
            Some(0) | None => self.filters.len() - 1,
            Some(index) => index - 1,
        };
        self.select(previous, host)
    }

    /// Handle a key press. Returns true when the key was consumed.
    pub fn handle_key(&mut self, key: &str, host: &mut HostBindings<'_>) -> bool {
        if !self.config.use_keyboard {
            return false;
        }
        match key.to_ascii_lowercase().as_str() {
            "d" | "arrowright" => self.select_next(host),
            "a" | "arrowleft" => self.select_previous(host),
            _ => false,
        }
    }

    /// Phase one of the frame: camera, detectors, inference, pools.
    /// `now` is monotonic time in seconds.
    pub fn update(&mut self, now: f64, host: &mut HostBindings<'_>) {
        if !self.enabled {
            return;
        }
        self.frame += 1;
        self.update_frame_time(now);
        self.update_camera(now, host);
        self.poll_filter_assets(host);
        // Without a fresh video frame the tick ends here: no governor
        // pressure, no detector lifecycle churn, no inference.
        let Some(timestamp_ms) = self.advance_video() else {
            return;
        };
        self.update_governor(now);
        self.reconcile_detectors(host);
        self.run_inference(timestamp_ms, now, host);
        self.retire_stale_hands(now, host);
    }

    /// Check the video feed for a new frame. Returns its timestamp in
    /// milliseconds, or `None` when there is no usable frame this tick
    /// (camera not ready, feed warming up, or playback stalled).
    fn advance_video(&mut self) -> Option<f64> {
        let VideoState::Ready(video) = &mut self.video else {
            return None;
        };
        if video.ready_state() < 2 {
            return None;
        }
        self.video_size = (video.width(), video.height());
        let current_time = video.current_time();
        if current_time <= self.last_video_time {
            // Feed stalled; give it a periodic nudge.
            if self.frame % VIDEO_NUDGE_INTERVAL == 0 {
                tracing::debug!(current_time, "video stalled, nudging playback");
                video.play();
            }
            return None;
        }
        self.last_video_time = current_time;
        Some(current_time * 1000.0)
    }

    fn update_frame_time(&mut self, now: f64) {
        if let Some(last) = self.last_tick_time {
            let delta = now - last;
            if delta > 0.0 {
                let instant = (1.0 / delta) as f32;
                self.smoothed_fps = if self.frame <= 1 || self.smoothed_fps <= 0.0 {
                    instant
                } else {
                    self.smoothed_fps + (instant - self.smoothed_fps) * FPS_SMOOTHING
                };
            }
        }
        self.last_tick_time = Some(now);
    }

    fn update_camera(&mut self, now: f64, host: &mut HostBindings<'_>) {
        // Take the state out so failure handling can freely replace it.
        match std::mem::replace(&mut self.video, VideoState::Idle) {
            VideoState::Idle => {
                tracing::info!("requesting camera");
                self.video = VideoState::Requesting {
                    pending: host.camera.open(),
                    attempt: 0,
                };
            }
            VideoState::Requesting {
                mut pending,
                attempt,
            } => match pending.poll() {
                PendingPoll::InFlight => {
                    self.video = VideoState::Requesting { pending, attempt };
                }
                PendingPoll::Resolved(Ok(video)) => {
                    tracing::info!("camera ready");
                    self.video_size = (video.width(), video.height());
                    self.video = VideoState::Ready(video);
                }
                PendingPoll::Resolved(Err(error)) => {
                    self.handle_camera_failure(now, attempt, Some(error));
                }
                PendingPoll::Dropped => {
                    self.handle_camera_failure(now, attempt, None);
                }
            },
            VideoState::RetryWait { at, attempt } => {
                if now >= at {
                    tracing::info!(attempt, "retrying camera");
                    self.video = VideoState::Requesting {
                        pending: host.camera.open(),
                        attempt,
                    };
                } else {
                    self.video = VideoState::RetryWait { at, attempt };
                }
            }
            ready_or_failed => self.video = ready_or_failed,
        }
    }

    fn handle_camera_failure(&mut self, now: f64, attempt: u32, error: Option<CameraError>) {
        if attempt < CAMERA_MAX_RETRIES {
            let delay = CAMERA_RETRY_BASE_SECS + CAMERA_RETRY_STEP_SECS * f64::from(attempt);
            tracing::warn!(attempt, delay, "camera acquisition failed, will retry");
            self.video = VideoState::RetryWait {
                at: now + delay,
                attempt: attempt + 1,
            };
        } else {
            let detail = error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "camera request dropped".to_owned());
            tracing::error!(%detail, "camera unavailable, giving up");
            self.notices.push(Notice {
                message: format!("Camera unavailable: {detail}"),
            });
            self.video = VideoState::Failed;
        }
    }

    fn update_governor(&mut self, now: f64) {
        if !self.config.auto_manage_performance {
            return;
        }
        if let Some(reduced) = self
            .governor
            .update(self.smoothed_fps, now, self.config.max_faces)
        {
            tracing::warn!(
                fps = self.smoothed_fps,
                max_faces = reduced,
                "sustained low framerate, reducing tracked faces"
            );
            self.config.max_faces = reduced;
        }
    }

    fn reconcile_detectors(&mut self, host: &mut HostBindings<'_>) {
        self.detectors.face.set_requested(self.config.max_faces);
        self.detectors.hand.set_requested(self.config.max_hands);
        self.detectors
            .pose
            .set_requested(u32::from(self.config.enable_pose));
        self.detectors
            .segmentation
            .set_requested(u32::from(self.config.enable_segmentation));
        self.detectors.reconcile_all(host.detectors);
    }

    fn poll_filter_assets(&mut self, host: &mut HostBindings<'_>) {
        if let Some(occluder) = &mut self.occluder_asset {
            occluder.ensure_loading(host.assets);
            occluder.poll();
        }
        for slot in &mut self.filters {
            slot.reference.poll();
        }
        if let Some(index) = self.active_filter {
            let single_face = self.config.max_faces <= 1;
            let slot = &mut self.filters[index];
            if let Some(handle) = slot.reference.handle() {
                if single_face && slot.shared_node.is_none() {
                    let node = host.scene.instantiate(handle);
                    host.scene.set_visible(node, false);
                    slot.shared_node = Some(node);
                }
            }
            if let Some(behaviour) = &mut slot.behaviour {
                if behaviour.poll_assets() {
                    behaviour.on_texture_changed();
                }
            }
        }
    }

    fn run_inference(&mut self, timestamp_ms: f64, now: f64, host: &mut HostBindings<'_>) {
        let mut face_output: Option<Option<FaceResult>> = None;
        let mut hand_output: Option<Option<HandResult>> = None;
        for slot in [
            &mut self.detectors.face,
            &mut self.detectors.hand,
            &mut self.detectors.pose,
            &mut self.detectors.segmentation,
        ] {
            let kind = slot.kind();
            let Some(detector) = slot.detector_mut() else {
                continue;
            };
            match detector.detect(timestamp_ms) {
                Ok(Some(Detection::Face(result))) => face_output = Some(Some(result)),
                Ok(Some(Detection::Hand(result))) => hand_output = Some(Some(result)),
                Ok(Some(Detection::Pose(result))) => self.last_pose = Some(result),
                Ok(Some(Detection::Segmentation)) => {}
                Ok(None) => match kind {
                    crate::detector::DetectorKind::Face => face_output = Some(None),
                    crate::detector::DetectorKind::Hand => hand_output = Some(None),
                    _ => {}
                },
                Err(error) => {
                    tracing::warn!(%kind, %error, "inference failed");
                }
            }
        }
        if let Some(result) = face_output {
            self.on_face_results(result, now, host);
        }
        if let Some(result) = hand_output {
            self.on_hand_results(result, now);
        }
    }

    fn on_face_results(
        &mut self,
        result: Option<FaceResult>,
        now: f64,
        host: &mut HostBindings<'_>,
    ) {
        let Some(mut result) = result else {
            // Tracking lost entirely: tear the pool down immediately.
            for face in &mut self.faces {
                face.remove(host.scene);
            }
            self.faces.clear();
            self.last_face = None;
            return;
        };

        // Retire instances beyond the detected count, but only once they
        // have been unseen longer than the grace period.
        let grace = self.config.tuning.entity_grace_secs;
        let detected = result.len();
        let scene = &mut *host.scene;
        self.faces.retain_mut(|face| {
            if face.face_index() < detected {
                return true;
            }
            if now - face.last_update_time() > grace {
                face.remove(scene);
                false
            } else {
                face.hide(scene);
                true
            }
        });

        if result.is_empty() {
            self.last_face = Some(result);
            return;
        }

        if self.config.max_faces > 1 {
            self.smoother.apply(&mut result, now);
        }

        if self.config.mirror {
            if self.mirror_map.is_none() {
                if let Some(categories) = result.blendshapes.first() {
                    if !categories.is_empty() {
                        self.mirror_map = Some(MirrorMap::build(categories));
                    }
                }
            }
            if let Some(map) = &self.mirror_map {
                for categories in &mut result.blendshapes {
                    map.apply(categories);
                }
            }
        }

        for index in 0..detected {
            if self.faces.iter().all(|face| face.face_index() != index) {
                self.faces.push(FaceInstance::new(index, now));
            }
        }
        for face in &mut self.faces {
            if face.face_index() < detected {
                face.touch(now);
            }
        }

        if let Some(active) = self.active_filter {
            if let Some(behaviour) = &mut self.filters[active].behaviour {
                for index in 0..detected {
                    behaviour.on_tracking_update(&result, index);
                }
            }
        }

        self.last_face = Some(result);
    }

    fn on_hand_results(&mut self, result: Option<HandResult>, now: f64) {
        let Some(result) = result else {
            self.last_hand = None;
            return;
        };
        while self.hands.len() < result.len() {
            self.hands.push(HandInstance::new(now));
        }
        for hand in self.hands.iter_mut().take(result.len()) {
            hand.touch(now);
        }
        self.last_hand = Some(result);
    }

    fn retire_stale_hands(&mut self, now: f64, host: &mut HostBindings<'_>) {
        let grace = self.config.tuning.entity_grace_secs;
        let detected = self.last_hand.as_ref().map(HandResult::len).unwrap_or(0);
        let scene = &mut *host.scene;
        let mut index = 0;
        self.hands.retain_mut(|hand| {
            let keep = index < detected || now - hand.last_update_time() <= grace;
            if !keep {
                hand.remove(scene);
            } else if index >= detected {
                hand.hide(scene);
            }
            index += 1;
            keep
        });
    }

    /// Phase two of the frame: write transforms and positions into the
    /// scene for everything tracked this frame.
    pub fn prepare_render(&mut self, host: &mut HostBindings<'_>) {
        if !self.enabled {
            return;
        }
        self.render_faces(host);
        self.render_hands(host);
    }

    fn render_faces(&mut self, host: &mut HostBindings<'_>) {
        let Some(result) = &self.last_face else {
            return;
        };
        let Some(active) = self.active_filter else {
            return;
        };
        let slot = &self.filters[active];
        let binding = if self.config.max_faces > 1 {
            match slot.reference.handle() {
                Some(handle) => InstanceBinding::Own(handle),
                None => return,
            }
        } else {
            match slot.shared_node {
                Some(node) => InstanceBinding::Shared(node),
                None => return,
            }
        };

        let occluder = if !self.config.create_occlusion_mesh {
            OccluderSpec::Disabled
        } else if let Some(asset) = &self.occluder_asset {
            OccluderSpec::Custom(asset.handle())
        } else {
            OccluderSpec::Builtin
        };
        let suppress_occluder = slot
            .behaviour
            .as_ref()
            .map(|b| b.overrides_default_occluder())
            .unwrap_or(false);
        let settings = FaceRenderSettings {
            mirror: self.config.mirror,
            occluder,
            suppress_occluder,
            scale: self.config.filter_scale,
            offset: Vec3::from(self.config.filter_offset),
        };

        for face in &mut self.faces {
            let Some(elements) = result.transforms.get(face.face_index()) else {
                continue;
            };
            face.ensure_visual(binding, host.scene);
            face.render(elements, &settings, host.scene);
        }
    }

    fn render_hands(&mut self, host: &mut HostBindings<'_>) {
        let Some(result) = &self.last_hand else {
            return;
        };
        let (width, height) = self.video_size;
        for (hand, landmarks) in self.hands.iter_mut().zip(&result.landmarks) {
            hand.render(landmarks, host.scene, width, height);
        }
        for behaviour in &mut self.hand_behaviours {
            behaviour.on_hands_update(result, host.scene, width, height);
        }
    }

    fn detach_face_visuals(&mut self, scene: &mut dyn SceneGraph) {
        for face in &mut self.faces {
            face.remove(scene);
        }
    }
}

impl Drop for TrackingManager {
    fn drop(&mut self) {
        MANAGER_ACTIVE.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        FakeAssets, FakeCamera, FakeDetectors, RecordingScene, ScriptedFrame,
    };

    struct Host {
        scene: RecordingScene,
        assets: FakeAssets,
        detectors: FakeDetectors,
        camera: FakeCamera,
        params: MemoryParams,
    }

    impl Host {
        fn new() -> Self {
            Self {
                scene: RecordingScene::new(),
                assets: FakeAssets::new(),
                detectors: FakeDetectors::new(),
                camera: FakeCamera::new(),
                params: MemoryParams::new(),
            }
        }

        fn bind(&mut self) -> HostBindings<'_> {
            HostBindings {
                scene: &mut self.scene,
                assets: &mut self.assets,
                detectors: &mut self.detectors,
                camera: &mut self.camera,
                params: &mut self.params,
            }
        }
    }

    fn manager_with_filters(count: usize, host: &mut Host) -> TrackingManager {
        let mut config = FilterConfig::default();
        config.mirror = false;
        let mut manager = TrackingManager::new(config);
        for i in 0..count {
            manager.add_filter(AssetReference::from_url(format!("filter{i}.glb")), None);
        }
        manager.enable(&mut host.bind());
        manager
    }

    /// Drive one update at `now` with the camera and face assets ready.
    fn tick(manager: &mut TrackingManager, host: &mut Host, now: f64) {
        manager.update(now, &mut host.bind());
        host.assets.resolve_all();
        host.detectors.resolve_all();
        host.camera.resolve_all();
    }

    #[test]
    fn test_selection_wraparound() {
        let mut host = Host::new();
        let mut manager = manager_with_filters(3, &mut host);
        assert_eq!(manager.active_filter(), Some(0));

        manager.select_next(&mut host.bind());
        assert_eq!(manager.active_filter(), Some(1));
        manager.select_next(&mut host.bind());
        manager.select_next(&mut host.bind());
        assert_eq!(manager.active_filter(), Some(0));

        manager.select_previous(&mut host.bind());
        assert_eq!(manager.active_filter(), Some(2));
    }

    #[test]
    fn test_select_out_of_range() {
        let mut host = Host::new();
        let mut manager = manager_with_filters(2, &mut host);
        assert!(!manager.select(5, &mut host.bind()));
        assert_eq!(manager.active_filter(), Some(0));
    }

    #[test]
    fn test_keyboard_gating() {
        let mut host = Host::new();
        let mut manager = manager_with_filters(2, &mut host);
        assert!(manager.handle_key("d", &mut host.bind()));
        assert_eq!(manager.active_filter(), Some(1));
        assert!(manager.handle_key("ArrowLeft", &mut host.bind()));
        assert_eq!(manager.active_filter(), Some(0));
        assert!(!manager.handle_key("x", &mut host.bind()));

        let mut config = FilterConfig::default();
        config.use_keyboard = false;
        let mut manager = TrackingManager::new(config);
        manager.add_filter(AssetReference::from_url("a.glb"), None);
        manager.add_filter(AssetReference::from_url("b.glb"), None);
        manager.enable(&mut host.bind());
        assert!(!manager.handle_key("d", &mut host.bind()));
        assert_eq!(manager.active_filter(), Some(0));
    }

    #[test]
    fn test_url_parameter_persistence() {
        let mut host = Host::new();
        let mut config = FilterConfig::default();
        config.url_parameter = Some("facefilter".into());
        let mut manager = TrackingManager::new(config);
        for i in 0..3 {
            manager.add_filter(AssetReference::from_url(format!("f{i}.glb")), None);
        }
        manager.enable(&mut host.bind());
        // Index zero clears the parameter.
        assert_eq!(host.params.get("facefilter"), None);

        manager.select(2, &mut host.bind());
        assert_eq!(host.params.get("facefilter"), Some("2".into()));

        manager.select(0, &mut host.bind());
        assert_eq!(host.params.get("facefilter"), None);
    }

    #[test]
    fn test_enable_restores_selection_from_param() {
        let mut host = Host::new();
        host.params.set_without_reload("facefilter", Some("1"));
        let mut config = FilterConfig::default();
        config.url_parameter = Some("facefilter".into());
        let mut manager = TrackingManager::new(config);
        manager.add_filter(AssetReference::from_url("a.glb"), None);
        manager.add_filter(AssetReference::from_url("b.glb"), None);
        manager.enable(&mut host.bind());
        assert_eq!(manager.active_filter(), Some(1));
    }

    #[test]
    fn test_enable_ignores_invalid_param() {
        let mut host = Host::new();
        host.params.set_without_reload("facefilter", Some("99"));
        let mut config = FilterConfig::default();
        config.url_parameter = Some("facefilter".into());
        let mut manager = TrackingManager::new(config);
        manager.add_filter(AssetReference::from_url("a.glb"), None);
        manager.enable(&mut host.bind());
        assert_eq!(manager.active_filter(), Some(0));
    }

    #[test]
    fn test_camera_retry_then_advisory() {
        let mut host = Host::new();
        host.camera.fail_always();
        let mut manager = manager_with_filters(1, &mut host);

        // Initial attempt fails.
        tick(&mut manager, &mut host, 0.0);
        tick(&mut manager, &mut host, 0.05);
        assert_eq!(host.camera.open_count(), 1);

        // First retry at 0.2s.
        tick(&mut manager, &mut host, 0.1);
        assert_eq!(host.camera.open_count(), 1);
        tick(&mut manager, &mut host, 0.25);
        tick(&mut manager, &mut host, 0.3);
        assert_eq!(host.camera.open_count(), 2);

        // Second retry at +0.7s.
        tick(&mut manager, &mut host, 1.1);
        tick(&mut manager, &mut host, 1.2);
        assert_eq!(host.camera.open_count(), 3);

        // No more retries; a single advisory notice is produced.
        tick(&mut manager, &mut host, 3.0);
        tick(&mut manager, &mut host, 4.0);
        assert_eq!(host.camera.open_count(), 3);
        let notices = manager.take_notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].message.contains("Camera unavailable"));
        assert!(manager.take_notices().is_empty());
    }

    #[test]
    fn test_face_pool_reconciliation_with_grace() {
        let mut host = Host::new();
        let mut config = FilterConfig::default();
        config.mirror = false;
        config.max_faces = 2;
        let mut manager = TrackingManager::new(config);
        manager.add_filter(AssetReference::from_url("f.glb"), None);
        manager.enable(&mut host.bind());

        host.detectors.script_faces(vec![
            ScriptedFrame::Faces(2),
            ScriptedFrame::Faces(2),
            ScriptedFrame::Faces(0),
            ScriptedFrame::Faces(0),
            ScriptedFrame::Faces(0),
            ScriptedFrame::Faces(2),
        ]);
        // Warm-up: camera resolves first, then the detector.
        tick(&mut manager, &mut host, 0.0);
        tick(&mut manager, &mut host, 0.1);
        tick(&mut manager, &mut host, 0.2);
        assert_eq!(manager.active_faces(), 2);
        tick(&mut manager, &mut host, 0.3);
        assert_eq!(manager.active_faces(), 2);

        // Faces disappear; grace period keeps instances alive for 0.5s.
        tick(&mut manager, &mut host, 0.4);
        assert_eq!(manager.active_faces(), 2);
        tick(&mut manager, &mut host, 0.7);
        assert_eq!(manager.active_faces(), 2);
        // Past the grace window they are retired.
        tick(&mut manager, &mut host, 0.9);
        assert_eq!(manager.active_faces(), 0);

        // Faces return; pool regrows.
        tick(&mut manager, &mut host, 1.0);
        assert_eq!(manager.active_faces(), 2);
    }

    #[test]
    fn test_lost_tracking_removes_immediately() {
        let mut host = Host::new();
        let mut manager = manager_with_filters(1, &mut host);
        host.detectors.script_faces(vec![
            ScriptedFrame::Faces(1),
            ScriptedFrame::Lost,
        ]);
        tick(&mut manager, &mut host, 0.0);
        tick(&mut manager, &mut host, 0.1);
        tick(&mut manager, &mut host, 0.2);
        assert_eq!(manager.active_faces(), 1);

        tick(&mut manager, &mut host, 0.3);
        assert_eq!(manager.active_faces(), 0);
        assert_eq!(manager.get_blendshape_value(0, "jawOpen"), None);
    }

    #[test]
    fn test_blendshape_value_from_last_result() {
        let mut host = Host::new();
        let mut manager = manager_with_filters(1, &mut host);
        host.detectors
            .script_faces(vec![ScriptedFrame::Faces(1), ScriptedFrame::Faces(1)]);
        tick(&mut manager, &mut host, 0.0);
        tick(&mut manager, &mut host, 0.1);
        tick(&mut manager, &mut host, 0.2);
        assert_eq!(manager.get_blendshape_value(0, "jawOpen"), Some(0.5));
        assert_eq!(manager.get_blendshape_value(0, "nope"), None);
    }

    #[test]
    fn test_shared_instance_for_single_face() {
        let mut host = Host::new();
        let mut manager = manager_with_filters(1, &mut host);
        host.detectors
            .script_faces(vec![ScriptedFrame::Faces(1), ScriptedFrame::Faces(1)]);
        tick(&mut manager, &mut host, 0.0);
        tick(&mut manager, &mut host, 0.1);
        tick(&mut manager, &mut host, 0.2);
        manager.prepare_render(&mut host.bind());
        // One instantiation: the slot's shared node. The face borrowed it.
        assert_eq!(host.scene.instantiated.len(), 1);

        manager.prepare_render(&mut host.bind());
        assert_eq!(host.scene.instantiated.len(), 1);
    }

    #[test]
    fn test_owned_instances_for_multi_face() {
        let mut host = Host::new();
        let mut config = FilterConfig::default();
        config.mirror = false;
        config.max_faces = 2;
        let mut manager = TrackingManager::new(config);
        manager.add_filter(AssetReference::from_url("f.glb"), None);
        manager.enable(&mut host.bind());
        host.detectors
            .script_faces(vec![ScriptedFrame::Faces(2), ScriptedFrame::Faces(2)]);
        tick(&mut manager, &mut host, 0.0);
        tick(&mut manager, &mut host, 0.1);
        tick(&mut manager, &mut host, 0.2);
        manager.prepare_render(&mut host.bind());
        // Two independent clones, no shared node.
        assert_eq!(host.scene.instantiated.len(), 2);
    }

    #[test]
    fn test_close_tears_everything_down() {
        let mut host = Host::new();
        let mut manager = manager_with_filters(1, &mut host);
        host.detectors
            .script_faces(vec![ScriptedFrame::Faces(1), ScriptedFrame::Faces(1)]);
        tick(&mut manager, &mut host, 0.0);
        tick(&mut manager, &mut host, 0.1);
        tick(&mut manager, &mut host, 0.2);
        manager.prepare_render(&mut host.bind());
        assert_eq!(manager.active_faces(), 1);

        manager.close(&mut host.bind());
        assert_eq!(manager.active_faces(), 0);
        assert!(host.detectors.all_closed());
        // The shared filter node is destroyed on close.
        assert!(!host.scene.destroyed.is_empty());

        // Updates after close are inert.
        manager.update(1.0, &mut host.bind());
        assert_eq!(manager.active_faces(), 0);
    }

    #[test]
    fn test_governor_reduces_face_budget() {
        let mut host = Host::new();
        let mut config = FilterConfig::default();
        config.mirror = false;
        config.max_faces = 3;
        let mut manager = TrackingManager::new(config);
        manager.add_filter(AssetReference::from_url("f.glb"), None);
        manager.enable(&mut host.bind());

        // 10 fps ticks for over five seconds.
        let mut now = 0.0;
        for _ in 0..70 {
            tick(&mut manager, &mut host, now);
            now += 0.1;
        }
        assert!(manager.config().max_faces < 3);
        assert!(manager.config().max_faces >= 1);
    }

    #[test]
    fn test_governor_idle_without_video() {
        let mut host = Host::new();
        host.camera.fail_always();
        let mut config = FilterConfig::default();
        config.mirror = false;
        config.max_faces = 3;
        let mut manager = TrackingManager::new(config);
        manager.add_filter(AssetReference::from_url("f.glb"), None);
        manager.enable(&mut host.bind());

        // A slow host loop with no usable camera must not eat the face
        // budget before tracking has even started.
        let mut now = 0.0;
        for _ in 0..70 {
            tick(&mut manager, &mut host, now);
            now += 0.1;
        }
        assert_eq!(manager.config().max_faces, 3);
    }

    #[test]
    fn test_detectors_wait_for_video() {
        let mut host = Host::new();
        host.camera.fail_always();
        let mut manager = manager_with_filters(1, &mut host);
        tick(&mut manager, &mut host, 0.0);
        tick(&mut manager, &mut host, 0.1);
        assert_eq!(host.detectors.created_count(), 0);

        // With a working camera the face detector is requested as soon as
        // the first frame is available.
        let mut host = Host::new();
        let mut manager = manager_with_filters(1, &mut host);
        tick(&mut manager, &mut host, 0.0);
        tick(&mut manager, &mut host, 0.1);
        assert_eq!(host.detectors.created_count(), 1);
    }

    #[test]
    fn test_stalled_video_gets_nudged() {
        let mut host = Host::new();
        host.camera.freeze_time();
        let mut manager = manager_with_filters(1, &mut host);
        let mut now = 0.0;
        for _ in 0..45 {
            tick(&mut manager, &mut host, now);
            now += 1.0 / 60.0;
        }
        // At least two nudges over 45 frames of a frozen feed.
        assert!(host.camera.play_calls() >= 2);
    }

    #[test]
    fn test_select_behaviour_appends_when_missing() {
        use crate::behaviours::{CustomShader, FilterBehaviour};
        use crate::scene::MaterialHandle;

        let mut host = Host::new();
        let mut manager = manager_with_filters(1, &mut host);
        let behaviour = CustomShader::new(MaterialHandle(1));
        let id = behaviour.id();

        let index = manager.select_behaviour(
            id,
            || (AssetReference::from_url("shader.glb"), Box::new(behaviour)),
            &mut host.bind(),
        );
        assert_eq!(index, 1);
        assert_eq!(manager.active_filter(), Some(1));
        assert_eq!(manager.filter_count(), 2);

        // Selecting the same behaviour again reuses the existing slot.
        let index = manager.select_behaviour(
            id,
            || panic!("fallback must not run for a known behaviour"),
            &mut host.bind(),
        );
        assert_eq!(index, 1);
        assert_eq!(manager.filter_count(), 2);
    }

    #[test]
    fn test_deactivate_clears_selection_and_param() {
        let mut host = Host::new();
        let mut config = FilterConfig::default();
        config.url_parameter = Some("facefilter".into());
        let mut manager = TrackingManager::new(config);
        manager.add_filter(AssetReference::from_url("a.glb"), None);
        manager.add_filter(AssetReference::from_url("b.glb"), None);
        manager.enable(&mut host.bind());
        manager.select(1, &mut host.bind());
        assert_eq!(host.params.get("facefilter"), Some("1".into()));

        manager.deactivate(&mut host.bind());
        assert_eq!(manager.active_filter(), None);
        assert_eq!(host.params.get("facefilter"), None);
        // Slots themselves survive deactivation.
        assert_eq!(manager.filter_count(), 2);
    }

    #[test]
    fn test_remove_filter_adjusts_active_index() {
        let mut host = Host::new();
        let mut manager = manager_with_filters(3, &mut host);
        manager.select(2, &mut host.bind());
        manager.remove_filter(0, &mut host.bind());
        assert_eq!(manager.active_filter(), Some(1));
        assert_eq!(manager.filter_count(), 2);

        // Removing the active filter deactivates.
        manager.remove_filter(1, &mut host.bind());
        assert_eq!(manager.active_filter(), None);
    }
}
