//! Shared test doubles for the host boundaries.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use glam::{Mat4, Vec3};
use tokio::sync::oneshot;

use crate::assets::{AssetLoader, TextureLoader};
use crate::detection::{Category, FaceResult, Landmark};
use crate::detector::{
    Detection, Detector, DetectorFactory, DetectorKind, DetectorOptions,
};
use crate::error::{CameraError, DetectorError};
use crate::manager::{CameraDevice, VideoSource};
use crate::pending::Pending;
use crate::scene::{
    AssetHandle, CameraIntrinsics, NodeId, PrimitiveKind, SceneGraph, TextureHandle,
};

/// Scene-graph double that records every mutation for assertions.
pub struct RecordingScene {
    next_id: u64,
    pub groups: Vec<NodeId>,
    pub primitives: Vec<(NodeId, PrimitiveKind, Vec3)>,
    pub instantiated: Vec<(NodeId, AssetHandle)>,
    pub occluders: Vec<(NodeId, i32)>,
    pub destroyed: Vec<NodeId>,
    pub visible: HashMap<NodeId, bool>,
    pub matrices: HashMap<NodeId, Mat4>,
    pub positions: HashMap<NodeId, Vec3>,
    parents: HashMap<NodeId, NodeId>,
    camera: CameraIntrinsics,
}

impl RecordingScene {
    pub fn new() -> Self {
        Self {
            next_id: 10,
            groups: Vec::new(),
            primitives: Vec::new(),
            instantiated: Vec::new(),
            occluders: Vec::new(),
            destroyed: Vec::new(),
            visible: HashMap::new(),
            matrices: HashMap::new(),
            positions: HashMap::new(),
            parents: HashMap::new(),
            camera: CameraIntrinsics {
                vertical_fov_degrees: 60.0,
                aspect: 16.0 / 9.0,
            },
        }
    }

    fn alloc(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl SceneGraph for RecordingScene {
    fn root(&self) -> NodeId {
        NodeId(1)
    }

    fn camera_node(&self) -> NodeId {
        NodeId(2)
    }

    fn camera(&self) -> CameraIntrinsics {
        self.camera
    }

    fn create_group(&mut self) -> NodeId {
        let id = self.alloc();
        self.groups.push(id);
        id
    }

    fn create_primitive(&mut self, kind: PrimitiveKind, scale: Vec3) -> NodeId {
        let id = self.alloc();
        self.primitives.push((id, kind, scale));
        id
    }

    fn instantiate(&mut self, asset: AssetHandle) -> NodeId {
        let id = self.alloc();
        self.instantiated.push((id, asset));
        id
    }

    fn set_parent(&mut self, node: NodeId, parent: NodeId) {
        self.parents.insert(node, parent);
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parents.get(&node).copied()
    }

    fn set_visible(&mut self, node: NodeId, visible: bool) {
        self.visible.insert(node, visible);
    }

    fn set_local_matrix(&mut self, node: NodeId, matrix: Mat4) {
        self.matrices.insert(node, matrix);
    }

    fn set_position(&mut self, node: NodeId, position: Vec3) {
        self.positions.insert(node, position);
    }

    fn make_occluder(&mut self, node: NodeId, render_order: i32) {
        self.occluders.push((node, render_order));
    }

    fn destroy(&mut self, node: NodeId) {
        self.destroyed.push(node);
    }
}

/// Asset and texture loader double. Loads stay pending until
/// [`FakeAssets::resolve_all`] runs; every load succeeds with a fresh
/// handle.
pub struct FakeAssets {
    next_handle: u64,
    pub asset_loads: Vec<String>,
    asset_resolvers: Vec<oneshot::Sender<Option<AssetHandle>>>,
    texture_resolvers: Vec<oneshot::Sender<Option<TextureHandle>>>,
}

impl FakeAssets {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            asset_loads: Vec::new(),
            asset_resolvers: Vec::new(),
            texture_resolvers: Vec::new(),
        }
    }

    pub fn resolve_all(&mut self) {
        for tx in self.asset_resolvers.drain(..) {
            let handle = AssetHandle(self.next_handle);
            self.next_handle += 1;
            let _ = tx.send(Some(handle));
        }
        for tx in self.texture_resolvers.drain(..) {
            let handle = TextureHandle(self.next_handle);
            self.next_handle += 1;
            let _ = tx.send(Some(handle));
        }
    }
}

impl AssetLoader for FakeAssets {
    fn load(&mut self, url: &str) -> Pending<Option<AssetHandle>> {
        self.asset_loads.push(url.to_owned());
        let (tx, pending) = Pending::channel();
        self.asset_resolvers.push(tx);
        pending
    }
}

impl TextureLoader for FakeAssets {
    fn load_texture(&mut self, _url: &str) -> Pending<Option<TextureHandle>> {
        let (tx, pending) = Pending::channel();
        self.texture_resolvers.push(tx);
        pending
    }
}

/// One scripted frame of face detector output.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedFrame {
    /// A result containing this many faces.
    Faces(usize),
    /// No result at all (tracking lost).
    Lost,
}

fn scripted_face_result(count: usize) -> FaceResult {
    let mut result = FaceResult::default();
    for i in 0..count {
        let mut elements = Mat4::IDENTITY.to_cols_array();
        elements[12] = i as f32 * 10.0;
        result.transforms.push(elements);
        result.landmarks.push(vec![Landmark::default()]);
        result.blendshapes.push(vec![Category {
            name: "jawOpen".into(),
            score: 0.5,
        }]);
    }
    result
}

struct ScriptedDetector {
    kind: DetectorKind,
    script: Rc<RefCell<VecDeque<ScriptedFrame>>>,
    closed: Rc<Cell<bool>>,
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, _timestamp_ms: f64) -> Result<Option<Detection>, DetectorError> {
        if self.kind != DetectorKind::Face {
            return Ok(None);
        }
        match self.script.borrow_mut().pop_front() {
            Some(ScriptedFrame::Faces(count)) => {
                Ok(Some(Detection::Face(scripted_face_result(count))))
            }
            Some(ScriptedFrame::Lost) | None => Ok(None),
        }
    }

    fn set_options(&mut self, _options: &DetectorOptions) -> Result<(), DetectorError> {
        Ok(())
    }

    fn close(&mut self) {
        self.closed.set(true);
    }
}

/// Detector factory double. Creations stay pending until
/// [`FakeDetectors::resolve_all`] runs; the face detector then replays the
/// frames given to [`FakeDetectors::script_faces`].
pub struct FakeDetectors {
    script: Rc<RefCell<VecDeque<ScriptedFrame>>>,
    resolvers: Vec<(DetectorKind, oneshot::Sender<Option<Box<dyn Detector>>>)>,
    closed_flags: Vec<Rc<Cell<bool>>>,
    created: u32,
}

impl FakeDetectors {
    pub fn new() -> Self {
        Self {
            script: Rc::new(RefCell::new(VecDeque::new())),
            resolvers: Vec::new(),
            closed_flags: Vec::new(),
            created: 0,
        }
    }

    /// How many detector creations were requested so far.
    pub fn created_count(&self) -> u32 {
        self.created
    }

    pub fn script_faces(&mut self, frames: Vec<ScriptedFrame>) {
        self.script.borrow_mut().extend(frames);
    }

    pub fn resolve_all(&mut self) {
        for (kind, tx) in self.resolvers.drain(..) {
            let closed = Rc::new(Cell::new(false));
            self.closed_flags.push(closed.clone());
            let detector = ScriptedDetector {
                kind,
                script: self.script.clone(),
                closed,
            };
            let _ = tx.send(Some(Box::new(detector)));
        }
    }

    pub fn all_closed(&self) -> bool {
        !self.closed_flags.is_empty() && self.closed_flags.iter().all(|flag| flag.get())
    }
}

impl DetectorFactory for FakeDetectors {
    fn create(
        &mut self,
        kind: DetectorKind,
        _options: &DetectorOptions,
    ) -> Pending<Option<Box<dyn Detector>>> {
        self.created += 1;
        let (tx, pending) = Pending::channel();
        self.resolvers.push((kind, tx));
        pending
    }
}

struct FakeVideoSource {
    time: Rc<Cell<f64>>,
    frozen: bool,
    play_calls: Rc<Cell<u32>>,
}

impl VideoSource for FakeVideoSource {
    fn current_time(&self) -> f64 {
        if !self.frozen {
            self.time.set(self.time.get() + 1.0 / 30.0);
        }
        self.time.get()
    }

    fn ready_state(&self) -> u32 {
        2
    }

    fn play(&mut self) {
        self.play_calls.set(self.play_calls.get() + 1);
    }

    fn width(&self) -> u32 {
        1280
    }

    fn height(&self) -> u32 {
        720
    }
}

/// Camera double. Opens stay pending until [`FakeCamera::resolve_all`]
/// runs, then succeed with a synthetic video source (or fail, after
/// [`FakeCamera::fail_always`]).
pub struct FakeCamera {
    fail: bool,
    frozen: bool,
    opens: u32,
    resolvers: Vec<oneshot::Sender<Result<Box<dyn VideoSource>, CameraError>>>,
    play_calls: Rc<Cell<u32>>,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self {
            fail: false,
            frozen: false,
            opens: 0,
            resolvers: Vec::new(),
            play_calls: Rc::new(Cell::new(0)),
        }
    }

    pub fn fail_always(&mut self) {
        self.fail = true;
    }

    /// Make the video feed report a constant playback position.
    pub fn freeze_time(&mut self) {
        self.frozen = true;
    }

    pub fn open_count(&self) -> u32 {
        self.opens
    }

    pub fn play_calls(&self) -> u32 {
        self.play_calls.get()
    }

    pub fn resolve_all(&mut self) {
        for tx in self.resolvers.drain(..) {
            let result = if self.fail {
                Err(CameraError::PermissionDenied("denied by test".into()))
            } else {
                Ok(Box::new(FakeVideoSource {
                    time: Rc::new(Cell::new(0.0)),
                    frozen: self.frozen,
                    play_calls: self.play_calls.clone(),
                }) as Box<dyn VideoSource>)
            };
            let _ = tx.send(result);
        }
    }
}

impl CameraDevice for FakeCamera {
    fn open(&mut self) -> Pending<Result<Box<dyn VideoSource>, CameraError>> {
        self.opens += 1;
        let (tx, pending) = Pending::channel();
        self.resolvers.push(tx);
        pending
    }
}
