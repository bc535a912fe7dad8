//! Per-entity scene objects managed by the tracking loop.
//!
//! Each tracked face gets a `FaceInstance` holding its scene node and an
//! optional occluder; each tracked hand gets a `HandInstance` holding 21
//! joint spheres. Instances are created lazily on first render and retired
//! by the manager after a grace period without detections.

use glam::{Mat4, Vec3};

use crate::detection::Landmark;
use crate::scene::{AssetHandle, NodeId, PrimitiveKind, SceneGraph};
use crate::space;

/// Non-uniform scale of the built-in head occluder ellipsoid.
const BUILTIN_OCCLUDER_SCALE: Vec3 = Vec3::new(0.16, 0.3, 0.17);
/// Z offset of the built-in occluder relative to the face origin.
const BUILTIN_OCCLUDER_Z: f32 = -0.04;
/// Render order for the built-in occluder.
const BUILTIN_OCCLUDER_ORDER: i32 = -1;
/// Render order for a custom occluder asset.
const CUSTOM_OCCLUDER_ORDER: i32 = -10;

/// Uniform scale applied to hand joint spheres.
const JOINT_SPHERE_SCALE: f32 = 0.3;

/// How a face instance obtains its visual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceBinding {
    /// Instantiate an independent copy of the asset; the instance owns and
    /// eventually destroys it. Used when tracking multiple faces.
    Own(AssetHandle),
    /// Borrow a node owned by the filter slot. Used for the single-face
    /// case; the instance hides it on removal but never destroys it.
    Shared(NodeId),
}

/// What occlusion geometry a face instance should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccluderSpec {
    Disabled,
    /// The built-in head ellipsoid.
    Builtin,
    /// A custom occluder asset; `None` while it is still loading.
    Custom(Option<AssetHandle>),
}

/// Per-frame render settings shared by all face instances.
#[derive(Debug, Clone, Copy)]
pub struct FaceRenderSettings {
    pub mirror: bool,
    pub occluder: OccluderSpec,
    /// Hide the occluder this frame (filter overrides it, or filters are
    /// globally hidden).
    pub suppress_occluder: bool,
    /// Uniform scale applied on top of the face transform.
    pub scale: f32,
    /// Face-local offset applied on top of the face transform.
    pub offset: Vec3,
}

/// One tracked face's presence in the scene.
pub struct FaceInstance {
    face_index: usize,
    last_update_time: f64,
    node: Option<NodeId>,
    owns_node: bool,
    occluder: Option<NodeId>,
}

impl FaceInstance {
    pub fn new(face_index: usize, now: f64) -> Self {
        Self {
            face_index,
            last_update_time: now,
            node: None,
            owns_node: false,
            occluder: None,
        }
    }

    pub fn face_index(&self) -> usize {
        self.face_index
    }

    pub fn set_face_index(&mut self, index: usize) {
        self.face_index = index;
    }

    /// Record that this face was seen in the current frame.
    pub fn touch(&mut self, now: f64) {
        self.last_update_time = now;
    }

    pub fn last_update_time(&self) -> f64 {
        self.last_update_time
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Attach the visual node if it does not exist yet.
    pub fn ensure_visual(&mut self, binding: InstanceBinding, scene: &mut dyn SceneGraph) {
        if self.node.is_some() {
            return;
        }
        match binding {
            InstanceBinding::Own(asset) => {
                let node = scene.instantiate(asset);
                scene.set_parent(node, scene.camera_node());
                self.node = Some(node);
                self.owns_node = true;
            }
            InstanceBinding::Shared(node) => {
                scene.set_parent(node, scene.camera_node());
                self.node = Some(node);
                self.owns_node = false;
            }
        }
        tracing::debug!(face = self.face_index, owned = self.owns_node, "face instance attached");
    }

    fn ensure_occluder(&mut self, spec: OccluderSpec, scene: &mut dyn SceneGraph) {
        if self.occluder.is_some() {
            return;
        }
        let Some(parent) = self.node else { return };
        match spec {
            OccluderSpec::Disabled | OccluderSpec::Custom(None) => {}
            OccluderSpec::Builtin => {
                let group = scene.create_group();
                let sphere = scene.create_primitive(PrimitiveKind::Sphere, BUILTIN_OCCLUDER_SCALE);
                scene.set_parent(sphere, group);
                scene.set_position(sphere, Vec3::new(0.0, 0.0, BUILTIN_OCCLUDER_Z));
                scene.make_occluder(group, BUILTIN_OCCLUDER_ORDER);
                scene.set_parent(group, parent);
                self.occluder = Some(group);
            }
            OccluderSpec::Custom(Some(asset)) => {
                let node = scene.instantiate(asset);
                scene.make_occluder(node, CUSTOM_OCCLUDER_ORDER);
                scene.set_parent(node, parent);
                self.occluder = Some(node);
            }
        }
    }

    /// Apply this frame's face transform and occluder state.
    pub fn render(
        &mut self,
        elements: &[f32; 16],
        settings: &FaceRenderSettings,
        scene: &mut dyn SceneGraph,
    ) {
        let Some(node) = self.node else { return };
        scene.set_visible(node, true);
        let mut matrix = space::apply_face_transform(elements, settings.mirror);
        if settings.scale != 1.0 || settings.offset != Vec3::ZERO {
            matrix *= Mat4::from_translation(settings.offset)
                * Mat4::from_scale(Vec3::splat(settings.scale));
        }
        scene.set_local_matrix(node, matrix);

        if settings.suppress_occluder {
            if let Some(occluder) = self.occluder {
                scene.set_visible(occluder, false);
            }
            return;
        }
        self.ensure_occluder(settings.occluder, scene);
        if let Some(occluder) = self.occluder {
            scene.set_visible(occluder, true);
        }
    }

    /// Hide this face without destroying anything (e.g. detection dropped
    /// this frame but the grace period has not elapsed).
    pub fn hide(&mut self, scene: &mut dyn SceneGraph) {
        if let Some(node) = self.node {
            scene.set_visible(node, false);
        }
        if let Some(occluder) = self.occluder {
            scene.set_visible(occluder, false);
        }
    }

    /// Tear down the instance. Owned nodes are destroyed, shared nodes are
    /// hidden and returned to the slot. Idempotent.
    pub fn remove(&mut self, scene: &mut dyn SceneGraph) {
        if let Some(occluder) = self.occluder.take() {
            scene.destroy(occluder);
        }
        if let Some(node) = self.node.take() {
            if self.owns_node {
                scene.destroy(node);
            } else {
                scene.set_visible(node, false);
            }
        }
        self.owns_node = false;
    }
}

/// One tracked hand's presence in the scene: a sphere per joint.
pub struct HandInstance {
    last_update_time: f64,
    joints: Vec<NodeId>,
}

impl HandInstance {
    pub fn new(now: f64) -> Self {
        Self {
            last_update_time: now,
            joints: Vec::new(),
        }
    }

    pub fn touch(&mut self, now: f64) {
        self.last_update_time = now;
    }

    pub fn last_update_time(&self) -> f64 {
        self.last_update_time
    }

    fn ensure_joints(&mut self, count: usize, scene: &mut dyn SceneGraph) {
        while self.joints.len() < count {
            let sphere =
                scene.create_primitive(PrimitiveKind::Sphere, Vec3::splat(JOINT_SPHERE_SCALE));
            scene.set_parent(sphere, scene.camera_node());
            self.joints.push(sphere);
        }
    }

    /// Position every joint sphere from this frame's landmarks.
    pub fn render(
        &mut self,
        landmarks: &[Landmark],
        scene: &mut dyn SceneGraph,
        video_width: u32,
        video_height: u32,
    ) {
        let (Some(wrist), Some(middle_mcp)) = (landmarks.first(), landmarks.get(9)) else {
            return;
        };
        let depth = space::estimate_depth(wrist, middle_mcp);
        self.ensure_joints(landmarks.len(), scene);
        let camera = scene.camera();
        for (landmark, &node) in landmarks.iter().zip(&self.joints) {
            let position = space::map_landmark_to_camera(
                landmark,
                &camera,
                video_width,
                video_height,
                depth,
                1.0,
            );
            scene.set_position(node, position);
            scene.set_visible(node, true);
        }
    }

    pub fn hide(&mut self, scene: &mut dyn SceneGraph) {
        for &node in &self.joints {
            scene.set_visible(node, false);
        }
    }

    /// Destroy all joint spheres. Idempotent.
    pub fn remove(&mut self, scene: &mut dyn SceneGraph) {
        for node in self.joints.drain(..) {
            scene.destroy(node);
        }
    }
}
