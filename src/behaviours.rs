//! Filter behaviours: the per-filter logic attached to a slot.
//!
//! A behaviour decides how a filter presents itself (textured face mesh,
//! custom shader, video texture) and reacts to per-frame tracking data.
//! The set of behaviour kinds is closed; hosts pick one per filter slot.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::assets::{TextureLoader, TextureSlot};
use crate::detection::{FaceResult, HandResult, Handedness};
use crate::scene::{MaterialHandle, NodeId, SceneGraph, TextureHandle};
use crate::space;

static NEXT_BEHAVIOUR_ID: AtomicU64 = AtomicU64::new(1);

/// Unique id of a behaviour instance within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BehaviourId(u64);

impl BehaviourId {
    fn next() -> Self {
        Self(NEXT_BEHAVIOUR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// What the host should render the face mesh with this frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterialSpec {
    /// A texture-mapped face material with an optional alpha mask.
    Texture {
        map: Option<TextureHandle>,
        mask: Option<TextureHandle>,
    },
    /// A host-provided material used as-is.
    Custom(MaterialHandle),
    /// A video element the host plays onto the face mesh.
    Video { url: String },
}

/// UV layout convention of a face texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaceLayout {
    Procreate,
    #[default]
    Mediapipe,
    Canonical,
}

impl FaceLayout {
    /// Parse a layout name, falling back to the default with a warning.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "procreate" => FaceLayout::Procreate,
            "mediapipe" => FaceLayout::Mediapipe,
            "canonical" => FaceLayout::Canonical,
            other => {
                tracing::warn!(layout = other, "unknown face layout, using mediapipe");
                FaceLayout::Mediapipe
            }
        }
    }
}

/// Per-filter logic driven by the tracking loop.
pub trait FilterBehaviour {
    fn id(&self) -> BehaviourId;

    /// Whether this filter brings its own occlusion geometry, suppressing
    /// the pipeline's default occluder.
    fn overrides_default_occluder(&self) -> bool {
        false
    }

    /// Called once per tick with the smoothed face result while this
    /// behaviour's filter is active.
    fn on_tracking_update(&mut self, result: &FaceResult, face_index: usize);

    /// Advance any in-flight resource loads. Returns true when the
    /// produced material changed since the last call.
    fn poll_assets(&mut self) -> bool {
        false
    }

    /// Called when the bound texture changed since the last frame.
    fn on_texture_changed(&mut self) {}

    /// Material the host should apply to the face mesh this frame.
    fn produce_material(&self) -> Option<MaterialSpec>;
}

/// A face mesh textured from image URLs, with an optional alpha mask.
pub struct FaceTexture {
    id: BehaviourId,
    pub layout: FaceLayout,
    texture: TextureSlot,
    mask: TextureSlot,
}

impl FaceTexture {
    pub fn new(layout: FaceLayout) -> Self {
        Self {
            id: BehaviourId::next(),
            layout,
            texture: TextureSlot::new(),
            mask: TextureSlot::new(),
        }
    }

    pub fn update_texture(&mut self, url: &str, loader: &mut dyn TextureLoader) {
        self.texture.request(url, loader);
    }

    pub fn update_mask(&mut self, url: &str, loader: &mut dyn TextureLoader) {
        self.mask.request(url, loader);
    }

    /// Advance in-flight texture loads. Returns true when the material
    /// changed and [`FilterBehaviour::on_texture_changed`] should fire.
    pub fn poll_textures(&mut self) -> bool {
        let texture_changed = self.texture.poll();
        let mask_changed = self.mask.poll();
        texture_changed || mask_changed
    }
}

impl FilterBehaviour for FaceTexture {
    fn id(&self) -> BehaviourId {
        self.id
    }

    fn poll_assets(&mut self) -> bool {
        self.poll_textures()
    }

    fn on_tracking_update(&mut self, _result: &FaceResult, _face_index: usize) {}

    fn produce_material(&self) -> Option<MaterialSpec> {
        Some(MaterialSpec::Texture {
            map: self.texture.current(),
            mask: self.mask.current(),
        })
    }
}

/// A face mesh rendered with a host-provided material.
pub struct CustomShader {
    id: BehaviourId,
    material: MaterialHandle,
}

impl CustomShader {
    pub fn new(material: MaterialHandle) -> Self {
        Self {
            id: BehaviourId::next(),
            material,
        }
    }
}

impl FilterBehaviour for CustomShader {
    fn id(&self) -> BehaviourId {
        self.id
    }

    fn on_tracking_update(&mut self, _result: &FaceResult, _face_index: usize) {}

    fn produce_material(&self) -> Option<MaterialSpec> {
        Some(MaterialSpec::Custom(self.material))
    }
}

/// Playback state of a [`FaceVideo`] behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// A face mesh textured from a video stream.
pub struct FaceVideo {
    id: BehaviourId,
    url: String,
    state: PlaybackState,
}

impl FaceVideo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: BehaviourId::next(),
            url: url.into(),
            state: PlaybackState::Stopped,
        }
    }

    pub fn update_video(&mut self, url: impl Into<String>) {
        self.url = url.into();
        self.state = PlaybackState::Stopped;
    }

    pub fn play(&mut self) {
        self.state = PlaybackState::Playing;
    }

    pub fn pause(&mut self) {
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
        }
    }

    pub fn stop(&mut self) {
        self.state = PlaybackState::Stopped;
    }

    pub fn playback(&self) -> PlaybackState {
        self.state
    }
}

impl FilterBehaviour for FaceVideo {
    fn id(&self) -> BehaviourId {
        self.id
    }

    fn on_tracking_update(&mut self, _result: &FaceResult, _face_index: usize) {
        // A visible tracked face implies playback should be running.
        if self.state == PlaybackState::Stopped {
            self.state = PlaybackState::Playing;
        }
    }

    fn produce_material(&self) -> Option<MaterialSpec> {
        Some(MaterialSpec::Video {
            url: self.url.clone(),
        })
    }
}

/// Map an XR skeleton bone name to its hand landmark index.
pub fn xr_bone_joint_index(name: &str) -> Option<usize> {
    let index = match name {
        "wrist" => 0,
        "thumb-metacarpal" => 1,
        "thumb-phalanx-proximal" => 2,
        "thumb-phalanx-distal" => 3,
        "thumb-tip" => 4,
        "index-finger-metacarpal" => 5,
        "index-finger-phalanx-proximal" => 5,
        "index-finger-phalanx-intermediate" => 6,
        "index-finger-phalanx-distal" => 7,
        "index-finger-tip" => 8,
        "middle-finger-metacarpal" => 9,
        "middle-finger-phalanx-proximal" => 9,
        "middle-finger-phalanx-intermediate" => 10,
        "middle-finger-phalanx-distal" => 11,
        "middle-finger-tip" => 12,
        "ring-finger-metacarpal" => 13,
        "ring-finger-phalanx-proximal" => 13,
        "ring-finger-phalanx-intermediate" => 14,
        "ring-finger-phalanx-distal" => 15,
        "ring-finger-tip" => 16,
        "pinky-finger-metacarpal" => 17,
        "pinky-finger-phalanx-proximal" => 17,
        "pinky-finger-phalanx-intermediate" => 18,
        "pinky-finger-phalanx-distal" => 19,
        "pinky-finger-tip" => 20,
        _ => return None,
    };
    Some(index)
}

/// Per-frame hand visual driven by the tracking loop.
pub trait HandBehaviour {
    /// Called once per tick with the current hand result.
    fn on_hands_update(
        &mut self,
        hands: &HandResult,
        scene: &mut dyn SceneGraph,
        video_width: u32,
        video_height: u32,
    );
}

/// Positions the named bones of a skinned hand rig from hand landmarks.
///
/// The rig follows the first detected hand matching its handedness; bones
/// whose names are not recognized are skipped at construction.
pub struct SkinnedHandRig {
    handedness: Handedness,
    bones: Vec<(NodeId, usize)>,
    z_scale_factor: f32,
}

impl SkinnedHandRig {
    pub fn new(handedness: Handedness, named_bones: &[(String, NodeId)]) -> Self {
        let mut bones = Vec::new();
        for (name, node) in named_bones {
            match xr_bone_joint_index(name) {
                Some(index) => bones.push((*node, index)),
                None => tracing::debug!(bone = %name, "no joint mapping for bone"),
            }
        }
        Self {
            handedness,
            bones,
            z_scale_factor: 1.0,
        }
    }

    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }
}

impl HandBehaviour for SkinnedHandRig {
    fn on_hands_update(
        &mut self,
        hands: &HandResult,
        scene: &mut dyn SceneGraph,
        video_width: u32,
        video_height: u32,
    ) {
        let Some(hand_index) = hands
            .handedness
            .iter()
            .position(|&h| h == self.handedness)
        else {
            return;
        };
        let Some(landmarks) = hands.landmarks.get(hand_index) else {
            return;
        };
        let (Some(wrist), Some(middle_mcp)) = (landmarks.first(), landmarks.get(9)) else {
            return;
        };
        let depth = space::estimate_depth(wrist, middle_mcp);
        let camera = scene.camera();
        for &(node, joint) in &self.bones {
            if let Some(landmark) = landmarks.get(joint) {
                let position = space::map_landmark_to_camera(
                    landmark,
                    &camera,
                    video_width,
                    video_height,
                    depth,
                    self.z_scale_factor,
                );
                scene.set_position(node, position);
            }
        }
    }
}
