//! Detection result model and per-result operations.
//!
//! One `FaceResult`/`HandResult` is produced per processed frame and stays
//! immutable until the next detection call overwrites it. Entity order
//! inside a result is positional only — the slot index is NOT a stable
//! identity across frames.

use glam::Mat4;
use serde::{Deserialize, Serialize};

use facefilter_smoothing::{OneEuroFilter, OneEuroMat4};

/// A normalized 2D/3D keypoint. `x`/`y` are in [0, 1] image space with `y`
/// growing downward; `z` is a relative depth in roughly the same scale.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One named blendshape activation (0..1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub score: f32,
}

/// Flattened 4x4 face pose as delivered by the detector: column-major
/// elements with the translation in elements 12..=14, in centimeters.
pub type FaceMatrix = [f32; 16];

/// Per-frame face detector output. The three vectors are index-aligned:
/// slot `i` of each describes the same physical face.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaceResult {
    pub landmarks: Vec<Vec<Landmark>>,
    pub transforms: Vec<FaceMatrix>,
    pub blendshapes: Vec<Vec<Category>>,
}

impl FaceResult {
    /// Number of detected faces this frame.
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Look up a blendshape score by name for the given face slot.
    pub fn blendshape(&self, face_index: usize, name: &str) -> Option<f32> {
        self.blendshapes
            .get(face_index)?
            .iter()
            .find(|category| category.name == name)
            .map(|category| category.score)
    }

    /// Swap every per-slot record between two face slots in lock-step.
    fn swap_slots(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.transforms.swap(a, b);
        if self.landmarks.len() > a.max(b) {
            self.landmarks.swap(a, b);
        }
        if self.blendshapes.len() > a.max(b) {
            self.blendshapes.swap(a, b);
        }
    }

    /// Re-order detected faces left-to-right by the horizontal translation
    /// of their pose matrix, so slot indices stay spatially stable between
    /// frames.
    ///
    /// This is a bubble-style adjacent swap, not a full stable sort: with
    /// more than two faces it only guarantees eventual ordering over
    /// consecutive frames, not single-tick correctness.
    pub fn sort_left_to_right(&mut self) {
        let count = self.transforms.len();
        if count < 2 {
            return;
        }
        for index in 0..count {
            let x = self.transforms[index][12];
            for i in index + 1..count {
                if self.transforms[i][12] < x {
                    self.swap_slots(index, i);
                    break;
                }
            }
        }
    }
}

/// Well-known blendshape category names as emitted by the face detector.
pub mod blendshape {
    pub const BROW_DOWN_LEFT: &str = "browDownLeft";
    pub const BROW_DOWN_RIGHT: &str = "browDownRight";
    pub const BROW_INNER_UP: &str = "browInnerUp";
    pub const CHEEK_PUFF: &str = "cheekPuff";
    pub const EYE_BLINK_LEFT: &str = "eyeBlinkLeft";
    pub const EYE_BLINK_RIGHT: &str = "eyeBlinkRight";
    pub const EYE_LOOK_DOWN_LEFT: &str = "eyeLookDownLeft";
    pub const EYE_LOOK_DOWN_RIGHT: &str = "eyeLookDownRight";
    pub const EYE_LOOK_UP_LEFT: &str = "eyeLookUpLeft";
    pub const EYE_LOOK_UP_RIGHT: &str = "eyeLookUpRight";
    pub const EYE_SQUINT_LEFT: &str = "eyeSquintLeft";
    pub const EYE_SQUINT_RIGHT: &str = "eyeSquintRight";
    pub const EYE_WIDE_LEFT: &str = "eyeWideLeft";
    pub const EYE_WIDE_RIGHT: &str = "eyeWideRight";
    pub const JAW_OPEN: &str = "jawOpen";
    pub const MOUTH_PUCKER: &str = "mouthPucker";
    pub const MOUTH_SMILE_LEFT: &str = "mouthSmileLeft";
    pub const MOUTH_SMILE_RIGHT: &str = "mouthSmileRight";
    pub const TONGUE_OUT: &str = "tongueOut";
}

/// Which hand a detection belongs to, from the subject's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handedness {
    Left,
    Right,
}

/// Per-frame hand detector output; slot-aligned like [`FaceResult`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandResult {
    pub landmarks: Vec<Vec<Landmark>>,
    pub handedness: Vec<Handedness>,
}

impl HandResult {
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
}

/// Per-frame pose detector output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoseResult {
    pub landmarks: Vec<Vec<Landmark>>,
}

/// Hand joints in detector landmark order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum HandJoint {
    Wrist = 0,
    ThumbCmc = 1,
    ThumbMcp = 2,
    ThumbIp = 3,
    ThumbTip = 4,
    IndexFingerMcp = 5,
    IndexFingerPip = 6,
    IndexFingerDip = 7,
    IndexFingerTip = 8,
    MiddleFingerMcp = 9,
    MiddleFingerPip = 10,
    MiddleFingerDip = 11,
    MiddleFingerTip = 12,
    RingFingerMcp = 13,
    RingFingerPip = 14,
    RingFingerDip = 15,
    RingFingerTip = 16,
    PinkyMcp = 17,
    PinkyPip = 18,
    PinkyDip = 19,
    PinkyTip = 20,
}

impl HandJoint {
    /// Index of this joint within a hand landmark set.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Number of joints in one hand landmark set.
    pub const COUNT: usize = 21;
}

/// Precomputed pairing of `*Left`/`*Right` blendshape indices used to swap
/// scores when the scene is horizontally mirrored.
///
/// The pairing is computed once from the first result's category order and
/// reused on subsequent ticks; category order is stable per detector.
#[derive(Debug, Clone)]
pub struct MirrorMap {
    pairs: Vec<(usize, usize)>,
}

impl MirrorMap {
    /// Scan the category list and pair each `*Left` entry with the next
    /// `*Right` entry after it.
    pub fn build(categories: &[Category]) -> Self {
        let mut pairs = Vec::new();
        for (i, left) in categories.iter().enumerate() {
            if !left.name.ends_with("Left") {
                continue;
            }
            for (k, right) in categories.iter().enumerate().skip(i + 1) {
                if right.name.ends_with("Right") {
                    tracing::debug!("blendshape mirror: {} <-> {}", left.name, right.name);
                    pairs.push((i, k));
                    break;
                }
            }
        }
        Self { pairs }
    }

    /// Swap the paired scores in place. Call exactly once per tick.
    pub fn apply(&self, categories: &mut [Category]) {
        for &(left, right) in &self.pairs {
            if left < categories.len() && right < categories.len() {
                let left_score = categories[left].score;
                categories[left].score = categories[right].score;
                categories[right].score = left_score;
            }
        }
    }

    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }
}

/// Temporal smoothing over a multi-face result.
///
/// Filter state is keyed by detection slot index, not by a stable entity
/// identity: when faces re-order between frames a slot inherits another
/// face's filter history, causing a brief smoothing glitch.
#[derive(Debug)]
pub struct ResultSmoother {
    matrix_min_cutoff: f32,
    matrix_beta: f32,
    blendshape_min_cutoff: f32,
    blendshape_beta: f32,
    matrices: Vec<OneEuroMat4>,
    blendshapes: Vec<Vec<OneEuroFilter>>,
}

impl ResultSmoother {
    pub fn new(
        matrix_min_cutoff: f32,
        matrix_beta: f32,
        blendshape_min_cutoff: f32,
        blendshape_beta: f32,
    ) -> Self {
        Self {
            matrix_min_cutoff,
            matrix_beta,
            blendshape_min_cutoff,
            blendshape_beta,
            matrices: Vec::new(),
            blendshapes: Vec::new(),
        }
    }

    /// Sort faces left-to-right, then smooth every pose matrix and
    /// blendshape channel in place. `time` is seconds since startup.
    pub fn apply(&mut self, result: &mut FaceResult, time: f64) {
        result.sort_left_to_right();

        for (i, elements) in result.transforms.iter_mut().enumerate() {
            if self.matrices.len() <= i {
                self.matrices
                    .push(OneEuroMat4::new(self.matrix_min_cutoff, self.matrix_beta));
            }
            let raw = Mat4::from_cols_array(elements);
            let filtered = self.matrices[i].filter(&raw, time);
            *elements = filtered.to_cols_array();
        }

        for (i, categories) in result.blendshapes.iter_mut().enumerate() {
            if self.blendshapes.len() <= i {
                self.blendshapes.push(Vec::new());
            }
            let channels = &mut self.blendshapes[i];
            for (k, category) in categories.iter_mut().enumerate() {
                if channels.len() <= k {
                    channels.push(OneEuroFilter::new(
                        self.blendshape_min_cutoff,
                        self.blendshape_beta,
                    ));
                }
                category.score = channels[k].filter(category.score, time);
            }
        }
    }
}
