//! Coordinate-space conversion between detector output and the camera frame.
//!
//! Detectors report landmarks in normalized image space ([0, 1] with a
//! relative depth) and face poses as 4x4 matrices in detector-local
//! centimeters. Everything here maps those into the engine's meter-scaled,
//! camera-attached frame. All functions are pure; callers are responsible
//! for attaching the target object as a child of the camera node.

use glam::{Mat4, Vec3};

use crate::detection::Landmark;
use crate::scene::CameraIntrinsics;

/// Anatomical correction from the detector's face origin to the point
/// between the eyes, in meters.
const FACE_ORIGIN_OFFSET: Vec3 = Vec3::new(0.0, 0.015, -0.01);

/// Z distance (meters, camera space) at which the hand reference size was
/// measured.
pub const REFERENCE_DEPTH: f32 = -0.3;
/// Normalized wrist-to-middle-MCP distance observed at [`REFERENCE_DEPTH`].
pub const REFERENCE_APPARENT_SIZE: f32 = 0.3;

/// Apparent sizes below this are treated as degenerate (overlapping
/// landmarks) and fall back to the reference depth.
const MIN_APPARENT_SIZE: f32 = 1e-4;

/// Convert a detector face matrix (column-major elements, centimeter
/// translation) into a camera-local transform in meters.
///
/// When `mirror` is set the result is additionally flipped on X to match the
/// front-camera selfie convention.
pub fn apply_face_transform(elements: &[f32; 16], mirror: bool) -> Mat4 {
    let mut matrix = Mat4::from_cols_array(elements);
    matrix.w_axis.x *= 0.01;
    matrix.w_axis.y *= 0.01;
    matrix.w_axis.z *= 0.01;

    let offset = Mat4::from_translation(FACE_ORIGIN_OFFSET);
    if mirror {
        Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0)) * offset * matrix
    } else {
        offset * matrix
    }
}

/// Map a normalized landmark into the camera's local space.
///
/// `base_depth` is the signed Z of the reference plane the landmark cloud is
/// projected onto; the landmark's relative depth offsets the point from that
/// plane proportionally to the plane's width scaled by `z_scale_factor`.
pub fn map_landmark_to_camera(
    landmark: &Landmark,
    camera: &CameraIntrinsics,
    video_width: u32,
    video_height: u32,
    base_depth: f32,
    z_scale_factor: f32,
) -> Vec3 {
    let aspect = if video_height > 0 {
        video_width as f32 / video_height as f32
    } else {
        camera.aspect
    };
    let half_fov_tan = (camera.vertical_fov_radians() / 2.0).tan();

    // Size of the reference plane at base depth via pinhole projection.
    let width_at_base = 2.0 * half_fov_tan * base_depth.abs() * aspect;

    let depth_offset = landmark.z * width_at_base * z_scale_factor;
    let target_z = base_depth - depth_offset;

    let height_at_target = 2.0 * half_fov_tan * target_z.abs();
    let width_at_target = height_at_target * aspect;

    let ndc_x = landmark.x * 2.0 - 1.0;
    let ndc_y = 1.0 - landmark.y * 2.0;

    Vec3::new(
        -ndc_x * (width_at_target / 2.0),
        ndc_y * (height_at_target / 2.0),
        target_z,
    )
}

/// Estimate the camera-space depth of a hand from the apparent 2D distance
/// between two anchor landmarks (e.g. wrist and middle-finger MCP).
///
/// The detector provides no absolute depth for hands, so the apparent size
/// is assumed inversely proportional to the real distance.
pub fn estimate_depth(a: &Landmark, b: &Landmark) -> f32 {
    estimate_depth_with(a, b, REFERENCE_DEPTH, REFERENCE_APPARENT_SIZE)
}

pub fn estimate_depth_with(
    a: &Landmark,
    b: &Landmark,
    reference_depth: f32,
    reference_apparent_size: f32,
) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let apparent_size = (dx * dx + dy * dy).sqrt();
    if apparent_size > MIN_APPARENT_SIZE {
        reference_depth * (reference_apparent_size / apparent_size)
    } else {
        reference_depth
    }
}
