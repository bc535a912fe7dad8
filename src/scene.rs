//! Host scene-graph boundary.
//!
//! The pipeline never renders anything itself. It drives a host 3D scene
//! through this trait: instantiating loaded assets, parenting overlay nodes
//! under the camera, and converting meshes into depth-only occluders. Ids
//! are opaque; the host owns the actual objects.

use glam::{Mat4, Vec3};

/// Opaque id of a node in the host scene graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// Opaque id of a loaded (instantiable) asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetHandle(pub u64);

/// Opaque id of a loaded texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Opaque id of a host-provided material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialHandle(pub u64);

/// Camera parameters needed for landmark-space conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    /// Vertical field of view in degrees.
    pub vertical_fov_degrees: f32,
    /// Render target aspect ratio (width / height).
    pub aspect: f32,
}

impl CameraIntrinsics {
    pub fn vertical_fov_radians(&self) -> f32 {
        self.vertical_fov_degrees.to_radians()
    }
}

/// Primitive shapes the pipeline may ask the host to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Sphere,
}

/// The scene-graph operations the pipeline depends on.
///
/// Implementations are expected to be cheap per call; the pipeline invokes
/// these from inside the render-preparation phase of every tick.
pub trait SceneGraph {
    /// Root node that instantiated filter visuals are attached to.
    fn root(&self) -> NodeId;
    /// The main camera node. Face transforms and hand joints are expressed
    /// in this node's local space.
    fn camera_node(&self) -> NodeId;
    /// Current camera intrinsics.
    fn camera(&self) -> CameraIntrinsics;

    /// Create an empty group node.
    fn create_group(&mut self) -> NodeId;
    /// Create a primitive mesh node with the given non-uniform scale.
    fn create_primitive(&mut self, kind: PrimitiveKind, scale: Vec3) -> NodeId;
    /// Instantiate an independent copy of a loaded asset.
    fn instantiate(&mut self, asset: AssetHandle) -> NodeId;

    fn set_parent(&mut self, node: NodeId, parent: NodeId);
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    fn set_visible(&mut self, node: NodeId, visible: bool);
    fn set_local_matrix(&mut self, node: NodeId, matrix: Mat4);
    fn set_position(&mut self, node: NodeId, position: Vec3);

    /// Replace the node's materials (recursively) with an invisible,
    /// depth-writing occluder material and pin its render order.
    fn make_occluder(&mut self, node: NodeId, render_order: i32);

    /// Destroy a node and everything below it.
    fn destroy(&mut self, node: NodeId);
}
