//! Face and hand tracking filter pipeline for interactive 3D scenes.
//!
//! The crate turns per-frame detector output (face landmarks, pose
//! matrices, blendshapes, hand landmarks) into smoothed, camera-relative
//! transforms applied to a host scene graph, and manages everything around
//! that: camera acquisition with retry, asynchronous detector lifecycles,
//! performance-based downscaling, a pool of per-entity scene instances and
//! user-selectable filters.
//!
//! The host drives the pipeline cooperatively, two calls per frame:
//!
//! ```ignore
//! manager.update(now, &mut host);        // detect + reconcile
//! manager.prepare_render(&mut host);     // write transforms to the scene
//! ```
//!
//! Nothing in the per-frame path blocks; asynchronous work (camera,
//! detector creation, asset loads) is represented as [`pending::Pending`]
//! values polled each tick.

pub mod assets;
pub mod behaviours;
pub mod config;
pub mod detection;
pub mod detector;
pub mod error;
pub mod instance;
pub mod manager;
pub mod pending;
pub mod scene;
pub mod space;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{FilterAttributes, FilterConfig};
pub use error::{FacefilterError, Result};
pub use manager::{HostBindings, Notice, TrackingManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
