//! Asset and texture loading over the host loader.
//!
//! Loads resolve asynchronously and are polled per tick. Two patterns live
//! here: `AssetReference` for instantiable 3D assets (load once, keep the
//! handle for the session) and `TextureSlot` for replaceable textures,
//! where rapid re-assignment must resolve last-write-wins.

use crate::pending::{Pending, PendingPoll};
use crate::scene::{AssetHandle, TextureHandle};

/// Host-side loader for instantiable assets (glTF etc.). A `None`
/// resolution means the load failed.
pub trait AssetLoader {
    fn load(&mut self, url: &str) -> Pending<Option<AssetHandle>>;
}

/// Host-side loader for textures.
pub trait TextureLoader {
    fn load_texture(&mut self, url: &str) -> Pending<Option<TextureHandle>>;
}

enum ReferenceState {
    Unloaded { url: String },
    Loading { url: String, pending: Pending<Option<AssetHandle>> },
    Loaded(AssetHandle),
    Failed { url: String },
}

/// A lazily loaded asset identified by URL.
///
/// The reference loads at most once; a failed load is terminal for the
/// session. References constructed from an already-loaded handle skip the
/// loader entirely.
pub struct AssetReference {
    state: ReferenceState,
}

impl AssetReference {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            state: ReferenceState::Unloaded { url: url.into() },
        }
    }

    pub fn from_handle(handle: AssetHandle) -> Self {
        Self {
            state: ReferenceState::Loaded(handle),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.state {
            ReferenceState::Unloaded { url }
            | ReferenceState::Loading { url, .. }
            | ReferenceState::Failed { url } => Some(url),
            ReferenceState::Loaded(_) => None,
        }
    }

    /// Kick off the load if it has not started. Idempotent; calling this
    /// every tick is fine.
    pub fn ensure_loading(&mut self, loader: &mut dyn AssetLoader) {
        if let ReferenceState::Unloaded { url } = &self.state {
            let url = url.clone();
            tracing::debug!(%url, "loading asset");
            let pending = loader.load(&url);
            self.state = ReferenceState::Loading { url, pending };
        }
    }

    /// Advance an in-flight load. Returns the handle once available.
    pub fn poll(&mut self) -> Option<AssetHandle> {
        if let ReferenceState::Loading { url, pending } = &mut self.state {
            match pending.poll() {
                PendingPoll::InFlight => {}
                PendingPoll::Resolved(Some(handle)) => {
                    tracing::debug!(%url, "asset loaded");
                    self.state = ReferenceState::Loaded(handle);
                }
                PendingPoll::Resolved(None) | PendingPoll::Dropped => {
                    tracing::warn!(%url, "asset load failed");
                    let url = url.clone();
                    self.state = ReferenceState::Failed { url };
                }
            }
        }
        self.handle()
    }

    pub fn handle(&self) -> Option<AssetHandle> {
        match self.state {
            ReferenceState::Loaded(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, ReferenceState::Failed { .. })
    }
}

/// A texture binding that can be re-assigned at any time.
///
/// Each `request` bumps a generation token; in-flight loads whose token no
/// longer matches the latest request are dropped on resolution so an old
/// slow load can never overwrite a newer assignment.
pub struct TextureSlot {
    current: Option<TextureHandle>,
    generation: u64,
    in_flight: Vec<(u64, String, Pending<Option<TextureHandle>>)>,
}

impl TextureSlot {
    pub fn new() -> Self {
        Self {
            current: None,
            generation: 0,
            in_flight: Vec::new(),
        }
    }

    /// Current texture, if any resolved load has been accepted.
    pub fn current(&self) -> Option<TextureHandle> {
        self.current
    }

    /// Assign a new texture by URL. The previous texture stays bound until
    /// the new one resolves.
    pub fn request(&mut self, url: &str, loader: &mut dyn TextureLoader) {
        self.generation += 1;
        let pending = loader.load_texture(url);
        self.in_flight.push((self.generation, url.to_owned(), pending));
    }

    /// Bind an already-loaded texture, superseding any in-flight loads.
    pub fn set(&mut self, handle: Option<TextureHandle>) {
        self.generation += 1;
        self.current = handle;
    }

    /// Poll in-flight loads. Returns true when the bound texture changed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        let latest = self.generation;
        let mut still_pending = Vec::new();
        for (token, url, mut pending) in self.in_flight.drain(..) {
            match pending.poll() {
                PendingPoll::InFlight => still_pending.push((token, url, pending)),
                PendingPoll::Resolved(Some(handle)) => {
                    if token == latest {
                        self.current = Some(handle);
                        changed = true;
                    } else {
                        tracing::debug!(%url, "discarding stale texture load");
                    }
                }
                PendingPoll::Resolved(None) | PendingPoll::Dropped => {
                    // Failure keeps whatever texture was bound before.
                    tracing::warn!(%url, "texture load failed");
                }
            }
        }
        self.in_flight = still_pending;
        changed
    }
}

impl Default for TextureSlot {
    fn default() -> Self {
        Self::new()
    }
}
