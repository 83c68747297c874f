//! Mesh-distribution adapter for modvault.
//!
//! The embedded peer-to-peer engine is consumed strictly through the
//! [`MeshEngine`] capability trait; when no engine is linked, the null
//! implementation makes every optimized path fall back to the traditional
//! fetch. The [`CacheOptimizer`] is the public face: it races distributed
//! downloads against provider fetches, verifies integrity before promoting
//! files, re-shares completed downloads in the background, and owns the
//! per-content locks and the compliance blocklist.

#![deny(unsafe_code)]

pub mod descriptor;
pub mod engine;
pub mod locks;
pub mod netport;
pub mod optimizer;

// ============================================================================
// Public API
// ============================================================================

pub use descriptor::{Descriptor, DistributionBuilder, DistributionPayload, InfoHash};
pub use engine::{
    MeshEngine, MeshEngineSettings, MeshSession, NullMeshEngine, SessionState, SessionStats,
};
pub use locks::{Blocklist, ContentKeyGuard, ContentKeyLocks};
pub use netport::select_listen_port;
pub use optimizer::{CacheOptimizer, CacheOptimizerConfig, NetworkCacheStats};
