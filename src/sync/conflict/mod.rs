//! Divergence detection and conflict resolution
//!
//! Provides:
//! - SHA-256 digest comparison between a source tree and a mirror
//! - Forced refresh of git mirrors against their remote
//! - File-level repair of content mirrors

mod detector;
mod resolver;

pub use detector::{
    compute_file_digest, files_diverge, Divergence, DivergenceDetector, DivergenceType,
    DIGEST_CHUNK_SIZE,
};
pub use resolver::{is_git_mirror, ConflictResolver, Resolution, ResolutionStrategy};
