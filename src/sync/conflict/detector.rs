//! Divergence detection for content mirrors
//!
//! Files are compared by streaming SHA-256 digests. The source tree is
//! authoritative: anything missing, different, or absent upstream counts as
//! divergence.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Read size for streaming digests
pub const DIGEST_CHUNK_SIZE: usize = 8192;

/// Types of divergence between a mirror and its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceType {
    /// Present upstream, absent locally
    Missing,
    /// Present on both sides with different digests
    ContentMismatch,
    /// Present locally, gone upstream
    Extra,
}

/// One diverged file, relative to the tree roots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub path: PathBuf,
    pub divergence_type: DivergenceType,
}

/// Hex SHA-256 of a file, read in fixed-size chunks
pub fn compute_file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; DIGEST_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether two files differ by digest
pub fn files_diverge(local: &Path, remote: &Path) -> io::Result<bool> {
    if !local.exists() {
        return Ok(true);
    }
    Ok(compute_file_digest(local)? != compute_file_digest(remote)?)
}

/// Compares a local tree against an authoritative source tree
#[derive(Debug, Clone)]
pub struct DivergenceDetector {
    /// Also report local files that no longer exist upstream
    report_extra: bool,
}

impl Default for DivergenceDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DivergenceDetector {
    pub fn new() -> Self {
        Self { report_extra: true }
    }

    pub fn with_extra(mut self, report_extra: bool) -> Self {
        self.report_extra = report_extra;
        self
    }

    /// List every divergence between `source` and `target`.
    ///
    /// A single file source is compared with a single file target.
    pub fn detect(&self, source: &Path, target: &Path) -> io::Result<Vec<Divergence>> {
        if source.is_file() {
            return Ok(if files_diverge(target, source)? {
                vec![Divergence {
                    path: PathBuf::new(),
                    divergence_type: if target.exists() {
                        DivergenceType::ContentMismatch
                    } else {
                        DivergenceType::Missing
                    },
                }]
            } else {
                Vec::new()
            });
        }

        let upstream = list_files(source)?;
        let local = if target.is_dir() {
            list_files(target)?
        } else {
            BTreeSet::new()
        };

        let mut divergences = Vec::new();
        for rel in &upstream {
            let local_path = target.join(rel);
            if !local.contains(rel) {
                divergences.push(Divergence {
                    path: rel.clone(),
                    divergence_type: DivergenceType::Missing,
                });
            } else if compute_file_digest(&local_path)? != compute_file_digest(&source.join(rel))? {
                divergences.push(Divergence {
                    path: rel.clone(),
                    divergence_type: DivergenceType::ContentMismatch,
                });
            }
        }

        if self.report_extra {
            divergences.extend(local.difference(&upstream).map(|rel| Divergence {
                path: rel.clone(),
                divergence_type: DivergenceType::Extra,
            }));
        }

        Ok(divergences)
    }
}

/// Relative paths of all regular files under `root`
fn list_files(root: &Path) -> io::Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    files.insert(rel.to_path_buf());
                }
            }
        }
    }

    Ok(files)
}
