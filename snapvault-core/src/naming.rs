/*!
Compression-aware snapshot name resolution.

A snapshot requested as `etcd.db` may be stored as `etcd.db.zst`,
`etcd.db.gz`, or any other compressed variant, or raw. [`NameResolver`]
expands a raw name into every way it could be stored, in a fixed preference
order, and probes a store until one of them exists.
*/

use tracing::debug;

use crate::compression::{is_compressed, CompressionAlgorithm};
use crate::record::RAW_SUFFIX;
use crate::{Result, SnapvaultError};

/// Outcome of probing a store for a snapshot name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The first candidate that exists
    Found(String),
    /// No candidate exists; every one of `tried` was probed
    NotFound { requested: String, tried: Vec<String> },
}

impl Resolution {
    /// Resolved name, if any
    pub fn found(&self) -> Option<&str> {
        match self {
            Resolution::Found(name) => Some(name),
            Resolution::NotFound { .. } => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }

    /// Turn a miss into [`SnapvaultError::SnapshotNotFound`]
    pub fn into_result(self) -> Result<String> {
        match self {
            Resolution::Found(name) => Ok(name),
            Resolution::NotFound { requested, tried } => {
                Err(SnapvaultError::SnapshotNotFound { requested, tried })
            }
        }
    }
}

/// Generates and probes compression variants of a snapshot name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameResolver {
    default_algorithm: CompressionAlgorithm,
}

impl NameResolver {
    /// Resolver that prefers `default_algorithm`'s variant
    ///
    /// With `CompressionAlgorithm::None` the fixed order zstd, gzip, lz4,
    /// bzip2 applies unchanged.
    pub fn new(default_algorithm: CompressionAlgorithm) -> Self {
        Self { default_algorithm }
    }

    pub fn default_algorithm(&self) -> CompressionAlgorithm {
        self.default_algorithm
    }

    /// Compressed algorithms in probe order, default first
    pub fn priority(&self) -> Vec<CompressionAlgorithm> {
        let mut order = Vec::with_capacity(CompressionAlgorithm::COMPRESSED.len());
        if !self.default_algorithm.is_none() {
            order.push(self.default_algorithm);
        }
        order.extend(
            CompressionAlgorithm::COMPRESSED
                .into_iter()
                .filter(|algorithm| *algorithm != self.default_algorithm),
        );
        order
    }

    /// Every name `name` might be stored under, most preferred first
    ///
    /// - already compressed: `[name]`
    /// - ends with `.db`: each compressed variant, then `name` itself
    /// - anything else: `[name]`
    pub fn candidates(&self, name: &str) -> Vec<String> {
        if is_compressed(name) || !name.ends_with(RAW_SUFFIX) {
            return vec![name.to_string()];
        }

        let mut candidates: Vec<String> = self
            .priority()
            .into_iter()
            .map(|algorithm| format!("{name}{}", algorithm.suffix()))
            .collect();
        candidates.push(name.to_string());
        candidates
    }

    /// Probe candidates in order and return the first that exists
    ///
    /// Probing stops at the first hit. A failing probe aborts resolution and
    /// its error is returned unchanged.
    pub fn resolve<F>(&self, name: &str, mut exists: F) -> Result<Resolution>
    where
        F: FnMut(&str) -> Result<bool>,
    {
        let candidates = self.candidates(name);

        for candidate in &candidates {
            if exists(candidate)? {
                debug!(requested = %name, resolved = %candidate, "Resolved snapshot name");
                return Ok(Resolution::Found(candidate.clone()));
            }
        }

        debug!(requested = %name, tried = candidates.len(), "No snapshot candidate exists");
        Ok(Resolution::NotFound {
            requested: name.to_string(),
            tried: candidates,
        })
    }
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new(CompressionAlgorithm::default())
    }
}

/// Resolve `name` with the default resolver
///
/// Returns the resolved name and whether it was found; on a miss the
/// requested name is returned unchanged.
pub fn resolve_candidate<F>(name: &str, exists: F) -> Result<(String, bool)>
where
    F: FnMut(&str) -> Result<bool>,
{
    match NameResolver::default().resolve(name, exists)? {
        Resolution::Found(resolved) => Ok((resolved, true)),
        Resolution::NotFound { requested, .. } => Ok((requested, false)),
    }
}
