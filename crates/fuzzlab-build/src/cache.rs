use anyhow::Result;
use fuzzlab_core::{atomic_write_bytes, sha256_tree, ArtifactId};
use std::fs;
use std::path::{Path, PathBuf};

/// Build stamps keyed by artifact identity. A stamp records the digest of the
/// inputs the artifact was last built from.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn stamp_path(&self, artifact: &ArtifactId) -> PathBuf {
        self.dir.join(format!("{}.digest", artifact.cache_key()))
    }

    pub fn digest(&self, context: &Path, parent: Option<&str>) -> Result<String> {
        sha256_tree(context, parent)
    }

    pub fn stored(&self, artifact: &ArtifactId) -> Option<String> {
        fs::read_to_string(self.stamp_path(artifact))
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn is_fresh(&self, artifact: &ArtifactId, digest: &str) -> bool {
        self.stored(artifact).as_deref() == Some(digest)
    }

    pub fn record(&self, artifact: &ArtifactId, digest: &str) -> Result<()> {
        atomic_write_bytes(&self.stamp_path(artifact), digest.as_bytes())
    }

    pub fn invalidate(&self, artifact: &ArtifactId) {
        let _ = fs::remove_file(self.stamp_path(artifact));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_per_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ArtifactCache::new(dir.path());
        let a = ArtifactId::fuzzer("libpng", "afl");
        let b = ArtifactId::fuzzer("libxml2", "afl");

        assert!(!cache.is_fresh(&a, "sha256:1"));
        cache.record(&a, "sha256:1").expect("record");
        assert!(cache.is_fresh(&a, "sha256:1"));
        assert!(!cache.is_fresh(&a, "sha256:2"));
        assert!(!cache.is_fresh(&b, "sha256:1"));

        cache.invalidate(&a);
        assert_eq!(cache.stored(&a), None);
    }
}
