//! Content-fingerprint caching.
//!
//! A target with cache patterns skips its body when nothing it reads has
//! changed: the orchestrator fingerprints the matching files (path plus
//! content, hashed together with the target identity) and compares
//! against the last recorded success. The store is pluggable; the default
//! persists a JSON manifest in the user cache directory, written
//! atomically. Store failures are never fatal — the orchestrator logs
//! them and treats the lookup as a miss.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Result, TargError};

/// Last-success fingerprints, keyed by target identity.
pub trait FingerprintStore: Send + Sync {
    /// The fingerprint of the last recorded success, if any.
    fn lookup(&self, key: &str) -> Result<Option<String>>;

    /// Record a successful run.
    fn store(&self, key: &str, fingerprint: &str) -> Result<()>;
}

/// Compute the content fingerprint for a target: a stable hash over the
/// target identity and every file under `root` matching the patterns
/// (relative path and contents, in sorted path order).
pub fn fingerprint(root: &Path, identity: &str, patterns: &[String]) -> Result<String> {
    let matcher = build_globset(patterns)?;

    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            TargError::cache(format!("failed to walk {}", root.display()), e)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or_else(|_| entry.path());
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if matcher.is_match(&rel_str) {
            files.push((rel_str, entry.path().to_path_buf()));
        }
    }
    files.sort();

    // SipHash with fixed keys: deterministic across runs of one binary.
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    identity.hash(&mut hasher);
    for (rel, path) in &files {
        rel.hash(&mut hasher);
        let contents = std::fs::read(path)
            .map_err(|e| TargError::cache(format!("failed to read {}", path.display()), e))?;
        contents.hash(&mut hasher);
    }
    Ok(format!("{:016x}", hasher.finish()))
}

/// Build a matcher from the target's glob patterns.
pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| TargError::InvalidArgument {
            name: "pattern".to_string(),
            reason: format!("bad glob '{pattern}': {e}"),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| TargError::InvalidArgument {
        name: "pattern".to_string(),
        reason: e.to_string(),
    })
}

/// On-disk manifest shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    fingerprints: BTreeMap<String, String>,
}

/// JSON-file store under the user cache directory (or any explicit path).
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<Option<Manifest>>,
}

impl JsonFileStore {
    /// Store backed by an explicit manifest path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(None),
        }
    }

    /// The per-user default manifest location.
    #[must_use]
    pub fn default_location() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "targ")
            .map(|dirs| dirs.cache_dir().join("fingerprints.json"))
    }

    fn load(&self) -> Result<Manifest> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                TargError::cache(format!("corrupt manifest {}", self.path.display()), e)
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(TargError::cache(
                format!("failed to read {}", self.path.display()),
                e,
            )),
        }
    }

    fn write(&self, manifest: &Manifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest).map_err(|e| {
            TargError::cache("failed to encode fingerprint manifest".to_string(), e)
        })?;
        atomic_write(&self.path, &bytes)
    }
}

impl FingerprintStore for JsonFileStore {
    fn lookup(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(self.load()?);
        }
        Ok(state
            .as_ref()
            .and_then(|m| m.fingerprints.get(key).cloned()))
    }

    fn store(&self, key: &str, fingerprint: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(self.load()?);
        }
        let manifest = state.as_mut().expect("loaded above");
        manifest
            .fingerprints
            .insert(key.to_string(), fingerprint.to_string());
        self.write(manifest)
    }
}

/// In-memory store for tests and embedders that do not want persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintStore for MemoryStore {
    fn lookup(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn store(&self, key: &str, fingerprint: &str) -> Result<()> {
        self.map
            .lock()
            .insert(key.to_string(), fingerprint.to_string());
        Ok(())
    }
}

/// Write via a temp file in the target directory and rename into place,
/// so a crash never leaves a half-written manifest.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| TargError::InvalidArgument {
        name: "path".to_string(),
        reason: format!("no parent directory for {}", path.display()),
    })?;
    if !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|e| {
            TargError::cache(format!("failed to create {}", parent.display()), e)
        })?;
    }
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        TargError::cache(format!("failed to create temp file in {}", parent.display()), e)
    })?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.flush())
        .map_err(|e| TargError::cache(format!("failed to write {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| TargError::cache(format!("failed to persist {}", path.display()), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_fingerprint_stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "src/main.rs", "fn main() {}");
        write_file(dir.path(), "src/lib.rs", "pub fn lib() {}");
        write_file(dir.path(), "README.md", "ignored");

        let patterns = vec!["src/**/*.rs".to_string()];
        let a = fingerprint(dir.path(), "build", &patterns).unwrap();
        let b = fingerprint(dir.path(), "build", &patterns).unwrap();
        assert_eq!(a, b);

        write_file(dir.path(), "src/main.rs", "fn main() { println!(); }");
        let c = fingerprint(dir.path(), "build", &patterns).unwrap();
        assert_ne!(a, c);

        // Non-matching files do not contribute.
        write_file(dir.path(), "README.md", "changed");
        let d = fingerprint(dir.path(), "build", &patterns).unwrap();
        assert_eq!(c, d);
    }

    #[test]
    fn test_fingerprint_includes_identity() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", "same");
        let patterns = vec!["*.txt".to_string()];
        let a = fingerprint(dir.path(), "build", &patterns).unwrap();
        let b = fingerprint(dir.path(), "test", &patterns).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bad_glob_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = fingerprint(dir.path(), "x", &["[".to_string()]).unwrap_err();
        assert!(matches!(err, TargError::InvalidArgument { .. }));
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("fingerprints.json");
        let store = JsonFileStore::new(path.clone());

        assert_eq!(store.lookup("build").unwrap(), None);
        store.store("build", "abc123").unwrap();
        assert_eq!(store.lookup("build").unwrap().as_deref(), Some("abc123"));

        // A fresh store instance reads the persisted manifest.
        let fresh = JsonFileStore::new(path);
        assert_eq!(fresh.lookup("build").unwrap().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_corrupt_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fingerprints.json");
        std::fs::write(&path, "not json").unwrap();
        let store = JsonFileStore::new(path);
        assert!(matches!(
            store.lookup("build"),
            Err(TargError::CacheIo { .. })
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.store("k", "v").unwrap();
        assert_eq!(store.lookup("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.lookup("other").unwrap(), None);
    }
}
