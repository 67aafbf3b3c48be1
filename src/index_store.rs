//! On-disk layout and atomic publication of per-subject index generations.
//!
//! ```text
//! <index.dir>/<login>/
//!     CURRENT            generation number of the published snapshot
//!     g<N>/vectors.bin   header + f32 matrix
//!     g<N>/meta.json     IndexMeta
//!     build.lock         present while a build runs
//! ```
//!
//! Publication writes `g<N>.tmp/`, fsyncs both files, renames the directory
//! to `g<N>/` and only then replaces `CURRENT` through a temp file and a
//! rename. A reader that follows `CURRENT` therefore always finds a complete
//! generation, and the loader cross-checks both files before accepting it.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use comment_harness_core::index::{IndexMeta, IndexSnapshot};

const CURRENT: &str = "CURRENT";
const LOCK: &str = "build.lock";
const VECTORS: &str = "vectors.bin";
const META: &str = "meta.json";

/// Reject logins that are not safe as a single path component.
pub fn validate_login(login: &str) -> Result<()> {
    let ok = !login.is_empty()
        && login.len() <= 64
        && login
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !ok {
        bail!("Invalid subject login: '{}'", login);
    }
    Ok(())
}

pub fn subject_dir(index_dir: &Path, login: &str) -> Result<PathBuf> {
    validate_login(login)?;
    Ok(index_dir.join(login.to_lowercase()))
}

fn generation_dir(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("g{}", generation))
}

/// The published generation, or `None` if nothing was ever published.
pub fn current_generation(dir: &Path) -> Result<Option<u64>> {
    let path = dir.join(CURRENT);
    match fs::read_to_string(&path) {
        Ok(s) => {
            let generation = s
                .trim()
                .parse::<u64>()
                .with_context(|| format!("Corrupt {}", path.display()))?;
            Ok(Some(generation))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Load one generation and verify its two artifacts agree.
pub fn load_generation(dir: &Path, generation: u64) -> Result<IndexSnapshot> {
    let gen_dir = generation_dir(dir, generation);
    let vectors_path = gen_dir.join(VECTORS);
    let meta_path = gen_dir.join(META);

    let bin = fs::read(&vectors_path)
        .with_context(|| format!("Failed to read {}", vectors_path.display()))?;
    let meta_text = fs::read_to_string(&meta_path)
        .with_context(|| format!("Failed to read {}", meta_path.display()))?;
    let meta: IndexMeta = serde_json::from_str(&meta_text)
        .with_context(|| format!("Failed to parse {}", meta_path.display()))?;

    let snapshot = IndexSnapshot::from_artifacts(&bin, meta)
        .with_context(|| format!("Rejected index generation {}", gen_dir.display()))?;
    if snapshot.generation() != generation {
        bail!(
            "{} holds generation {}, expected {}",
            gen_dir.display(),
            snapshot.generation(),
            generation
        );
    }
    Ok(snapshot)
}

/// Load the published snapshot, if any.
pub fn load_current(dir: &Path) -> Result<Option<IndexSnapshot>> {
    match current_generation(dir)? {
        Some(generation) => Ok(Some(load_generation(dir, generation)?)),
        None => Ok(None),
    }
}

/// Atomically publish `snapshot` as the subject's current generation.
pub fn publish(dir: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let generation = snapshot.generation();
    let final_dir = generation_dir(dir, generation);
    let tmp_dir = dir.join(format!("g{}.tmp", generation));

    if final_dir.exists() {
        if current_generation(dir)? == Some(generation) {
            bail!(
                "Generation {} is already published in {}",
                generation,
                dir.display()
            );
        }
        // Left behind by a publish that died before switching CURRENT.
        fs::remove_dir_all(&final_dir)?;
    }
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir)?;
    }
    fs::create_dir_all(&tmp_dir)?;

    write_synced(&tmp_dir.join(VECTORS), &snapshot.encode_vectors())?;
    let meta = serde_json::to_vec(&snapshot.meta())?;
    write_synced(&tmp_dir.join(META), &meta)?;
    sync_dir(&tmp_dir);

    fs::rename(&tmp_dir, &final_dir).with_context(|| {
        format!(
            "Failed to move {} to {}",
            tmp_dir.display(),
            final_dir.display()
        )
    })?;
    sync_dir(dir);

    let current_tmp = dir.join(format!("{}.tmp", CURRENT));
    write_synced(&current_tmp, generation.to_string().as_bytes())?;
    fs::rename(&current_tmp, dir.join(CURRENT))?;
    sync_dir(dir);

    Ok(())
}

/// Remove generations older than `keep_from` and leftover temp dirs.
///
/// Returns how many generations were deleted.
pub fn gc(dir: &Path, keep_from: u64) -> Result<usize> {
    let mut removed = 0;
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(rest) = name.strip_prefix('g') else {
            continue;
        };
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if rest.ends_with(".tmp") {
            fs::remove_dir_all(entry.path())?;
            continue;
        }
        if let Ok(generation) = rest.parse::<u64>() {
            if generation < keep_from {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Exclusive build permit for one subject, released on drop.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release build lock");
        }
    }
}

/// Try to take the subject's build lock. `Ok(None)` means another build
/// holds it.
///
/// The lock is a file created with `create_new`, so it also excludes
/// builds in other processes. A lock left by a crashed process must be
/// removed by hand.
pub fn try_lock(dir: &Path) -> Result<Option<BuildLock>> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(LOCK);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            Ok(Some(BuildLock { path }))
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to create {}", path.display())),
    }
}

pub fn is_locked(dir: &Path) -> bool {
    dir.join(LOCK).exists()
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn sync_dir(dir: &Path) {
    // Directory fsync is not available everywhere; the renames still apply.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comment_harness_core::index::IndexEntry;
    use tempfile::TempDir;

    fn snapshot(generation: u64, n: usize) -> IndexSnapshot {
        let rows = (0..n)
            .map(|i| {
                (
                    IndexEntry {
                        comment_id: format!("c{}", i),
                        session_id: 1,
                        offset_seconds: i as i64,
                        created_at: None,
                        snippet: String::new(),
                        body_hash: String::new(),
                    },
                    vec![i as f32, 1.0],
                )
            })
            .collect();
        IndexSnapshot::from_rows(generation, 2, "m", 0, rows).unwrap()
    }

    #[test]
    fn test_publish_and_load() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("alice");
        assert_eq!(current_generation(&dir).unwrap(), None);
        assert!(load_current(&dir).unwrap().is_none());

        publish(&dir, &snapshot(1, 3)).unwrap();
        assert_eq!(current_generation(&dir).unwrap(), Some(1));
        let loaded = load_current(&dir).unwrap().unwrap();
        assert_eq!(loaded, snapshot(1, 3));
        assert!(!dir.join("g1.tmp").exists());
    }

    #[test]
    fn test_republish_same_generation_fails() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("alice");
        publish(&dir, &snapshot(1, 1)).unwrap();
        assert!(publish(&dir, &snapshot(1, 2)).is_err());
        assert_eq!(load_current(&dir).unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_gc_keeps_previous_generation() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("alice");
        for g in 1..=3 {
            publish(&dir, &snapshot(g, 1)).unwrap();
        }
        fs::create_dir_all(dir.join("g9.tmp")).unwrap();
        assert_eq!(gc(&dir, 2).unwrap(), 1);
        assert!(!dir.join("g1").exists());
        assert!(dir.join("g2").exists());
        assert!(dir.join("g3").exists());
        assert!(!dir.join("g9.tmp").exists());
    }

    #[test]
    fn test_mismatched_artifacts_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("alice");
        publish(&dir, &snapshot(1, 2)).unwrap();
        publish(&dir, &snapshot(2, 3)).unwrap();
        // Splice generation 1's meta into generation 2.
        fs::copy(dir.join("g1").join(META), dir.join("g2").join(META)).unwrap();
        assert!(load_current(&dir).is_err());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("alice");
        let first = try_lock(&dir).unwrap();
        assert!(first.is_some());
        assert!(is_locked(&dir));
        assert!(try_lock(&dir).unwrap().is_none());
        drop(first);
        assert!(!is_locked(&dir));
        assert!(try_lock(&dir).unwrap().is_some());
    }

    #[test]
    fn test_login_validation() {
        assert!(validate_login("alice_01").is_ok());
        assert!(validate_login("../etc").is_err());
        assert!(validate_login("").is_err());
    }
}
