//! Policy directory watcher.
//!
//! Each `<policy_set>.json` file in the watched directory is one bundle. A
//! [`notify`] watcher forwards create/modify events to a background thread
//! that parses the file and hands a [`PolicyUpdate`] to the async side.
//! Unparseable files are logged and dropped; the live snapshot is untouched.

use std::path::{Path, PathBuf};

use anyhow::Context;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::PolicyBundle;

/// A parsed bundle file.
#[derive(Debug, Clone)]
pub struct PolicyUpdate {
    /// Policy set, taken from the file stem.
    pub policy_set: String,
    /// Parsed bundle.
    pub bundle: PolicyBundle,
    /// Source file.
    pub path: PathBuf,
}

/// Keeps the filesystem watcher alive.
pub struct PolicyWatcher {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for PolicyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyWatcher")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl PolicyWatcher {
    /// Start watching `dir`. Dropping the watcher stops notifications and
    /// closes the returned channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist or cannot be watched.
    pub fn start(dir: &Path) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<PolicyUpdate>)> {
        if !dir.is_dir() {
            anyhow::bail!("policy directory {} does not exist", dir.display());
        }

        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<PathBuf>();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| match event {
                Ok(evt) if matches!(evt.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
                    for path in evt.paths {
                        if let Err(e) = raw_tx.send(path) {
                            warn!(error = %e, "failed to send policy watcher event");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "policy watcher error"),
            })
            .context("failed to create policy watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        std::thread::spawn(move || {
            while let Ok(path) = raw_rx.recv() {
                if !path.exists() {
                    continue;
                }
                match read_update(&path) {
                    Ok(Some(update)) => {
                        debug!(policy_set = %update.policy_set, "policy file changed");
                        if tx.send(update).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "ignoring unreadable policy file");
                    }
                }
            }
        });

        info!(dir = %dir.display(), "policy watcher started");
        Ok((
            Self {
                dir: dir.to_path_buf(),
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// Watched directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Policy set name for a bundle file, or `None` if it is not `*.json`.
pub fn policy_set_for(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Parse one bundle file. `Ok(None)` for files that are not bundles.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn read_update(path: &Path) -> anyhow::Result<Option<PolicyUpdate>> {
    let Some(policy_set) = policy_set_for(path) else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let bundle = PolicyBundle::from_json(&text)
        .with_context(|| format!("failed to parse policy bundle {}", path.display()))?;
    Ok(Some(PolicyUpdate {
        policy_set,
        bundle,
        path: path.to_path_buf(),
    }))
}

/// Parse every bundle file currently in `dir`, sorted by policy set.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed. Individual bad files
/// are logged and skipped.
pub fn load_dir(dir: &Path) -> anyhow::Result<Vec<PolicyUpdate>> {
    let mut updates = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        match read_update(&path) {
            Ok(Some(update)) => updates.push(update),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping policy file"),
        }
    }
    updates.sort_by(|a, b| a.policy_set.cmp(&b.policy_set));
    Ok(updates)
}
