//! Durable registry of deployed artifacts, one JSON file per destination.

use std::{
    collections::BTreeMap,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use derive_more::{Deref, DerefMut, From};
use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{DeployError, Destination, Network, error::Result};

/// Artifact name to deployed value for a single network.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deref, DerefMut, From,
)]
#[serde(transparent)]
pub struct ArtifactMap(BTreeMap<String, String>);

impl<'de> Deserialize<'de> for ArtifactMap {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Older registries stored chain ids and ports as JSON numbers.
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Ok(Self(
            raw.into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect(),
        ))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ArtifactMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Deployed artifacts for every network of one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref, DerefMut, From)]
#[serde(transparent)]
pub struct DeployedState(BTreeMap<String, ArtifactMap>);

impl DeployedState {
    /// The network's artifacts, empty if nothing was deployed yet.
    pub fn network(&self, network: Network) -> ArtifactMap {
        self.0.get(network.as_ref()).cloned().unwrap_or_default()
    }

    /// Record a value, overwriting any previous one.
    pub fn record(&mut self, network: Network, name: impl Into<String>, value: impl Into<String>) {
        self.0
            .entry(network.to_string())
            .or_default()
            .insert(name.into(), value.into());
    }
}

/// Exclusive claim on a destination's registry for the duration of a run.
///
/// Released when dropped.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release state lock");
        }
    }
}

/// Loads and saves [`DeployedState`] under a directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Backing file of a destination.
    pub fn path(&self, destination: Destination) -> PathBuf {
        self.dir.join(format!("deployed.{destination}.json"))
    }

    fn lock_path(&self, destination: Destination) -> PathBuf {
        self.dir.join(format!("deployed.{destination}.lock"))
    }

    /// Load the registry. Returns an empty state on first run.
    pub fn load(&self, destination: Destination) -> Result<DeployedState> {
        let path = self.path(destination);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No deployed state yet, starting empty");
            return Ok(DeployedState::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read deployed state from {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(DeployedState::default());
        }

        let state: DeployedState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse deployed state {}", path.display()))?;
        tracing::debug!(path = %path.display(), networks = state.len(), "Deployed state loaded");
        Ok(state)
    }

    /// Overwrite the registry atomically (temp file in the same directory, then rename).
    pub fn save(&self, destination: Destination, state: &DeployedState) -> Result<()> {
        let path = self.path(destination);
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory {}", self.dir.display()))?;

        let json =
            serde_json::to_string_pretty(state).context("Failed to serialize deployed state")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .context("Failed to create temporary state file")?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.write_all(b"\n"))
            .and_then(|_| tmp.as_file().sync_all())
            .context("Failed to write temporary state file")?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace deployed state {}", path.display()))?;

        tracing::trace!(path = %path.display(), "Deployed state saved");
        Ok(())
    }

    /// Take the destination's run lock, failing if another run holds it.
    pub fn lock(&self, destination: Destination) -> Result<StateLock> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory {}", self.dir.display()))?;
        let path = self.lock_path(destination);
        let file = File::create(&path)
            .with_context(|| format!("Failed to open state lock {}", path.display()))?;

        file.try_lock_exclusive().map_err(|_| {
            DeployError::validation(format!(
                "Another deployment against destination {destination} is running (lock held on {})",
                path.display()
            ))
        })?;

        Ok(StateLock { file, path })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
