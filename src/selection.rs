//! Persisted bypass selection
//!
//! The selection is the set of application identifiers whose traffic should
//! skip the VPN. It is stored as a JSON array in `selection.json` under the
//! data directory and turned into UIDs by a [`UidResolver`] whenever rules
//! are applied.

use crate::core::error::Result;
use crate::utils::{get_data_dir, write_private_atomic};
use std::path::{Path, PathBuf};

const SELECTION_FILE: &str = "selection.json";

/// Maps an application identifier to the UID its traffic originates from
pub trait UidResolver {
    fn resolve(&self, app: &str) -> Option<u32>;
}

/// Resolves numeric identifiers as UIDs and anything else as a user account name
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUidResolver;

impl UidResolver for SystemUidResolver {
    fn resolve(&self, app: &str) -> Option<u32> {
        if let Ok(uid) = app.parse::<u32>() {
            return Some(uid);
        }
        match nix::unistd::User::from_name(app) {
            Ok(user) => user.map(|user| user.uid.as_raw()),
            Err(e) => {
                tracing::debug!(app, "User lookup failed: {e}");
                None
            }
        }
    }
}

/// Selected application identifiers, kept sorted and free of duplicates
pub struct SelectionStore {
    path: PathBuf,
}

impl SelectionStore {
    /// Store in the data directory
    pub fn new() -> std::io::Result<Self> {
        let dir = get_data_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "Data directory not found")
        })?;
        Ok(Self::at(dir.join(SELECTION_FILE)))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All selected identifiers; an absent file is an empty selection
    pub async fn get_all(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Adds `app`; returns whether it was newly inserted
    pub async fn insert(&self, app: &str) -> Result<bool> {
        let mut apps = self.get_all().await?;
        if apps.iter().any(|existing| existing == app) {
            return Ok(false);
        }
        apps.push(app.to_string());
        self.save(apps).await?;
        Ok(true)
    }

    /// Removes `app`; returns whether it was present
    pub async fn delete(&self, app: &str) -> Result<bool> {
        self.delete_all(&[app]).await.map(|removed| removed > 0)
    }

    /// Removes every identifier in `apps`, returning how many were present
    pub async fn delete_all(&self, apps: &[&str]) -> Result<usize> {
        let mut selection = self.get_all().await?;
        let before = selection.len();
        selection.retain(|existing| !apps.contains(&existing.as_str()));
        let removed = before - selection.len();
        if removed > 0 {
            self.save(selection).await?;
        }
        Ok(removed)
    }

    async fn save(&self, mut apps: Vec<String>) -> Result<()> {
        apps.sort();
        apps.dedup();
        let json = serde_json::to_string_pretty(&apps)?;
        write_private_atomic(&self.path, json.as_bytes()).await?;
        Ok(())
    }
}

/// Selection entries that resolved to a UID
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResolvedSelection {
    pub apps: Vec<(String, u32)>,
    /// Entries that no longer resolve and were removed from the store
    pub pruned: Vec<String>,
}

impl ResolvedSelection {
    /// UIDs in selection order
    pub fn uids(&self) -> Vec<u32> {
        self.apps.iter().map(|(_, uid)| *uid).collect()
    }
}

/// Resolves the whole selection, deleting entries `resolver` no longer knows
pub async fn resolve_and_prune(
    store: &SelectionStore,
    resolver: &impl UidResolver,
) -> Result<ResolvedSelection> {
    let mut resolved = ResolvedSelection::default();
    for app in store.get_all().await? {
        match resolver.resolve(&app) {
            Some(uid) => resolved.apps.push((app, uid)),
            None => resolved.pruned.push(app),
        }
    }

    if !resolved.pruned.is_empty() {
        let stale: Vec<&str> = resolved.pruned.iter().map(String::as_str).collect();
        store.delete_all(&stale).await?;
        tracing::info!(apps = ?resolved.pruned, "Removed unresolvable apps from selection");
    }
    Ok(resolved)
}
