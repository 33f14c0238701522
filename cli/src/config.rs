// Profile document management for the overmesh CLI
//
// Cross-platform profile documents stored in:
// - macOS: ~/.config/overmesh/profiles.json
// - Linux: ~/.config/overmesh/profiles.json
// - Windows: %APPDATA%\overmesh\profiles.json

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Handle to one profile document on disk.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("overmesh");

        std::fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Default location of the profile document
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("profiles.json"))
    }

    /// Open a store at an explicit path, or at the default location.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::default_path()?,
        };
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a starter document. Refuses to clobber an existing one.
    pub fn init(&self) -> Result<()> {
        if self.path.exists() {
            bail!("Profile document already exists at {}", self.path.display());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create profile directory")?;
        }
        std::fs::write(&self.path, starter_document()?)
            .context("Failed to write profile document")?;
        Ok(())
    }

    /// Read the raw document, ready to hand to a join call.
    pub fn read(&self) -> Result<String> {
        std::fs::read_to_string(&self.path).with_context(|| {
            format!("Failed to read profile document at {}", self.path.display())
        })
    }

    /// Selector names defined in the document, sorted.
    pub fn selectors(&self) -> Result<Vec<String>> {
        let document = self.read()?;
        let parsed: serde_json::Value =
            serde_json::from_str(&document).context("Profile document is not valid JSON")?;
        let profiles = parsed
            .get("profiles")
            .and_then(|value| value.as_object())
            .context("Profile document has no profiles table")?;
        let mut names: Vec<String> = profiles.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Starter document with a relaxed and a strict profile. The node id is
/// generated once here so the identity survives restarts.
pub fn starter_document() -> Result<String> {
    let node_id = format!("node-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let document = serde_json::json!({
        "profiles": {
            "default": {
                "node_id": node_id,
                "network_name": "overmesh-demo",
                "neighbor_query_interval_secs": 5
            },
            "strict": {
                "node_id": node_id,
                "network_name": "overmesh-demo",
                "neighbor_query_interval_secs": 5,
                "send_policy": "strict"
            }
        }
    });
    serde_json::to_string_pretty(&document).context("Failed to serialize starter document")
}
