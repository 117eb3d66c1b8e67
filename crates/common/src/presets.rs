// Cloudflared Tunnel Manager - Quick Tunnel Presets
// Saved name/URL templates for quick tunnels; no process association

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::network::validate_local_target;

/// Name/URL template for starting a quick tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuickTunnelPreset {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub built_in: bool,
}

impl QuickTunnelPreset {
    fn built_in(id: &str, name: &str, url: &str, details: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            details: details.to_string(),
            built_in: true,
        }
    }
}

/// Presets shipped with the application
pub fn built_in_presets() -> Vec<QuickTunnelPreset> {
    vec![
        QuickTunnelPreset::built_in("preset-react", "React", "http://localhost:3000", "React Development Server"),
        QuickTunnelPreset::built_in("preset-vue", "Vue.js", "http://localhost:8080", "Vue.js Development Server"),
        QuickTunnelPreset::built_in("preset-angular", "Angular", "http://localhost:4200", "Angular Development Server"),
        QuickTunnelPreset::built_in("preset-nextjs", "Next.js", "http://localhost:3000", "Next.js Development Server"),
        QuickTunnelPreset::built_in("preset-vite", "Vite", "http://localhost:5173", "Vite Development Server"),
        QuickTunnelPreset::built_in("preset-express", "Express.js", "http://localhost:8000", "Express.js Server"),
        QuickTunnelPreset::built_in("preset-django", "Django", "http://localhost:8000", "Django Development Server"),
        QuickTunnelPreset::built_in("preset-flask", "Flask", "http://localhost:5000", "Flask Development Server"),
        QuickTunnelPreset::built_in("preset-mamp", "MAMP", "http://localhost:8888", "MAMP Apache Server"),
        QuickTunnelPreset::built_in("preset-xampp", "XAMPP", "http://localhost:80", "XAMPP Apache Server"),
        QuickTunnelPreset::built_in("preset-generic", "Localhost", "http://localhost:8080", "Generic Local Server"),
    ]
}

/// Check user presets before replacing the stored list: names and URLs
/// present, URLs valid, names unique (case-insensitively)
pub fn validate_presets(presets: &[QuickTunnelPreset]) -> Result<()> {
    let mut names = std::collections::HashSet::new();
    for preset in presets.iter().filter(|p| !p.built_in) {
        if preset.name.trim().is_empty() || preset.url.trim().is_empty() {
            return Err(Error::Preset("Preset name and URL are required".to_string()));
        }
        validate_local_target(&preset.url)
            .map_err(|e| Error::Preset(format!("Preset '{}': {}", preset.name, e)))?;
        if !names.insert(preset.name.to_lowercase()) {
            return Err(Error::Preset(format!("Duplicate preset '{}'", preset.name)));
        }
    }
    Ok(())
}

/// User presets persisted in presets.json
#[derive(Debug, Clone)]
pub struct PresetStore {
    path: PathBuf,
}

impl PresetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load user presets. A missing or blank file is an empty list; an
    /// unreadable one is an error so callers never overwrite it.
    pub fn load_user(&self) -> Result<Vec<QuickTunnelPreset>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        let presets: Vec<QuickTunnelPreset> = serde_json::from_str(&contents).map_err(|e| {
            warn!("Failed to parse quick tunnel presets {}: {}", self.path.display(), e);
            e
        })?;
        Ok(presets.into_iter().filter(|p| !p.built_in).collect())
    }

    pub fn save_user(&self, presets: &[QuickTunnelPreset]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let user: Vec<&QuickTunnelPreset> = presets.iter().filter(|p| !p.built_in).collect();
        fs::write(&self.path, serde_json::to_string_pretty(&user)?)?;
        debug!("Saved {} user preset(s)", user.len());
        Ok(())
    }

    /// Built-in presets followed by user presets sorted by name
    pub fn all(&self) -> Result<Vec<QuickTunnelPreset>> {
        let mut user = self.load_user()?;
        user.sort_by_key(|p| p.name.to_lowercase());

        let mut all = built_in_presets();
        all.extend(user);
        Ok(all)
    }

    /// Add a user preset.
    ///
    /// Name and URL are trimmed; the URL needs a scheme and host, and neither
    /// may collide (case-insensitively) with an existing preset.
    pub fn add(&self, name: &str, url: &str, details: &str) -> Result<QuickTunnelPreset> {
        let name = name.trim();
        let url = url.trim();
        let details = details.trim();

        if name.is_empty() || url.is_empty() {
            return Err(Error::Preset("Preset name and URL are required".to_string()));
        }

        validate_local_target(url).map_err(|e| Error::Preset(e.to_string()))?;

        let mut user = self.load_user()?;
        let duplicate = built_in_presets().iter().chain(user.iter()).any(|p| {
            p.url.eq_ignore_ascii_case(url) || p.name.eq_ignore_ascii_case(name)
        });
        if duplicate {
            return Err(Error::Preset(format!(
                "A preset named '{}' or pointing at {} already exists",
                name, url
            )));
        }

        let preset = QuickTunnelPreset {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            url: url.to_string(),
            details: if details.is_empty() {
                "Custom preset".to_string()
            } else {
                details.to_string()
            },
            built_in: false,
        };

        user.push(preset.clone());
        self.save_user(&user)?;
        Ok(preset)
    }

    /// Remove a user preset by id or name; built-ins cannot be removed
    pub fn remove(&self, id_or_name: &str) -> Result<QuickTunnelPreset> {
        if built_in_presets()
            .iter()
            .any(|p| p.id == id_or_name || p.name.eq_ignore_ascii_case(id_or_name))
        {
            return Err(Error::Preset(format!(
                "Built-in preset '{}' cannot be removed",
                id_or_name
            )));
        }

        let mut user = self.load_user()?;
        let index = user
            .iter()
            .position(|p| p.id == id_or_name || p.name.eq_ignore_ascii_case(id_or_name))
            .ok_or_else(|| Error::Preset(format!("Preset '{}' not found", id_or_name)))?;

        let removed = user.remove(index);
        self.save_user(&user)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, PresetStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::new(dir.path().join("presets.json"));
        (dir, store)
    }

    #[test]
    fn test_all_lists_built_ins_then_sorted_user_presets() {
        let (_dir, store) = store();
        store.add("zeta", "http://localhost:9001", "").unwrap();
        store.add("Alpha", "http://localhost:9002", "api").unwrap();

        let all = store.all().unwrap();
        let built_in_count = built_in_presets().len();
        assert_eq!(all.len(), built_in_count + 2);
        assert!(all[..built_in_count].iter().all(|p| p.built_in));
        assert_eq!(all[built_in_count].name, "Alpha");
        assert_eq!(all[built_in_count + 1].name, "zeta");
        assert_eq!(all[built_in_count + 1].details, "Custom preset");
    }

    #[test]
    fn test_add_rejects_duplicates_and_invalid_urls() {
        let (_dir, store) = store();

        // Duplicate of a built-in URL
        assert!(store.add("Mine", "HTTP://LOCALHOST:3000", "").is_err());
        // Duplicate of a built-in name
        assert!(store.add("react", "http://localhost:3999", "").is_err());
        // Missing scheme
        assert!(store.add("NoScheme", "localhost:3999", "").is_err());
        // Empty
        assert!(store.add("  ", "http://localhost:3999", "").is_err());

        store.add("Docs", "http://localhost:3999", "").unwrap();
        assert!(store.add("docs", "http://localhost:4000", "").is_err());
    }

    #[test]
    fn test_remove_user_preset_only() {
        let (_dir, store) = store();
        let preset = store.add("Docs", "http://localhost:3999", "").unwrap();

        assert!(store.remove("preset-react").is_err());
        assert!(store.remove("React").is_err());

        let removed = store.remove(&preset.id).unwrap();
        assert_eq!(removed.name, "Docs");
        assert!(store.load_user().unwrap().is_empty());
        assert!(store.remove("Docs").is_err());
    }

    #[test]
    fn test_corrupt_file_is_never_overwritten() {
        let (_dir, store) = store();
        let corrupt = r#"[{"id": "a", "name": "Mine", "url": "http://localhost:3999"},]"#;
        fs::write(store.path(), corrupt).unwrap();

        assert!(matches!(store.load_user(), Err(Error::Serialization(_))));
        assert!(store.all().is_err());
        assert!(store.add("Other", "http://localhost:4001", "").is_err());
        assert!(store.remove("Mine").is_err());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), corrupt);
    }

    #[test]
    fn test_validate_presets() {
        let preset = |name: &str, url: &str| QuickTunnelPreset {
            id: name.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            details: String::new(),
            built_in: false,
        };

        assert!(validate_presets(&[preset("Docs", "http://localhost:3999")]).is_ok());
        assert!(validate_presets(&[preset("Docs", "localhost:3999")]).is_err());
        assert!(validate_presets(&[
            preset("Docs", "http://localhost:3999"),
            preset("docs", "http://localhost:4000"),
        ])
        .is_err());
    }

    #[test]
    fn test_blank_file_is_empty() {
        let (_dir, store) = store();
        fs::write(store.path(), "\n").unwrap();
        assert!(store.load_user().unwrap().is_empty());
    }
}
