// Cloudflared Tunnel Manager - Tunnel Store Module
// Persistence of managed tunnel definitions (JSON array in tunnels.json)

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ManagedTunnelDefinition;
use crate::error::{Error, Result};

/// Reads and writes the managed tunnel definitions file
#[derive(Debug, Clone)]
pub struct TunnelStore {
    path: PathBuf,
}

impl TunnelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all definitions; a missing file is an empty list
    pub fn load_all(&self) -> Result<Vec<ManagedTunnelDefinition>> {
        if !self.path.exists() {
            debug!("Tunnel store does not exist: {}", self.path.display());
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        let definitions: Vec<ManagedTunnelDefinition> = serde_json::from_str(&contents)?;

        let mut seen = std::collections::HashSet::new();
        let mut unique = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if seen.insert(definition.id) {
                unique.push(definition);
            } else {
                warn!(
                    "Skipping duplicate tunnel definition {} in {}",
                    definition.id,
                    self.path.display()
                );
            }
        }

        debug!("Loaded {} tunnel definition(s)", unique.len());
        Ok(unique)
    }

    /// Replace the stored definitions, writing through a temp file
    pub fn save_all(&self, definitions: &[ManagedTunnelDefinition]) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::InvalidPath(self.path.display().to_string()))?;
        fs::create_dir_all(parent)?;

        let json = serde_json::to_string_pretty(definitions)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!(
            "Saved {} tunnel definition(s) to {}",
            definitions.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Find a definition by name
    pub fn find_by_name(&self, name: &str) -> Result<ManagedTunnelDefinition> {
        self.load_all()?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::TunnelNotFound(name.to_string()))
    }

    /// Find a definition by id
    pub fn find_by_id(&self, id: &Uuid) -> Result<ManagedTunnelDefinition> {
        self.load_all()?
            .into_iter()
            .find(|d| d.id == *id)
            .ok_or_else(|| Error::TunnelNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_definition(name: &str) -> ManagedTunnelDefinition {
        ManagedTunnelDefinition::new(
            name,
            Some(format!("{}.example.com", name)),
            format!("/tmp/{}.yml", name),
            "http://localhost:8888",
        )
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TunnelStore::new(dir.path().join("tunnels.json"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = TunnelStore::new(dir.path().join("nested").join("tunnels.json"));

        let defs = vec![create_test_definition("zeta"), create_test_definition("alpha")];
        store.save_all(&defs).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, defs);
        assert_eq!(store.find_by_name("alpha").unwrap().id, defs[1].id);
        assert!(matches!(
            store.find_by_name("missing"),
            Err(Error::TunnelNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_ids_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = TunnelStore::new(dir.path().join("tunnels.json"));

        let def = create_test_definition("blog");
        store.save_all(&[def.clone(), def.clone()]).unwrap();

        assert_eq!(store.load_all().unwrap(), vec![def]);
    }
}
