//! Skill discovery from the filesystem layout.
//!
//! The contract: a skills directory whose immediate subdirectories each
//! hold one skill (marked by an entry file), plus a companion JSON with
//! `enabled`, `disabled`, and per-skill `config`. A skill loads when it
//! appears on `enabled` (or `enabled` is empty) and is absent from
//! `disabled`. Code is materialized by built-in constructors keyed by
//! directory name; the directory contract is the plugin surface.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Skill, SkillRuntime};
use crate::error::{ShipmateError, SkillError};

/// Marker file making a subdirectory a skill.
const ENTRY_FILE: &str = "skill.json";

/// The companion config file contents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillsFileConfig {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

/// Builds a skill instance from its per-skill config value.
pub type SkillConstructor = Box<dyn Fn(&Value) -> Arc<dyn Skill> + Send + Sync>;

/// Loads skills from a directory layout.
pub struct SkillLoader {
    skills_dir: PathBuf,
    config_path: PathBuf,
    constructors: HashMap<String, SkillConstructor>,
}

impl SkillLoader {
    pub fn new(skills_dir: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            skills_dir: skills_dir.into(),
            config_path: config_path.into(),
            constructors: HashMap::new(),
        }
    }

    /// Register the constructor for a skill directory name.
    pub fn provide(
        &mut self,
        name: impl Into<String>,
        constructor: impl Fn(&Value) -> Arc<dyn Skill> + Send + Sync + 'static,
    ) {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    /// Read the companion config, warning on unknown top-level keys.
    pub fn read_config(&self) -> Result<SkillsFileConfig, ShipmateError> {
        if !self.config_path.exists() {
            return Ok(SkillsFileConfig::default());
        }
        let text = std::fs::read_to_string(&self.config_path)?;
        let raw: Value = serde_json::from_str(&text).map_err(|e| SkillError::Config {
            message: format!("{}: {e}", self.config_path.display()),
        })?;
        if let Some(map) = raw.as_object() {
            for key in map.keys() {
                if !matches!(key.as_str(), "enabled" | "disabled" | "config") {
                    warn!(key = %key, file = %self.config_path.display(), "unknown skills config key ignored");
                }
            }
        }
        serde_json::from_value(raw).map_err(|e| {
            SkillError::Config {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Directory names under the skills dir that carry an entry file.
    pub fn discover(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.skills_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir() && e.path().join(ENTRY_FILE).exists())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    fn should_load(name: &str, config: &SkillsFileConfig) -> bool {
        if config.disabled.iter().any(|d| d == name) {
            return false;
        }
        config.enabled.is_empty() || config.enabled.iter().any(|e| e == name)
    }

    /// Load every eligible discovered skill into the runtime. Returns the
    /// names loaded.
    pub async fn load_into(&self, runtime: &SkillRuntime) -> Result<Vec<String>, ShipmateError> {
        let config = self.read_config()?;
        let mut loaded = Vec::new();
        for name in self.discover() {
            if !Self::should_load(&name, &config) {
                info!(skill = %name, "skill disabled by config");
                continue;
            }
            let Some(constructor) = self.constructors.get(&name) else {
                warn!(skill = %name, "skill directory present but no constructor registered");
                continue;
            };
            let skill_config = config.config.get(&name).cloned().unwrap_or(Value::Null);
            runtime.register(constructor(&skill_config)).await;
            loaded.push(name);
        }
        Ok(loaded)
    }

    /// Hot-reload one skill: rebuild it from its constructor and replace
    /// the registered instance (the displaced one is shut down). A skill
    /// now disabled by config is unregistered instead.
    pub async fn reload(
        &self,
        name: &str,
        runtime: &SkillRuntime,
    ) -> Result<bool, ShipmateError> {
        let config = self.read_config()?;
        if !Self::should_load(name, &config) {
            return Ok(runtime.unregister(name).await);
        }
        let Some(constructor) = self.constructors.get(name) else {
            return Err(SkillError::NotFound {
                name: name.to_string(),
            }
            .into());
        };
        let skill_config = config.config.get(name).cloned().unwrap_or(Value::Null);
        runtime.register(constructor(&skill_config)).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::test_support::FixedSkill;
    use std::path::Path;
    use tempfile::TempDir;

    fn make_skill_dir(root: &Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(ENTRY_FILE), "{}").unwrap();
    }

    fn loader_with(root: &TempDir, config_json: &str) -> SkillLoader {
        let config_path = root.path().join("skills.json");
        std::fs::write(&config_path, config_json).unwrap();
        let mut loader = SkillLoader::new(root.path(), config_path);
        loader.provide("alpha", |_| Arc::new(FixedSkill::new("alpha", 10, "a", "a")));
        loader.provide("beta", |_| Arc::new(FixedSkill::new("beta", 10, "b", "b")));
        loader
    }

    #[tokio::test]
    async fn test_loads_discovered_enabled_skills() {
        let root = TempDir::new().unwrap();
        make_skill_dir(root.path(), "alpha");
        make_skill_dir(root.path(), "beta");
        // A directory without the entry file is not a skill.
        std::fs::create_dir_all(root.path().join("notes")).unwrap();

        let loader = loader_with(&root, "{}");
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        let loaded = loader.load_into(&runtime).await.unwrap();
        assert_eq!(loaded, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_disabled_list_wins() {
        let root = TempDir::new().unwrap();
        make_skill_dir(root.path(), "alpha");
        make_skill_dir(root.path(), "beta");

        let loader = loader_with(&root, r#"{"enabled": ["alpha", "beta"], "disabled": ["beta"]}"#);
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        let loaded = loader.load_into(&runtime).await.unwrap();
        assert_eq!(loaded, vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_enabled_list_filters() {
        let root = TempDir::new().unwrap();
        make_skill_dir(root.path(), "alpha");
        make_skill_dir(root.path(), "beta");

        let loader = loader_with(&root, r#"{"enabled": ["beta"]}"#);
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        let loaded = loader.load_into(&runtime).await.unwrap();
        assert_eq!(loaded, vec!["beta"]);
    }

    #[tokio::test]
    async fn test_reload_replaces_single_skill() {
        let root = TempDir::new().unwrap();
        make_skill_dir(root.path(), "alpha");
        let loader = loader_with(&root, "{}");
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        loader.load_into(&runtime).await.unwrap();

        assert!(loader.reload("alpha", &runtime).await.unwrap());
        assert_eq!(runtime.skill_names(), vec!["alpha"]);

        assert!(loader.reload("ghost", &runtime).await.is_err());
    }

    #[test]
    fn test_missing_config_file_is_default() {
        let root = TempDir::new().unwrap();
        let loader = SkillLoader::new(root.path(), root.path().join("absent.json"));
        let config = loader.read_config().unwrap();
        assert!(config.enabled.is_empty());
        assert!(config.disabled.is_empty());
    }
}
