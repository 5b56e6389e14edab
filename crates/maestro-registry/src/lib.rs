#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-registry** – Configuration registries for Maestro.
//!
//! Agent definitions and task templates are loaded from a directory tree of
//! YAML files at process start. Both registries are read-only after loading;
//! `reload` replaces the whole map atomically so concurrent readers never
//! observe a partial configuration. Definitions are never mutated per-task.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use maestro_types::{AgentDefinition, AgentId, TaskTemplate, TemplateId};

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext == "yaml" || ext == "yml")
}

//─────────────────────────────
//  Agent registry
//─────────────────────────────

/// Registry of specialized agents discovered from configuration.
pub struct AgentRegistry {
    base_dir: PathBuf,
    agents: RwLock<HashMap<AgentId, AgentDefinition>>,
}

impl AgentRegistry {
    /// Load every agent definition under `base_dir`.
    ///
    /// Malformed files are skipped with a warning so one bad definition does
    /// not take the whole registry down; duplicate `agent_id`s are a hard
    /// error.
    pub fn load(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let agents = Self::load_dir(&base_dir)?;
        info!(
            dir = %base_dir.display(),
            count = agents.len(),
            "loaded agent definitions"
        );
        Ok(Self {
            base_dir,
            agents: RwLock::new(agents),
        })
    }

    /// Re-read the configuration directory, replacing the registry
    /// atomically on success. On failure the previous registry stays live.
    pub fn reload(&self) -> Result<usize> {
        let fresh = Self::load_dir(&self.base_dir)?;
        let count = fresh.len();
        *self.agents.write().expect("registry lock poisoned") = fresh;
        info!(count, "agent registry reloaded");
        Ok(count)
    }

    fn load_dir(dir: &Path) -> Result<HashMap<AgentId, AgentDefinition>> {
        if !dir.exists() {
            anyhow::bail!("agent configuration directory does not exist: {}", dir.display());
        }

        let mut agents = HashMap::new();
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to read directory: {}", dir.display()))?;

        for dir_entry in entries {
            let path = dir_entry?.path();
            if !is_yaml(&path) {
                continue;
            }
            match Self::load_file(&path) {
                Ok(definition) => {
                    debug!(agent = %definition.agent_id, file = %path.display(), "loaded agent definition");
                    if let Some(previous) = agents.insert(definition.agent_id.clone(), definition) {
                        anyhow::bail!("duplicate agent_id: {}", previous.agent_id);
                    }
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping malformed agent definition");
                }
            }
        }

        Ok(agents)
    }

    fn load_file(path: &Path) -> Result<AgentDefinition> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read file: {}", path.display()))?;
        let definition: AgentDefinition = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML file: {}", path.display()))?;
        definition
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("invalid definition in file: {}", path.display()))?;
        Ok(definition)
    }

    /// All registered agents, in unspecified order.
    pub fn list_agents(&self) -> Vec<AgentDefinition> {
        self.agents
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Agents declaring `capability`. Matching is case-sensitive and exact.
    pub fn find_by_capability(&self, capability: &str) -> Vec<AgentDefinition> {
        self.agents
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|def| def.capabilities.iter().any(|c| c == capability))
            .cloned()
            .collect()
    }

    /// Look up one agent by id.
    pub fn get(&self, agent_id: &AgentId) -> Option<AgentDefinition> {
        self.agents
            .read()
            .expect("registry lock poisoned")
            .get(agent_id)
            .cloned()
    }

    /// Whether an agent with this id is registered.
    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents
            .read()
            .expect("registry lock poisoned")
            .contains_key(agent_id)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().expect("registry lock poisoned").len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//─────────────────────────────
//  Template registry
//─────────────────────────────

/// Registry of task templates discovered from configuration.
pub struct TemplateRegistry {
    base_dir: PathBuf,
    templates: RwLock<HashMap<TemplateId, TaskTemplate>>,
}

impl TemplateRegistry {
    /// Load every task template under `base_dir`.
    pub fn load(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let templates = Self::load_dir(&base_dir)?;
        info!(
            dir = %base_dir.display(),
            count = templates.len(),
            "loaded task templates"
        );
        Ok(Self {
            base_dir,
            templates: RwLock::new(templates),
        })
    }

    /// Re-read the configuration directory, replacing atomically on success.
    pub fn reload(&self) -> Result<usize> {
        let fresh = Self::load_dir(&self.base_dir)?;
        let count = fresh.len();
        *self.templates.write().expect("registry lock poisoned") = fresh;
        Ok(count)
    }

    fn load_dir(dir: &Path) -> Result<HashMap<TemplateId, TaskTemplate>> {
        if !dir.exists() {
            anyhow::bail!("template directory does not exist: {}", dir.display());
        }

        let mut templates = HashMap::new();
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to read directory: {}", dir.display()))?;

        for dir_entry in entries {
            let path = dir_entry?.path();
            if !is_yaml(&path) {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read file: {}", path.display()))?;
            match serde_yaml::from_str::<TaskTemplate>(&contents) {
                Ok(template) => {
                    if let Err(e) = template.validate() {
                        warn!(file = %path.display(), error = %e, "skipping invalid template");
                        continue;
                    }
                    if let Some(previous) =
                        templates.insert(template.template_id.clone(), template)
                    {
                        anyhow::bail!("duplicate template_id: {}", previous.template_id);
                    }
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping malformed template");
                }
            }
        }

        Ok(templates)
    }

    /// Look up one template by id.
    pub fn get(&self, template_id: &TemplateId) -> Option<TaskTemplate> {
        self.templates
            .read()
            .expect("registry lock poisoned")
            .get(template_id)
            .cloned()
    }

    /// All registered templates, in unspecified order.
    pub fn list(&self) -> Vec<TaskTemplate> {
        self.templates
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const COLLECTOR_YAML: &str = r#"
agent_id: "data_collector"
version: "1.2.0"
role: "Collects structured business data from users and public sources"
capabilities:
  - "data_collection"
  - "field_validation"
required_tools:
  - "registry_lookup"
input_schema:
  type: object
  properties:
    instruction:
      enum: ["collect", "verify"]
output_schema: {}
mission: "Gather every required onboarding field with minimal user friction"
decision_rules:
  - "Prefer public records over asking the user"
prompt_template: "Instruction: {instruction}\nData: {data}\nContext: {context}"
"#;

    const TEMPLATE_YAML: &str = r#"
template_id: "onboarding"
name: "User onboarding"
description: "Bring a new business onto the platform"
initial_phase: "intake"
goals:
  - "collect business identity"
data_schema:
  required:
    - "email"
    - "business_name"
  optional:
    - "website"
success_criteria:
  - "all required fields present"
"#;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_agent_registry_loads_and_indexes() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "data_collector.yaml", COLLECTOR_YAML);

        let registry = AgentRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);

        let agent = registry.get(&AgentId("data_collector".into())).unwrap();
        assert_eq!(agent.version, "1.2.0");
        assert_eq!(
            agent.supported_instructions().unwrap(),
            vec!["collect".to_string(), "verify".to_string()]
        );

        let found = registry.find_by_capability("data_collection");
        assert_eq!(found.len(), 1);
        // Capability match is exact and case-sensitive
        assert!(registry.find_by_capability("Data_Collection").is_empty());
        assert!(registry.find_by_capability("data").is_empty());
    }

    #[test]
    fn test_malformed_definition_skipped() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "good.yaml", COLLECTOR_YAML);
        write(dir.path(), "bad.yaml", "agent_id: [not, a, string");
        write(dir.path(), "notes.txt", "ignored entirely");

        let registry = AgentRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_agent_id_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "one.yaml", COLLECTOR_YAML);
        write(dir.path(), "two.yaml", COLLECTOR_YAML);

        assert!(AgentRegistry::load(dir.path()).is_err());
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        assert!(AgentRegistry::load("/definitely/not/a/real/dir").is_err());
    }

    #[test]
    fn test_reload_replaces_atomically() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "data_collector.yaml", COLLECTOR_YAML);

        let registry = AgentRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);

        let second = COLLECTOR_YAML.replace("data_collector", "compliance_checker");
        write(dir.path(), "compliance_checker.yaml", &second);

        assert_eq!(registry.reload().unwrap(), 2);
        assert!(registry.contains(&AgentId("compliance_checker".into())));
    }

    #[test]
    fn test_template_registry_round_trip() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "onboarding.yaml", TEMPLATE_YAML);

        let registry = TemplateRegistry::load(dir.path()).unwrap();
        let template = registry.get(&TemplateId("onboarding".into())).unwrap();
        assert_eq!(template.initial_phase, "intake");
        assert_eq!(
            template.data_schema.required,
            vec!["email".to_string(), "business_name".to_string()]
        );
        assert!(registry.get(&TemplateId("missing".into())).is_none());
    }
}
