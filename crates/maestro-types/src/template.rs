//! Task templates.
//!
//! A template is the declarative definition of a task's goals, initial
//! phase, required inputs, and success criteria. Templates are loaded from
//! configuration and snapshotted into each task at creation time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TemplateId;

/// Required and optional data fields, addressed as dot-paths into the
/// task's accumulated `data` object (e.g. `"business.legal_name"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSchema {
    /// Fields that must be present for the task to be complete.
    #[serde(default)]
    pub required: Vec<String>,
    /// Fields that enrich the task but never gate completeness.
    #[serde(default)]
    pub optional: Vec<String>,
}

impl DataSchema {
    /// Count how many required fields are present in `data`.
    pub fn required_present(&self, data: &Value) -> usize {
        self.required
            .iter()
            .filter(|path| lookup_path(data, path).is_some())
            .count()
    }
}

/// Resolve a dot-path against a JSON object, `None` when any segment is
/// missing or the value is null.
pub fn lookup_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// The declarative definition of a task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Template identifier referenced at task creation.
    pub template_id: TemplateId,
    /// Display name.
    pub name: String,
    /// What tasks of this kind accomplish.
    #[serde(default)]
    pub description: String,
    /// Phase name a freshly created task starts in.
    pub initial_phase: String,
    /// Goals handed to the planner.
    #[serde(default)]
    pub goals: Vec<String>,
    /// Required and optional data fields.
    #[serde(default)]
    pub data_schema: DataSchema,
    /// How a completed task is judged.
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

impl TaskTemplate {
    /// Validate a template loaded from configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.template_id.0.trim().is_empty() {
            return Err("template_id cannot be empty".into());
        }
        if self.initial_phase.trim().is_empty() {
            return Err(format!("template {} declares no initial phase", self.template_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_path_nested() {
        let data = json!({"business": {"legal_name": "Acme", "ein": null}});
        assert!(lookup_path(&data, "business.legal_name").is_some());
        assert!(lookup_path(&data, "business.ein").is_none());
        assert!(lookup_path(&data, "business.missing").is_none());
        assert!(lookup_path(&data, "owner").is_none());
    }

    #[test]
    fn test_required_present_counts() {
        let schema = DataSchema {
            required: vec!["email".into(), "business.legal_name".into()],
            optional: vec!["website".into()],
        };
        let data = json!({"email": "a@b.io", "business": {}});
        assert_eq!(schema.required_present(&data), 1);
        let data = json!({"email": "a@b.io", "business": {"legal_name": "Acme"}});
        assert_eq!(schema.required_present(&data), 2);
    }

    #[test]
    fn test_template_validation() {
        let template = TaskTemplate {
            template_id: TemplateId("onboarding".into()),
            name: "User onboarding".into(),
            description: String::new(),
            initial_phase: "initialization".into(),
            goals: vec![],
            data_schema: DataSchema::default(),
            success_criteria: vec![],
        };
        assert!(template.validate().is_ok());

        let mut bad = template;
        bad.initial_phase = " ".into();
        assert!(bad.validate().is_err());
    }
}
