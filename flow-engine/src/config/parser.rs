// Workflow Parser
// Loads workflow declarations from YAML

use super::models::WorkflowConfig;

use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read workflow file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse workflow: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub struct WorkflowParser;

impl WorkflowParser {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<WorkflowConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<WorkflowConfig, ConfigError> {
        let workflow: WorkflowConfig = serde_yaml::from_str(content)?;
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Expression;
    use std::io::Write;

    #[test]
    fn test_parse_workflow() {
        let yaml = r#"
engine:
  workers: 2
resources:
  - type: db
    name: main
    args:
      url: postgres://localhost/test
steps:
  - type: http
    name: seed
    args:
      url: https://example.com
  - type: http
    name: fan
    count: 3
    depends_on: [step.http.seed]
    uses:
      db: "${resource.db.main}"
    args:
      url: "https://example.com/${index}"
      prev: "${step.http.seed.output.body}"
"#;
        let workflow = WorkflowParser::from_str(yaml).unwrap();
        assert_eq!(workflow.engine.workers, 2);
        assert_eq!(workflow.resources.len(), 1);
        assert_eq!(workflow.steps.len(), 2);

        let fan = &workflow.steps[1];
        assert_eq!(fan.step_type, "http");
        assert_eq!(fan.count, Some(Expression::literal(3)));
        assert_eq!(fan.depends_on, vec!["step.http.seed"]);
        assert_eq!(
            fan.uses.get("db"),
            Some(&Expression::Reference("resource.db.main".parse().unwrap()))
        );
        assert!(matches!(fan.args.get("url"), Some(Expression::Template(_))));
    }

    #[test]
    fn test_parse_empty_workflow() {
        let workflow = WorkflowParser::from_str("{}").unwrap();
        assert!(workflow.steps.is_empty());
        assert!(workflow.resources.is_empty());
        assert_eq!(workflow.engine.workers, 0);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = WorkflowParser::from_str("steps: [ { type: http");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "steps:\n  - type: noop\n    name: only").unwrap();

        let workflow = WorkflowParser::from_file(file.path()).unwrap();
        assert_eq!(workflow.steps.len(), 1);
        assert_eq!(workflow.steps[0].name, "only");

        let missing = WorkflowParser::from_file(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
