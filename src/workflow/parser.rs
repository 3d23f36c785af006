//! Workflow source YAML parser.

use super::types::WorkflowSource;
use crate::error::{Error, Result};

/// Parse a workflow source from a YAML string.
pub fn parse_workflow_source(yaml: &str) -> Result<WorkflowSource> {
    if yaml.trim().is_empty() {
        return Err(Error::MalformedYaml("empty workflow source".to_string()));
    }
    let source: WorkflowSource =
        serde_yaml::from_str(yaml).map_err(|e| Error::MalformedYaml(e.to_string()))?;
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::ParamValue;

    #[test]
    fn test_parse_three_step_source() {
        let source = parse_workflow_source(crate::workflow::testdata::RUN_YAML).unwrap();
        assert_eq!(source.name, "distributed_training");
        assert_eq!(source.entry_points.len(), 3);

        let main = source.get_step("main").unwrap();
        assert_eq!(main.deps, vec!["data_preprocess"]);
        assert_eq!(
            main.parameters.get("model"),
            Some(&ParamValue::String("./model/dnn".to_string()))
        );
        assert!(main.parameters.get("p3").unwrap().is_dict());
        assert_eq!(
            main.artifacts.input.get("train_data"),
            Some(&"{{ data_preprocess.train_data }}".to_string())
        );
    }

    #[test]
    fn test_parse_deps_as_comma_joined_string() {
        let yaml = r#"
name: fanin
entry_points:
  a:
    command: "echo a"
  b:
    command: "echo b"
  c:
    command: "echo c"
    deps: "a, b"
"#;
        let source = parse_workflow_source(yaml).unwrap();
        assert_eq!(source.get_step("c").unwrap().deps, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_empty_source() {
        let err = parse_workflow_source("   \n").unwrap_err();
        assert_eq!(err.code(), "MALFORMED_YAML");
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = parse_workflow_source("name: [broken").unwrap_err();
        assert_eq!(err.code(), "MALFORMED_YAML");
    }

    #[test]
    fn test_parse_cache_options() {
        let yaml = r#"
name: cached
entry_points:
  step1:
    command: "echo hi"
    cache:
      enable: true
      max_expired_time: 600
      fs_scope: "/data"
"#;
        let source = parse_workflow_source(yaml).unwrap();
        let cache = &source.get_step("step1").unwrap().cache;
        assert!(cache.enable);
        assert_eq!(cache.max_expired_time, 600);
        assert_eq!(cache.fs_scope, "/data");
    }
}
