//! Workflow validation: user overrides, entry pruning, topological ordering
//! and reference checks.
//!
//! All checks run before execution begins; a source that passes `validate`
//! yields a deterministic run-step ordering and every reference in it is
//! proven resolvable against a transitive dependency or a system variable.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::workflow::parameters::{
    check_output_artifact, name_pattern, resolve_refs, ResolveContext, StepOutputs, SysVars,
};
use crate::workflow::types::{DictParam, ParamValue, StepSpec, WorkflowSource};

/// Out-of-band information about the run a workflow belongs to.
#[derive(Debug, Clone, Default)]
pub struct ExtraInfo {
    /// Source identifier: yaml hash, pipeline id or yaml path.
    pub source: String,
    pub fs_id: String,
    pub fs_name: String,
    pub user_name: String,
}

/// A workflow source bound to one run, before any jobs exist.
///
/// `validate` mutates the source in place: user overrides are applied and
/// dict parameters are replaced by their coerced defaults.
#[derive(Debug, Clone, Default)]
pub struct BaseWorkflow {
    pub run_id: String,
    pub name: String,
    pub desc: String,
    /// Optional entry step restricting execution to its ancestor closure.
    pub entry: String,
    /// User-supplied parameter overrides: `name` or `step.name` keys.
    pub params: BTreeMap<String, serde_json::Value>,
    pub extra: ExtraInfo,
    pub source: WorkflowSource,
}

impl BaseWorkflow {
    pub fn new(
        source: WorkflowSource,
        run_id: impl Into<String>,
        entry: impl Into<String>,
        params: Option<BTreeMap<String, serde_json::Value>>,
        extra: Option<ExtraInfo>,
    ) -> Self {
        BaseWorkflow {
            run_id: run_id.into(),
            name: source.name.clone(),
            desc: source.desc.clone(),
            entry: entry.into(),
            params: params.unwrap_or_default(),
            extra: extra.unwrap_or_default(),
            source,
        }
    }

    /// Validate the workflow against its entry and parameter overrides.
    pub fn validate(&mut self) -> Result<()> {
        if self.source.entry_points.is_empty() {
            return Err(Error::Validation(
                "workflow source has no entry_points".to_string(),
            ));
        }
        self.apply_param_overrides()?;
        let run_steps = self.run_steps()?;
        let order = self.topological_sort(&run_steps)?;
        self.check_steps(&run_steps, &order)?;
        Ok(())
    }

    /// The effective step set: all steps, or the ancestor closure of entry.
    pub fn run_steps(&self) -> Result<BTreeMap<String, StepSpec>> {
        if self.entry.is_empty() {
            return Ok(self.source.entry_points.clone());
        }
        if !self.source.entry_points.contains_key(&self.entry) {
            return Err(Error::Validation(format!(
                "entry step[{}] not found in entry_points",
                self.entry
            )));
        }
        let mut selected = BTreeSet::new();
        let mut stack = vec![self.entry.clone()];
        while let Some(name) = stack.pop() {
            if !selected.insert(name.clone()) {
                continue;
            }
            if let Some(spec) = self.source.entry_points.get(&name) {
                for dep in &spec.deps {
                    stack.push(dep.clone());
                }
            }
        }
        Ok(self
            .source
            .entry_points
            .iter()
            .filter(|(name, _)| selected.contains(*name))
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect())
    }

    /// Kahn's algorithm over the dependency edges of `steps`.
    ///
    /// Ties break lexicographically, so the ordering is deterministic for a
    /// given source. A cycle is reported with one participating step.
    pub fn topological_sort(&self, steps: &BTreeMap<String, StepSpec>) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, spec) in steps {
            in_degree.entry(name.as_str()).or_insert(0);
            for dep in &spec.deps {
                if !steps.contains_key(dep) {
                    return Err(Error::Validation(format!(
                        "step[{}] depends on unknown step[{}]",
                        name, dep
                    )));
                }
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(name);
            }
        }

        // BTreeSet keeps the ready set lexicographically ordered.
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(steps.len());
        while let Some(&name) = ready.iter().next() {
            ready.remove(name);
            order.push(name.to_string());
            for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or(&[]) {
                let degree = in_degree.get_mut(dependent).expect("dependent is a step");
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != steps.len() {
            let stuck = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| *n)
                .next()
                .unwrap_or("");
            return Err(Error::CycleDetected(format!(
                "workflow has a cycle involving step[{}]",
                stuck
            )));
        }
        Ok(order)
    }

    /// Transitive dependency sets for every step in `steps`.
    pub fn transitive_deps(steps: &BTreeMap<String, StepSpec>) -> HashMap<String, HashSet<String>> {
        let mut result: HashMap<String, HashSet<String>> = HashMap::new();
        for name in steps.keys() {
            let mut seen = HashSet::new();
            let mut stack: Vec<&str> = steps
                .get(name)
                .map(|s| s.deps.iter().map(String::as_str).collect())
                .unwrap_or_default();
            while let Some(dep) = stack.pop() {
                if !seen.insert(dep.to_string()) {
                    continue;
                }
                if let Some(spec) = steps.get(dep) {
                    stack.extend(spec.deps.iter().map(String::as_str));
                }
            }
            result.insert(name.clone(), seen);
        }
        result
    }

    /// Apply user parameter overrides onto the source.
    ///
    /// `step.name` keys target one step; bare names must match exactly one
    /// parameter across the whole source, not just the pruned entry subgraph.
    fn apply_param_overrides(&mut self) -> Result<()> {
        let overrides: Vec<(String, serde_json::Value)> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in overrides {
            let param = ParamValue::from_json(&value)?;
            match key.split_once('.') {
                Some((step, name)) => {
                    let spec = self.source.entry_points.get_mut(step).ok_or_else(|| {
                        Error::Validation(format!(
                            "param[{}] targets unknown step[{}]",
                            key, step
                        ))
                    })?;
                    if !spec.parameters.contains_key(name) {
                        return Err(Error::Validation(format!(
                            "param[{}] not found in step[{}]",
                            name, step
                        )));
                    }
                    spec.parameters.insert(name.to_string(), param);
                }
                None => {
                    let matches: Vec<String> = self
                        .source
                        .entry_points
                        .iter()
                        .filter(|(_, spec)| spec.parameters.contains_key(&key))
                        .map(|(name, _)| name.clone())
                        .collect();
                    match matches.as_slice() {
                        [] => {
                            return Err(Error::Validation(format!(
                                "param name[{}] not found in any step",
                                key
                            )))
                        }
                        [step] => {
                            let spec = self
                                .source
                                .entry_points
                                .get_mut(step)
                                .expect("matched step exists");
                            spec.parameters.insert(key.clone(), param);
                        }
                        many => {
                            return Err(Error::Validation(format!(
                                "param name[{}] is ambiguous, found in steps{:?}",
                                key, many
                            )))
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Per-step checks, walked in topological order so every upstream value
    /// is resolved before its dependents reference it.
    fn check_steps(
        &mut self,
        run_steps: &BTreeMap<String, StepSpec>,
        order: &[String],
    ) -> Result<()> {
        let sys = self.sys_vars();
        let trans = Self::transitive_deps(run_steps);
        let mut resolved: HashMap<String, StepOutputs> = HashMap::new();

        for step_name in order {
            if !name_pattern().is_match(step_name) {
                return Err(Error::InvalidNamePattern(format!(
                    "format of step name[{}] incorrect, should be in [a-zA-Z0-9_]",
                    step_name
                )));
            }
            let spec = self
                .source
                .entry_points
                .get_mut(step_name)
                .expect("run step exists in source");

            for key in spec.parameters.keys() {
                if !name_pattern().is_match(key) {
                    return Err(Error::InvalidNamePattern(format!(
                        "format of parameters[{}] in step[{}] incorrect, should be in [a-zA-Z0-9_]",
                        key, step_name
                    )));
                }
            }
            for key in spec.env.keys() {
                if !name_pattern().is_match(key) {
                    return Err(Error::InvalidNamePattern(format!(
                        "format of env[{}] in step[{}] incorrect, should be in [a-zA-Z0-9_]",
                        key, step_name
                    )));
                }
            }

            // Replace dict parameters by their coerced defaults.
            let dict_names: Vec<String> = spec
                .parameters
                .iter()
                .filter(|(_, v)| v.is_dict())
                .map(|(k, _)| k.clone())
                .collect();
            for name in dict_names {
                let ParamValue::Dict(map) = &spec.parameters[&name] else {
                    continue;
                };
                let coerced = DictParam::from_map(&name, map)?.coerce(&name)?;
                spec.parameters.insert(name, coerced);
            }

            // Only transitive dependencies are visible to references.
            let upstream: HashMap<String, StepOutputs> = trans
                .get(step_name)
                .map(|deps| {
                    deps.iter()
                        .filter_map(|d| resolved.get(d).map(|o| (d.clone(), o.clone())))
                        .collect()
                })
                .unwrap_or_default();
            let ctx = ResolveContext {
                sys: &sys,
                step_name,
                upstream: &upstream,
                own: None,
            };

            let mut outputs = StepOutputs::default();
            for (key, value) in &spec.parameters {
                let concrete = resolve_refs(&value.as_text(), &ctx, "parameters")?;
                outputs.parameters.insert(key.clone(), concrete);
            }
            for value in spec.env.values() {
                resolve_refs(value, &ctx, "env")?;
            }
            for value in spec.artifacts.input.values() {
                resolve_refs(value, &ctx, "inputArtifacts")?;
            }
            for (key, value) in &spec.artifacts.output {
                let concrete = check_output_artifact(value, &ctx)?;
                outputs.artifacts.insert(key.clone(), concrete);
            }
            resolved.insert(step_name.clone(), outputs);
        }
        Ok(())
    }

    /// Resolve every run step's parameters and artifacts to concrete strings.
    ///
    /// Used by the runtime to build job specs; `validate` must have succeeded.
    pub fn resolve_outputs(&self) -> Result<HashMap<String, StepOutputs>> {
        let run_steps = self.run_steps()?;
        let order = self.topological_sort(&run_steps)?;
        let sys = self.sys_vars();
        let trans = Self::transitive_deps(&run_steps);
        let mut resolved: HashMap<String, StepOutputs> = HashMap::new();

        for step_name in &order {
            let spec = &run_steps[step_name];
            let upstream: HashMap<String, StepOutputs> = trans
                .get(step_name)
                .map(|deps| {
                    deps.iter()
                        .filter_map(|d| resolved.get(d).map(|o| (d.clone(), o.clone())))
                        .collect()
                })
                .unwrap_or_default();
            let ctx = ResolveContext {
                sys: &sys,
                step_name,
                upstream: &upstream,
                own: None,
            };
            let mut outputs = StepOutputs::default();
            for (key, value) in &spec.parameters {
                let concrete = resolve_refs(&value.as_text(), &ctx, "parameters")?;
                outputs.parameters.insert(key.clone(), concrete);
            }
            for (key, value) in &spec.artifacts.output {
                let concrete = check_output_artifact(value, &ctx)?;
                outputs.artifacts.insert(key.clone(), concrete);
            }
            resolved.insert(step_name.clone(), outputs);
        }
        Ok(resolved)
    }

    /// System variables for this run.
    pub fn sys_vars(&self) -> SysVars {
        SysVars {
            run_id: self.run_id.clone(),
            fs_id: self.extra.fs_id.clone(),
            fs_name: self.extra.fs_name.clone(),
            user_name: self.extra.user_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parser::parse_workflow_source;
    use crate::workflow::testdata::{RUN_CIRCLE_YAML, RUN_WRONG_PARAM_YAML, RUN_YAML};

    fn base(entry: &str) -> BaseWorkflow {
        let source = parse_workflow_source(RUN_YAML).unwrap();
        BaseWorkflow::new(source, "run-000027", entry, None, None)
    }

    #[test]
    fn test_validate_full_source() {
        let mut bwf = base("");
        bwf.validate().unwrap();
        assert_eq!(
            bwf.source.entry_points["validate"].parameters["refSystem"],
            ParamValue::String("{{ PF_RUN_ID }}".to_string())
        );
    }

    #[test]
    fn test_topological_sort_is_deterministic() {
        let bwf = base("");
        let order = bwf
            .topological_sort(&bwf.source.entry_points)
            .unwrap();
        assert_eq!(order, vec!["data_preprocess", "main", "validate"]);
    }

    #[test]
    fn test_topological_sort_lexicographic_ties() {
        let yaml = r#"
name: fanout
entry_points:
  zeta:
    command: "echo z"
  alpha:
    command: "echo a"
  omega:
    command: "echo o"
    deps: [zeta, alpha]
"#;
        let source = parse_workflow_source(yaml).unwrap();
        let bwf = BaseWorkflow::new(source, "", "", None, None);
        let order = bwf.topological_sort(&bwf.source.entry_points).unwrap();
        assert_eq!(order, vec!["alpha", "zeta", "omega"]);
    }

    #[test]
    fn test_cycle_detected() {
        let source = parse_workflow_source(RUN_CIRCLE_YAML).unwrap();
        let bwf = BaseWorkflow::new(source, "", "", None, None);
        let err = bwf
            .topological_sort(&bwf.source.entry_points)
            .unwrap_err();
        assert_eq!(err.code(), "CYCLE_DETECTED");
    }

    #[test]
    fn test_entry_prunes_to_ancestor_closure() {
        let bwf = base("main");
        let run_steps = bwf.run_steps().unwrap();
        assert_eq!(run_steps.len(), 2);
        assert!(run_steps.contains_key("data_preprocess"));
        assert!(run_steps.contains_key("main"));
        assert!(!run_steps.contains_key("validate"));
    }

    #[test]
    fn test_unknown_entry_fails() {
        let bwf = base("nothere");
        assert!(bwf.run_steps().is_err());
    }

    #[test]
    fn test_wrong_param_fails_full_but_passes_pruned() {
        // The bad reference lives in `main`; pruning to `data_preprocess`
        // leaves only the valid subgraph.
        let source = parse_workflow_source(RUN_WRONG_PARAM_YAML).unwrap();
        let mut bwf = BaseWorkflow::new(source.clone(), "", "", None, None);
        assert!(bwf.validate().is_err());

        let mut bwf = BaseWorkflow::new(source, "", "data_preprocess", None, None);
        bwf.validate().unwrap();
    }

    #[test]
    fn test_sys_param_reference_checks() {
        let mut bwf = base("");
        bwf.source
            .entry_points
            .get_mut("validate")
            .unwrap()
            .parameters
            .insert("refSystem".into(), ParamValue::String("{{ xxx }}".into()));
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported SysParamName[xxx] for param[{{ xxx }}]"
        );

        bwf.source
            .entry_points
            .get_mut("validate")
            .unwrap()
            .parameters
            .insert(
                "refSystem".into(),
                ParamValue::String("{{ PF_RUN_ID }}".into()),
            );
        bwf.validate().unwrap();
    }

    #[test]
    fn test_downstream_reference_rejected() {
        let mut bwf = base("");
        bwf.source
            .entry_points
            .get_mut("main")
            .unwrap()
            .parameters
            .insert(
                "invalidRef".into(),
                ParamValue::String("{{ validate.refSystem }}".into()),
            );
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid parameters reference {{ validate.refSystem }} in step main"
        );
    }

    #[test]
    fn test_transitive_reference_allowed() {
        // validate depends on main which depends on data_preprocess; the
        // fixture's validate step references data_preprocess directly.
        let mut bwf = base("");
        bwf.validate().unwrap();
    }

    #[test]
    fn test_param_name_format() {
        let mut bwf = base("");
        bwf.source
            .entry_points
            .get_mut("main")
            .unwrap()
            .parameters
            .insert("invalid-name".into(), ParamValue::String("xxx".into()));
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "format of parameters[invalid-name] in step[main] incorrect, should be in [a-zA-Z0-9_]"
        );
    }

    #[test]
    fn test_env_name_format() {
        let mut bwf = base("");
        bwf.source
            .entry_points
            .get_mut("main")
            .unwrap()
            .env
            .insert("invalid-name".into(), "xxx".into());
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "format of env[invalid-name] in step[main] incorrect, should be in [a-zA-Z0-9_]"
        );
    }

    #[test]
    fn test_dict_params_normalized() {
        let mut bwf = base("");
        bwf.validate().unwrap();
        let params = &bwf.source.entry_points["main"].parameters;
        assert_eq!(params["p3"], ParamValue::String("dictparam".into()));
        assert_eq!(params["p4"], ParamValue::Float(0.66));
        assert_eq!(params["p5"], ParamValue::String("/path/to/anywhere".into()));
    }

    #[test]
    fn test_dict_param_bad_path_value() {
        let mut bwf = base("");
        let mut map = std::collections::BTreeMap::new();
        map.insert("type".to_string(), serde_yaml::Value::from("path"));
        map.insert("default".to_string(), serde_yaml::Value::from("/111 / "));
        bwf.source
            .entry_points
            .get_mut("main")
            .unwrap()
            .parameters
            .insert("dict".into(), ParamValue::Dict(map));
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid path value[/111 / ] in parameter[dict]"
        );
    }

    #[test]
    fn test_input_artifact_checks() {
        let mut bwf = base("");
        bwf.source
            .entry_points
            .get_mut("main")
            .unwrap()
            .artifacts
            .input
            .insert("wrongdata".into(), "{{ xxxx }}".into());
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported SysParamName[xxxx] for param[{{ xxxx }}]"
        );

        bwf.source
            .entry_points
            .get_mut("main")
            .unwrap()
            .artifacts
            .input
            .insert("wrongdata".into(), "{{ data_preprocess.noexist_data }}".into());
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid inputArtifacts reference {{ data_preprocess.noexist_data }} in step main"
        );

        // A plain path is not a reference and passes.
        bwf.source
            .entry_points
            .get_mut("main")
            .unwrap()
            .artifacts
            .input
            .insert("wrongdata".into(), "/path/to/xxx".into());
        bwf.validate().unwrap();
    }

    #[test]
    fn test_output_artifact_cannot_ref_upstream() {
        let mut bwf = base("");
        bwf.source
            .entry_points
            .get_mut("main")
            .unwrap()
            .artifacts
            .output
            .insert("wrongdata".into(), "{{ data_preprocess.train_data }}".into());
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "output artifact[{{ data_preprocess.train_data }}] cannot refer upstream artifact"
        );
    }

    #[test]
    fn test_override_by_bare_name() {
        let source = parse_workflow_source(RUN_YAML).unwrap();
        let mut params = std::collections::BTreeMap::new();
        params.insert("model".to_string(), serde_json::json!("correct"));
        let mut bwf = BaseWorkflow::new(source, "", "", Some(params), None);
        bwf.validate().unwrap();
        assert_eq!(
            bwf.source.entry_points["main"].parameters["model"],
            ParamValue::String("correct".into())
        );
    }

    #[test]
    fn test_override_by_step_qualified_name() {
        let source = parse_workflow_source(RUN_YAML).unwrap();
        let mut params = std::collections::BTreeMap::new();
        params.insert("main.model".to_string(), serde_json::json!("correct"));
        let mut bwf = BaseWorkflow::new(source, "", "", Some(params), None);
        bwf.validate().unwrap();
        assert_eq!(
            bwf.source.entry_points["main"].parameters["model"],
            ParamValue::String("correct".into())
        );
    }

    #[test]
    fn test_override_unknown_name_fails() {
        let source = parse_workflow_source(RUN_YAML).unwrap();
        let mut params = std::collections::BTreeMap::new();
        params.insert("p1".to_string(), serde_json::json!("correct"));
        let mut bwf = BaseWorkflow::new(source, "", "", Some(params), None);
        assert!(bwf.validate().is_err());
    }

    #[test]
    fn test_override_with_sys_ref_validates() {
        let source = parse_workflow_source(RUN_YAML).unwrap();
        let mut params = std::collections::BTreeMap::new();
        params.insert("model".to_string(), serde_json::json!("{{ PF_RUN_ID }}"));
        let mut bwf = BaseWorkflow::new(source.clone(), "", "", Some(params), None);
        bwf.validate().unwrap();

        let mut params = std::collections::BTreeMap::new();
        params.insert("model".to_string(), serde_json::json!("{{ xxx }}"));
        let mut bwf = BaseWorkflow::new(source.clone(), "", "", Some(params), None);
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported SysParamName[xxx] for param[{{ xxx }}]"
        );

        let mut params = std::collections::BTreeMap::new();
        params.insert("model".to_string(), serde_json::json!("{{ step1.param }}"));
        let mut bwf = BaseWorkflow::new(source, "", "", Some(params), None);
        let err = bwf.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid parameters reference {{ step1.param }} in step main"
        );
    }

    #[test]
    fn test_resolve_outputs_follows_refs() {
        let mut bwf = base("");
        bwf.validate().unwrap();
        let resolved = bwf.resolve_outputs().unwrap();
        assert_eq!(
            resolved["main"].parameters["train_stage"],
            "/data/raw".to_string()
        );
        assert_eq!(
            resolved["validate"].parameters["refSystem"],
            "run-000027".to_string()
        );
        assert_eq!(
            resolved["data_preprocess"].artifacts["train_data"],
            "/out/train_data".to_string()
        );
    }
}
