//! Parameter and artifact reference resolution.
//!
//! References use the literal pattern `{{ name }}` where name is either a
//! system variable (`PF_RUN_ID`, ...) or `step.param` pointing at an upstream
//! step's parameter or output artifact. Resolution is a single textual pass
//! over each string value; `{{ }}` has no escape form.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex_lite::Regex;

use crate::error::{Error, Result};

/// Pattern for one `{{ name }}` reference. The name may carry a single dot
/// separating the upstream step from its parameter or artifact.
pub(crate) fn ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]*\.?[A-Za-z0-9_]+)\s*\}\}").expect("valid regex")
    })
}

/// Pattern for step, parameter and env names.
pub(crate) fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"))
}

/// Pattern for path-typed parameter values: no whitespace, portable chars.
pub(crate) fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_/\-.]+$").expect("valid regex"))
}

/// The current run's system variables.
#[derive(Debug, Clone, Default)]
pub struct SysVars {
    pub run_id: String,
    pub fs_id: String,
    pub fs_name: String,
    pub user_name: String,
}

impl SysVars {
    /// Look up a system variable; `PF_STEP_NAME` resolves per referencing step.
    pub fn get(&self, name: &str, step_name: &str) -> Option<String> {
        match name {
            "PF_RUN_ID" => Some(self.run_id.clone()),
            "PF_FS_ID" => Some(self.fs_id.clone()),
            "PF_FS_NAME" => Some(self.fs_name.clone()),
            "PF_USER_NAME" => Some(self.user_name.clone()),
            "PF_STEP_NAME" => Some(step_name.to_string()),
            _ => None,
        }
    }
}

/// Resolved values of one upstream step, visible to its dependents.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    pub parameters: BTreeMap<String, String>,
    pub artifacts: BTreeMap<String, String>,
}

impl StepOutputs {
    fn lookup(&self, name: &str) -> Option<&String> {
        self.parameters
            .get(name)
            .or_else(|| self.artifacts.get(name))
    }
}

/// Context for resolving references inside one step.
///
/// `upstream` holds only the transitive dependencies of the step; a reference
/// to any other step is invalid by construction. `own` carries the step's own
/// already-resolved values and is consulted for bare names in commands, env
/// values and artifact paths.
pub struct ResolveContext<'a> {
    pub sys: &'a SysVars,
    pub step_name: &'a str,
    pub upstream: &'a HashMap<String, StepOutputs>,
    pub own: Option<&'a StepOutputs>,
}

/// Substitute every reference in `raw`, returning the concrete string.
///
/// `kind` names the field being resolved ("parameters", "env",
/// "inputArtifacts", "command") and only shapes error messages.
pub fn resolve_refs(raw: &str, ctx: &ResolveContext<'_>, kind: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last = 0usize;
    for caps in ref_pattern().captures_iter(raw) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = caps.get(1).expect("capture 1 always present").as_str();
        out.push_str(&raw[last..whole.start()]);
        out.push_str(&resolve_one(whole.as_str(), name, ctx, kind)?);
        last = whole.end();
    }
    out.push_str(&raw[last..]);
    Ok(out)
}

fn resolve_one(whole: &str, name: &str, ctx: &ResolveContext<'_>, kind: &str) -> Result<String> {
    match name.split_once('.') {
        Some((step, param)) if !step.is_empty() => {
            let outputs = ctx.upstream.get(step).ok_or_else(|| {
                Error::InvalidCrossRef(format!(
                    "invalid {} reference {} in step {}",
                    kind, whole, ctx.step_name
                ))
            })?;
            outputs.lookup(param).cloned().ok_or_else(|| {
                Error::InvalidCrossRef(format!(
                    "invalid {} reference {} in step {}",
                    kind, whole, ctx.step_name
                ))
            })
        }
        other => {
            // `{{ .name }}` falls through here with an empty step part and is
            // treated like a bare name.
            let bare = match other {
                Some((_, param)) => param,
                None => name,
            };
            if let Some(own) = ctx.own {
                if let Some(value) = own.lookup(bare) {
                    return Ok(value.clone());
                }
            }
            ctx.sys.get(bare, ctx.step_name).ok_or_else(|| {
                Error::UnsupportedSysParam(format!(
                    "unsupported SysParamName[{}] for param[{}]",
                    bare, whole
                ))
            })
        }
    }
}

/// Check an output-artifact expression: upstream references are forbidden,
/// bare references must be system variables.
pub fn check_output_artifact(raw: &str, ctx: &ResolveContext<'_>) -> Result<String> {
    for caps in ref_pattern().captures_iter(raw) {
        let whole = caps.get(0).expect("capture 0 always present").as_str();
        let name = caps.get(1).expect("capture 1 always present").as_str();
        if let Some((step, _)) = name.split_once('.') {
            if !step.is_empty() {
                return Err(Error::InvalidCrossRef(format!(
                    "output artifact[{}] cannot refer upstream artifact",
                    whole
                )));
            }
        }
    }
    // Output values resolve against system variables only.
    let sys_only = ResolveContext {
        sys: ctx.sys,
        step_name: ctx.step_name,
        upstream: ctx.upstream,
        own: None,
    };
    resolve_refs(raw, &sys_only, "outputArtifacts")
}

/// Whether a raw string contains at least one reference.
pub fn has_refs(raw: &str) -> bool {
    ref_pattern().is_match(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sys() -> SysVars {
        SysVars {
            run_id: "run-000027".to_string(),
            fs_id: "fs-root-sample".to_string(),
            fs_name: "sample".to_string(),
            user_name: "root".to_string(),
        }
    }

    fn ctx<'a>(
        sys: &'a SysVars,
        upstream: &'a HashMap<String, StepOutputs>,
    ) -> ResolveContext<'a> {
        ResolveContext {
            sys,
            step_name: "main",
            upstream,
            own: None,
        }
    }

    #[test]
    fn test_sys_var_substitution() {
        let sys = sys();
        let upstream = HashMap::new();
        let resolved =
            resolve_refs("run={{ PF_RUN_ID }} step={{ PF_STEP_NAME }}", &ctx(&sys, &upstream), "parameters")
                .unwrap();
        assert_eq!(resolved, "run=run-000027 step=main");
    }

    #[test]
    fn test_every_sys_param_resolves() {
        let sys = sys();
        let upstream = HashMap::new();
        for name in crate::workflow::SYS_PARAM_NAMES {
            let raw = format!("{{{{ {} }}}}", name);
            assert!(resolve_refs(&raw, &ctx(&sys, &upstream), "parameters").is_ok());
        }
    }

    #[test]
    fn test_unknown_sys_var() {
        let sys = sys();
        let upstream = HashMap::new();
        let err = resolve_refs("{{ xxx }}", &ctx(&sys, &upstream), "parameters").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported SysParamName[xxx] for param[{{ xxx }}]"
        );
    }

    #[test]
    fn test_leading_dot_is_sys_lookup() {
        let sys = sys();
        let upstream = HashMap::new();
        let err = resolve_refs("{{ .refSystem }}", &ctx(&sys, &upstream), "parameters").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported SysParamName[refSystem] for param[{{ .refSystem }}]"
        );
    }

    #[test]
    fn test_upstream_reference() {
        let sys = sys();
        let mut upstream = HashMap::new();
        let mut outputs = StepOutputs::default();
        outputs
            .artifacts
            .insert("train_data".to_string(), "/out/train.parquet".to_string());
        upstream.insert("data_preprocess".to_string(), outputs);

        let resolved = resolve_refs(
            "{{ data_preprocess.train_data }}",
            &ctx(&sys, &upstream),
            "inputArtifacts",
        )
        .unwrap();
        assert_eq!(resolved, "/out/train.parquet");
    }

    #[test]
    fn test_missing_upstream_reference() {
        let sys = sys();
        let upstream = HashMap::new();
        let err = resolve_refs(
            "{{ validate.refSystem }}",
            &ctx(&sys, &upstream),
            "parameters",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid parameters reference {{ validate.refSystem }} in step main"
        );
    }

    #[test]
    fn test_multiple_references_in_one_value() {
        let sys = sys();
        let mut upstream = HashMap::new();
        let mut outputs = StepOutputs::default();
        outputs
            .parameters
            .insert("model".to_string(), "resnet".to_string());
        upstream.insert("train".to_string(), outputs);

        let resolved = resolve_refs(
            "{{ train.model }}-{{ PF_RUN_ID }}",
            &ctx(&sys, &upstream),
            "parameters",
        )
        .unwrap();
        assert_eq!(resolved, "resnet-run-000027");
    }

    #[test]
    fn test_own_values_win_over_sys() {
        let sys = sys();
        let upstream = HashMap::new();
        let mut own = StepOutputs::default();
        own.parameters
            .insert("model".to_string(), "resnet".to_string());
        let ctx = ResolveContext {
            sys: &sys,
            step_name: "main",
            upstream: &upstream,
            own: Some(&own),
        };
        let resolved = resolve_refs("python train.py --model {{ model }}", &ctx, "command").unwrap();
        assert_eq!(resolved, "python train.py --model resnet");
    }

    #[test]
    fn test_output_artifact_rejects_upstream_ref() {
        let sys = sys();
        let mut upstream = HashMap::new();
        upstream.insert("data_preprocess".to_string(), StepOutputs::default());
        let err = check_output_artifact(
            "{{ data_preprocess.train_data }}",
            &ctx(&sys, &upstream),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "output artifact[{{ data_preprocess.train_data }}] cannot refer upstream artifact"
        );
    }

    #[test]
    fn test_output_artifact_allows_sys_var() {
        let sys = sys();
        let upstream = HashMap::new();
        let resolved =
            check_output_artifact("/out/{{ PF_RUN_ID }}/model", &ctx(&sys, &upstream)).unwrap();
        assert_eq!(resolved, "/out/run-000027/model");
    }

    #[test]
    fn test_text_without_refs_passes_through() {
        let sys = sys();
        let upstream = HashMap::new();
        let resolved = resolve_refs("/path/to/xxx", &ctx(&sys, &upstream), "inputArtifacts").unwrap();
        assert_eq!(resolved, "/path/to/xxx");
    }
}
