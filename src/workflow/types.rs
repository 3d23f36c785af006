//! Workflow source type definitions.
//!
//! A workflow source is the parsed, language-neutral description of a DAG of
//! steps. It is immutable once validated; step ordering is produced by the
//! validator's topological sort, never by declaration order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// System variables that may be referenced from any step.
pub const SYS_PARAM_NAMES: [&str; 5] = [
    "PF_RUN_ID",
    "PF_FS_ID",
    "PF_FS_NAME",
    "PF_USER_NAME",
    "PF_STEP_NAME",
];

/// A complete workflow source.
///
/// # Example YAML
///
/// ```yaml
/// name: distributed_training
/// desc: train and validate a model
/// docker_env: registry.example.com/train:1.2
///
/// entry_points:
///   data_preprocess:
///     command: "python preprocess.py --output {{ train_data }}"
///     artifacts:
///       output:
///         train_data: /out/train.parquet
///   main:
///     command: "python train.py --data {{ train_data }} --model {{ model }}"
///     deps: data_preprocess
///     parameters:
///       model: resnet
///     artifacts:
///       input:
///         train_data: "{{ data_preprocess.train_data }}"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSource {
    /// Workflow name (used as the run name unless overridden).
    #[serde(default)]
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub desc: String,

    /// Default container image for all steps.
    #[serde(default)]
    pub docker_env: String,

    /// Steps of the workflow, keyed by step name.
    #[serde(default)]
    pub entry_points: BTreeMap<String, StepSpec>,
}

impl WorkflowSource {
    /// Get a step spec by name.
    pub fn get_step(&self, name: &str) -> Option<&StepSpec> {
        self.entry_points.get(name)
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpec {
    /// Shell command to run; may contain `{{ ... }}` references.
    #[serde(default)]
    pub command: String,

    /// Per-step container image override.
    #[serde(default)]
    pub docker_env: String,

    /// Upstream step names. Accepts a YAML list or a comma-joined string.
    #[serde(default, deserialize_with = "deserialize_deps")]
    pub deps: Vec<String>,

    /// Step parameters: scalars or typed dict parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,

    /// Environment variables for the job.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Input and output artifacts.
    #[serde(default)]
    pub artifacts: Artifacts,

    /// Result-cache policy.
    #[serde(default)]
    pub cache: CacheOptions,
}

/// Input and output artifacts of a step.
///
/// Input values are either plain paths or `{{ step.artifact }}` references to
/// an upstream output; output values declare locally-produced paths only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default)]
    pub input: BTreeMap<String, String>,

    #[serde(default)]
    pub output: BTreeMap<String, String>,
}

/// Cache policy for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Whether completed results of this step may be reused.
    #[serde(default)]
    pub enable: bool,

    /// Seconds a cache entry stays valid; negative means never expires.
    #[serde(default = "default_max_expired_time")]
    pub max_expired_time: i64,

    /// Extra filesystem paths folded into the fingerprint.
    #[serde(default)]
    pub fs_scope: String,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enable: false,
            max_expired_time: default_max_expired_time(),
            fs_scope: String::new(),
        }
    }
}

fn default_max_expired_time() -> i64 {
    -1
}

/// A parameter value as written in the source.
///
/// A mapping with a `type` key is a dict parameter; the validator replaces it
/// with its coerced default before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Dict(BTreeMap<String, serde_yaml::Value>),
}

impl ParamValue {
    /// Render the value as text for reference substitution.
    pub fn as_text(&self) -> String {
        match self {
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::String(s) => s.clone(),
            ParamValue::Dict(_) => String::new(),
        }
    }

    /// Convert a JSON value from a request into a parameter value.
    pub fn from_json(value: &serde_json::Value) -> Result<ParamValue> {
        match value {
            serde_json::Value::Bool(b) => Ok(ParamValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ParamValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(ParamValue::Float(f))
                } else {
                    Err(Error::InvalidParamType(format!(
                        "parameter value[{}] is not a representable number",
                        n
                    )))
                }
            }
            serde_json::Value::String(s) => Ok(ParamValue::String(s.clone())),
            other => Err(Error::InvalidParamType(format!(
                "parameter value[{}] must be a scalar",
                other
            ))),
        }
    }

    pub fn is_dict(&self) -> bool {
        matches!(self, ParamValue::Dict(_))
    }
}

/// The three dict parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DictParamType {
    String,
    Float,
    Path,
}

impl std::fmt::Display for DictParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DictParamType::String => write!(f, "string"),
            DictParamType::Float => write!(f, "float"),
            DictParamType::Path => write!(f, "path"),
        }
    }
}

/// A parameter declared as a typed default.
#[derive(Debug, Clone, PartialEq)]
pub struct DictParam {
    pub param_type: DictParamType,
    pub default: Option<serde_yaml::Value>,
}

impl DictParam {
    /// Interpret a raw parameter mapping as a dict parameter.
    pub fn from_map(name: &str, map: &BTreeMap<String, serde_yaml::Value>) -> Result<DictParam> {
        let type_value = map.get("type").ok_or_else(|| {
            Error::InvalidParamType(format!("invalid dict parameter[{}]: missing type", name))
        })?;
        let type_name = type_value.as_str().ok_or_else(|| {
            Error::InvalidParamType(format!(
                "invalid dict parameter[{}]: type must be a string",
                name
            ))
        })?;
        let param_type = match type_name {
            "string" => DictParamType::String,
            "float" => DictParamType::Float,
            "path" => DictParamType::Path,
            other => {
                return Err(Error::InvalidParamType(format!(
                    "type[{}] is not supported for dict param[{}]",
                    other, name
                )))
            }
        };
        Ok(DictParam {
            param_type,
            default: map.get("default").cloned(),
        })
    }

    /// Coerce the default to the declared type.
    ///
    /// Float accepts numeric literals as-is; path must match
    /// `^[A-Za-z0-9_/\-.]+$`; string must be non-empty.
    pub fn coerce(&self, name: &str) -> Result<ParamValue> {
        let default = match &self.default {
            Some(v) if !v.is_null() => v,
            _ => {
                return Err(Error::InvalidParamType(format!(
                    "invalid value[] in dict param[{}]: missing default",
                    name
                )))
            }
        };
        match self.param_type {
            DictParamType::Float => match default {
                serde_yaml::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(ParamValue::Int(i))
                    } else if let Some(f) = n.as_f64() {
                        Ok(ParamValue::Float(f))
                    } else {
                        Err(invalid_value_for(name, default, self.param_type))
                    }
                }
                _ => Err(invalid_value_for(name, default, self.param_type)),
            },
            DictParamType::Path => {
                let text = default
                    .as_str()
                    .ok_or_else(|| invalid_value_for(name, default, self.param_type))?;
                if text.is_empty() {
                    return Err(Error::InvalidParamType(format!(
                        "invalid value[] in dict param[{}]",
                        name
                    )));
                }
                if !crate::workflow::parameters::path_pattern().is_match(text) {
                    return Err(Error::InvalidParamType(format!(
                        "invalid path value[{}] in parameter[{}]",
                        text, name
                    )));
                }
                Ok(ParamValue::String(text.to_string()))
            }
            DictParamType::String => {
                let text = default
                    .as_str()
                    .ok_or_else(|| invalid_value_for(name, default, self.param_type))?;
                if text.is_empty() {
                    return Err(Error::InvalidParamType(format!(
                        "invalid value[] in dict param[{}]",
                        name
                    )));
                }
                Ok(ParamValue::String(text.to_string()))
            }
        }
    }
}

fn invalid_value_for(name: &str, value: &serde_yaml::Value, ty: DictParamType) -> Error {
    let rendered = serde_yaml::to_string(value)
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default();
    Error::InvalidParamType(format!(
        "invalid value[{}] for type[{}] in dict param[{}]",
        rendered, ty, name
    ))
}

/// Deps appear either as a YAML list or as a comma-joined string.
fn deserialize_deps<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Deps {
        List(Vec<String>),
        Joined(String),
    }

    let deps = match Deps::deserialize(deserializer)? {
        Deps::List(items) => items,
        Deps::Joined(joined) => joined.split(',').map(|s| s.to_string()).collect(),
    };
    Ok(deps
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect())
}
