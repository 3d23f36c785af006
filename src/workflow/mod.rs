//! Workflow sources: parsing, parameter resolution and validation.
//!
//! A workflow source is a YAML-described DAG of steps. This module owns the
//! language-neutral model (`types`), the YAML parser, the `{{ ... }}`
//! reference resolver (`parameters`) and the pre-execution validator.

pub mod parameters;
mod parser;
#[cfg(test)]
pub(crate) mod testdata;
mod types;
mod validator;

pub use parameters::{resolve_refs, ResolveContext, StepOutputs, SysVars};
pub use parser::parse_workflow_source;
pub use types::{
    Artifacts, CacheOptions, DictParam, DictParamType, ParamValue, StepSpec, WorkflowSource,
    SYS_PARAM_NAMES,
};
pub use validator::{BaseWorkflow, ExtraInfo};
