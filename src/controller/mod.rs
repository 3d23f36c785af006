//! Request-surface controllers binding persisted records to live runtimes.

mod marker;
mod run;

pub use marker::{decrypt_pk, encrypt_pk};
pub use run::{
    is_root, CreateRunRequest, CreateRunResponse, ListRunRequest, ListRunResponse,
    RequestContext, RunController, ROOT_USER,
};
