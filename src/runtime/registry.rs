//! Registry mapping run ids to live workflow runtimes.
//!
//! Stop and retry arrive on different requests than create, so a runtime
//! must stay reachable by run id for its whole life. The registry is
//! injected into the controller; entries are inserted on start/resume and
//! cleared only at process shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::runloop::Workflow;

#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    inner: Arc<Mutex<HashMap<String, Workflow>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run_id: &str, workflow: Workflow) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .insert(run_id.to_string(), workflow);
    }

    pub fn get(&self, run_id: &str) -> Option<Workflow> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(run_id)
            .cloned()
    }

    /// Snapshot of every registered workflow, for the shutdown drain.
    pub fn workflows(&self) -> Vec<Workflow> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn remove(&self, run_id: &str) -> Option<Workflow> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .remove(run_id)
    }

    pub fn clear(&self) {
        self.inner.lock().expect("registry lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use crate::job::mock::MockBackend;
    use crate::runtime::{RuntimeDeps, WorkflowCallbacks};
    use crate::workflow::parse_workflow_source;
    use crate::workflow::testdata::RUN_YAML;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RuntimeRegistry::new();
        let workflow = Workflow::new(
            parse_workflow_source(RUN_YAML).unwrap(),
            "run-000001",
            "",
            None,
            None,
            WorkflowCallbacks::noop(),
            RuntimeDeps {
                backend: Arc::new(MockBackend::new()),
                fs: Arc::new(LocalFs::new(dir.path())),
            },
        )
        .unwrap();

        assert!(registry.is_empty());
        registry.insert("run-000001", workflow.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("run-000001").is_some());
        assert!(registry.get("run-999999").is_none());

        // A later insert under the same id replaces the entry (retry path).
        registry.insert("run-000001", workflow);
        assert_eq!(registry.len(), 1);

        registry.remove("run-000001");
        assert!(registry.is_empty());
    }
}
