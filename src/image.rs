//! Image preparation gating.
//!
//! Before a run starts, its docker env may need to be materialized (e.g. a
//! tar archive on the run's filesystem that must be loaded and pushed).
//! Preparation runs asynchronously and reports through a callback; the
//! controller marks the run failed or starts it accordingly.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Everything the preparation subsystem needs for one run's image.
#[derive(Debug, Clone)]
pub struct ImagePrepRequest {
    pub image: String,
    pub run_id: String,
    pub fs_id: String,
    pub fs_host: String,
    pub fs_port: u16,
    /// Image ids already registered for this filesystem.
    pub known_image_ids: Vec<String>,
}

/// Invoked exactly once with the resolved image URL or the failure.
pub type ImagePrepCallback = Box<dyn FnOnce(Result<String>) + Send + 'static>;

/// The image-preparation collaborator.
#[async_trait]
pub trait ImageHandler: Send + Sync {
    /// Whether `image` must be prepared before jobs can use it.
    fn needs_prep(&self, image: &str) -> bool;

    /// Prepare asynchronously; `callback` fires when the image is resolved.
    async fn prepare_image(&self, req: ImagePrepRequest, callback: ImagePrepCallback)
        -> Result<()>;
}

/// Handler for deployments whose images are always registry URLs.
///
/// Tar archives would need a builder backend; this handler rejects them at
/// preparation time instead of at job submission.
#[derive(Clone, Default)]
pub struct DirectImageHandler;

impl DirectImageHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ImageHandler for DirectImageHandler {
    fn needs_prep(&self, image: &str) -> bool {
        image.ends_with(".tar") || image.ends_with(".tgz")
    }

    async fn prepare_image(
        &self,
        req: ImagePrepRequest,
        callback: ImagePrepCallback,
    ) -> Result<()> {
        tokio::spawn(async move {
            callback(Err(Error::Internal(format!(
                "image[{}] needs preparation but no builder is configured",
                req.image
            ))));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_prep_only_for_archives() {
        let handler = DirectImageHandler::new();
        assert!(!handler.needs_prep("registry.example.com/train:1.2"));
        assert!(handler.needs_prep("./images/train.tar"));
        assert!(handler.needs_prep("./images/train.tgz"));
    }

    #[tokio::test]
    async fn test_prepare_reports_through_callback() {
        let handler = DirectImageHandler::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        handler
            .prepare_image(
                ImagePrepRequest {
                    image: "./images/train.tar".into(),
                    run_id: "run-000001".into(),
                    fs_id: "fs-root-sample".into(),
                    fs_host: "localhost".into(),
                    fs_port: 8999,
                    known_image_ids: vec![],
                },
                Box::new(move |result| {
                    let _ = tx.send(result.is_err());
                }),
            )
            .await
            .unwrap();
        assert!(rx.await.unwrap());
    }
}
