//! Image preparation ahead of stage execution.
//!
//! Every distinct image is fetched once, all fetches concurrently. A failed
//! fetch is only a warning: the engine may still hold a cached copy, and if it
//! does not, the stage that needs it fails at sandbox creation.

use std::collections::HashSet;

use futures::future::join_all;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::engine::{ImageRef, SandboxEngine};
use crate::error::EngineError;
use crate::job::Stage;

/// What happened to each distinct image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImagePreparation {
    pub fetched: Vec<ImageRef>,
    /// Images whose fetch failed, with the reason. Execution proceeds anyway.
    pub failed: Vec<(ImageRef, String)>,
}

impl ImagePreparation {
    /// Total fetch attempts made.
    pub fn attempted(&self) -> usize {
        self.fetched.len() + self.failed.len()
    }
}

/// Distinct images referenced by `stages`, in first-occurrence order.
///
/// References are compared after normalisation, so `alpine` and
/// `alpine:latest` count as one image.
pub fn distinct_images(stages: &[Stage]) -> Vec<ImageRef> {
    let mut seen = HashSet::new();
    stages
        .iter()
        .map(|stage| ImageRef::parse(&stage.image))
        .filter(|image| seen.insert(image.to_string()))
        .collect()
}

/// Fetch every distinct image used by `stages`, concurrently.
///
/// Completes once every fetch has settled. Never fails.
pub async fn prepare_images(engine: &dyn SandboxEngine, stages: &[Stage]) -> ImagePreparation {
    let images = distinct_images(stages);
    let outcomes = join_all(images.into_iter().map(|image| async move {
        let outcome = fetch_image(engine, &image).await;
        (image, outcome)
    }))
    .await;

    let mut preparation = ImagePreparation::default();
    for (image, outcome) in outcomes {
        match outcome {
            Ok(()) => preparation.fetched.push(image),
            Err(e) => {
                warn!(
                    image = %image,
                    error = %e,
                    "Error pulling image; attempting to fall back to cached version"
                );
                preparation.failed.push((image, e.to_string()));
            }
        }
    }
    preparation
}

async fn fetch_image(engine: &dyn SandboxEngine, image: &ImageRef) -> Result<(), EngineError> {
    info!(image = %image, "Pulling image");
    let mut progress = engine.fetch_image(image);
    while let Some(event) = progress.next().await {
        let event = event?;
        debug!(image = %image, "{}", event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeEngine;

    fn stage(image: &str) -> Stage {
        Stage::new(image, vec!["true".into()])
    }

    #[test]
    fn test_distinct_images_dedupes_in_order() {
        let stages = vec![stage("x:1"), stage("x:1"), stage("y")];
        let images: Vec<String> = distinct_images(&stages).iter().map(|i| i.to_string()).collect();
        assert_eq!(images, vec!["x:1", "y:latest"]);
    }

    #[test]
    fn test_implicit_and_explicit_latest_are_one_image() {
        let stages = vec![stage("alpine"), stage("alpine:latest")];
        assert_eq!(distinct_images(&stages).len(), 1);
    }

    #[tokio::test]
    async fn test_each_image_fetched_once() {
        let engine = FakeEngine::new();
        let stages = vec![stage("x:1"), stage("x:1"), stage("y")];

        let preparation = prepare_images(&engine, &stages).await;

        assert_eq!(preparation.attempted(), 2);
        assert!(preparation.failed.is_empty());
        let mut pulls = engine.pulls();
        pulls.sort();
        assert_eq!(pulls, vec!["x:1", "y:latest"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_tolerated() {
        let engine = FakeEngine::new().with_pull_failure("broken");
        let stages = vec![stage("broken"), stage("alpine")];

        let preparation = prepare_images(&engine, &stages).await;

        assert_eq!(preparation.fetched.len(), 1);
        assert_eq!(preparation.failed.len(), 1);
        assert_eq!(preparation.failed[0].0.repository, "broken");
    }

    #[tokio::test]
    async fn test_repeated_preparation_issues_same_set() {
        let engine = FakeEngine::new();
        let stages = vec![stage("x:1"), stage("y"), stage("x:1")];

        let first = prepare_images(&engine, &stages).await;
        let second = prepare_images(&engine, &stages).await;

        assert_eq!(first, second);
        assert_eq!(engine.pulls().len(), 4);
    }
}
