//! Image puller
//!
//! Pulls each image at most once per puller, however many runners ask for it
//! concurrently. The first caller for an image spawns the pull; everybody
//! else awaits the same shared outcome, failures included.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use berth_core::{ImageReference, LogSink};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ImagePullerConfig;
use crate::error::PullError;
use crate::runtime::{ContainerRuntime, RegistryAuth, RuntimeError};

type SharedPull = Shared<BoxFuture<'static, Result<(), PullError>>>;

/// Deduplicating image puller
pub struct ImagePuller {
    runtime: Arc<dyn ContainerRuntime>,
    sink: Arc<dyn LogSink>,
    config: ImagePullerConfig,
    pulls: Mutex<HashMap<String, SharedPull>>,
}

impl ImagePuller {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sink: Arc<dyn LogSink>,
        config: ImagePullerConfig,
    ) -> Self {
        Self {
            runtime,
            sink,
            config,
            pulls: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ImagePullerConfig {
        &self.config
    }

    /// Makes sure `image` is present
    ///
    /// Returns once the image has been pulled, or straight away when its
    /// registry is configured to be skipped. Cancelling `cancel` only stops
    /// this caller from waiting; a pull already in flight keeps going for
    /// the other callers.
    pub async fn pull(&self, cancel: &CancellationToken, image: &str) -> Result<(), PullError> {
        let reference = ImageReference::parse(image)?;

        if self.config.skips(reference.domain()) {
            debug!(
                "Not pulling {}: registry {} is configured to be skipped",
                image,
                reference.domain()
            );
            return Ok(());
        }

        let pull = self.shared_pull(image, reference);

        tokio::select! {
            biased;
            result = pull => result,
            _ = cancel.cancelled() => Err(PullError::Cancelled {
                image: image.to_string(),
            }),
        }
    }

    fn shared_pull(&self, image: &str, reference: ImageReference) -> SharedPull {
        let mut pulls = self.pulls.lock().unwrap_or_else(PoisonError::into_inner);

        pulls
            .entry(image.to_string())
            .or_insert_with(|| {
                let auth = self.config.auth_for(reference.domain()).cloned();
                let task = tokio::spawn(pull_image(
                    Arc::clone(&self.runtime),
                    Arc::clone(&self.sink),
                    image.to_string(),
                    reference,
                    auth,
                ));

                let image = image.to_string();
                async move {
                    task.await.unwrap_or_else(|join_error| {
                        Err(PullError::Runtime {
                            image,
                            source: RuntimeError::Api(format!("pull task failed: {join_error}")),
                        })
                    })
                }
                .boxed()
                .shared()
            })
            .clone()
    }
}

async fn pull_image(
    runtime: Arc<dyn ContainerRuntime>,
    sink: Arc<dyn LogSink>,
    image: String,
    reference: ImageReference,
    auth: Option<RegistryAuth>,
) -> Result<(), PullError> {
    info!("Pulling image {}", image);
    let started = Instant::now();
    let source = format!("image \"{}\" puller", image);

    let mut progress = runtime.pull_image(&reference, auth);
    while let Some(item) = progress.next().await {
        match item {
            Ok(progress) => {
                let line = progress.to_string();
                if !line.is_empty() {
                    sink.write_line(&source, &line);
                }
            }
            Err(source) => {
                error!("Pulling image {} failed: {}", image, source);
                return Err(PullError::Runtime { image, source });
            }
        }
    }

    info!("Pulled image {} in {:?}", image, started.elapsed());
    Ok(())
}
