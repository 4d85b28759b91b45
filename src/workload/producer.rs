//! The message-enqueueing workload.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of enqueue requests sent
//! `messages_enqueued`: Requests the target accepted with status 200
//! `bytes_written`: Total body bytes accepted by the target
//! `request_failure`: Requests refused by the target or lost in transit
//!

use std::time::Duration;

use http::{
    Method, Request, StatusCode, Uri,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use metrics::counter;
use rand::{Rng, SeedableRng, prelude::StdRng};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinSet, time::sleep};
use tracing::{error, info};

use super::{
    General,
    common::{self, HttpClient, MetricsBuilder},
};
use crate::{payload, signals};

fn default_parallel_callers() -> u16 {
    10
}

fn default_duration_seconds() -> u64 {
    60
}

fn default_minimum_length() -> u32 {
    250
}

fn default_maximum_length() -> u32 {
    300
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of this workload.
pub struct Config {
    /// The seed for random operations against this target
    pub seed: [u8; 32],
    /// The URI of the target's message endpoint, must be a valid URI
    #[serde(with = "http_serde::uri")]
    pub target_uri: Uri,
    /// The number of concurrent logical callers to maintain
    #[serde(default = "default_parallel_callers")]
    pub parallel_callers: u16,
    /// The wall-clock seconds this workload runs for
    #[serde(default = "default_duration_seconds")]
    pub duration_seconds: u64,
    /// The inclusive lower bound on payload length, in bytes
    #[serde(default = "default_minimum_length")]
    pub minimum_length: u32,
    /// The inclusive upper bound on payload length, in bytes
    #[serde(default = "default_maximum_length")]
    pub maximum_length: u32,
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Producer`].
pub enum Error {
    /// Wrapper around [`hyper::http::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
    /// Wrapper around [`serde_json::Error`].
    #[error("Failed to serialize enqueue body: {0}")]
    Json(#[from] serde_json::Error),
    /// Payload length bounds are inverted.
    #[error("minimum_length {minimum} exceeds maximum_length {maximum}")]
    LengthBounds {
        /// The configured lower bound
        minimum: u32,
        /// The configured upper bound
        maximum: u32,
    },
}

/// The message-enqueueing workload.
///
/// This workload is responsible for filling the target's queue: each caller
/// repeatedly POSTs a randomized payload to the message endpoint.
#[derive(Debug)]
pub struct Producer {
    uri: Uri,
    parallel_callers: u16,
    duration: Duration,
    minimum_length: u32,
    maximum_length: u32,
    rng: StdRng,
    metric_labels: Vec<(String, String)>,
    shutdown: signals::Watcher,
}

impl Producer {
    /// Create a new [`Producer`] instance
    ///
    /// # Errors
    ///
    /// Creation will fail if the configured payload length bounds are
    /// inverted.
    pub fn new(
        general: General,
        config: Config,
        shutdown: signals::Watcher,
    ) -> Result<Self, Error> {
        if config.minimum_length > config.maximum_length {
            return Err(Error::LengthBounds {
                minimum: config.minimum_length,
                maximum: config.maximum_length,
            });
        }

        let labels = MetricsBuilder::new("producer").with_id(general.id).build();

        Ok(Self {
            uri: config.target_uri,
            parallel_callers: config.parallel_callers,
            duration: Duration::from_secs(config.duration_seconds),
            minimum_length: config.minimum_length,
            maximum_length: config.maximum_length,
            rng: StdRng::from_seed(config.seed),
            metric_labels: labels,
            shutdown,
        })
    }

    /// Run [`Producer`] to completion or until a shutdown signal is received.
    ///
    /// Spawns one worker per configured caller, each issuing enqueue requests
    /// in a closed loop. When the workload duration elapses or shutdown is
    /// signaled, in-flight requests are abandoned without cleanup.
    ///
    /// # Errors
    ///
    /// Function will return an error if a worker fails to construct an HTTP
    /// request for the target.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn spin(mut self) -> Result<(), Error> {
        let client = common::build_client(self.parallel_callers);

        let mut workers = JoinSet::new();
        for _ in 0..self.parallel_callers {
            let worker = Worker {
                client: client.clone(),
                uri: self.uri.clone(),
                rng: StdRng::from_rng(&mut self.rng),
                minimum_length: self.minimum_length as usize,
                maximum_length: self.maximum_length as usize,
                labels: self.metric_labels.clone(),
            };
            workers.spawn(worker.run());
        }

        let deadline = sleep(self.duration);
        tokio::pin!(deadline);
        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                () = &mut deadline => {
                    info!("workload duration elapsed");
                    break;
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    break;
                }
                Some(res) = workers.join_next() => {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            error!("Worker exited unexpectedly: {err}");
                            return Err(err);
                        }
                        Err(err) => error!("Could not join worker task: {err}"),
                    }
                }
            }
        }
        // Any in-flight request is abandoned, not drained.
        workers.shutdown().await;
        Ok(())
    }
}

#[derive(Serialize)]
struct EnqueueRequest<'a> {
    message: &'a str,
}

struct Worker {
    client: HttpClient,
    uri: Uri,
    rng: StdRng,
    minimum_length: usize,
    maximum_length: usize,
    labels: Vec<(String, String)>,
}

impl Worker {
    async fn run(mut self) -> Result<(), Error> {
        loop {
            self.enqueue_one().await?;
        }
    }

    async fn enqueue_one(&mut self) -> Result<(), Error> {
        let length = self
            .rng
            .random_range(self.minimum_length..=self.maximum_length);
        let message = payload::alphanumeric(&mut self.rng, length);
        let body = serde_json::to_vec(&EnqueueRequest { message: &message })?;
        let body_length = body.len();

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, body_length)
            .body(crate::full(body))?;

        counter!("requests_sent", &self.labels).increment(1);
        match self.client.request(request).await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::OK {
                    counter!("messages_enqueued", &self.labels).increment(1);
                    counter!("bytes_written", &self.labels).increment(body_length as u64);
                } else {
                    // A refusal is not counted as success and is not fatal;
                    // the caller simply moves on to its next request.
                    let mut status_labels = self.labels.clone();
                    status_labels.push(("status_code".to_string(), status.as_u16().to_string()));
                    counter!("request_failure", &status_labels).increment(1);
                }
            }
            Err(err) => {
                error!("Failed to send enqueue request to {uri}: {err}", uri = self.uri);
                let mut error_labels = self.labels.clone();
                error_labels.push(("error".to_string(), err.to_string()));
                counter!("request_failure", &error_labels).increment(1);
            }
        }
        Ok(())
    }
}
