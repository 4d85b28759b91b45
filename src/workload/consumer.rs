//! The message-consuming workload.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of fetch and removal requests sent
//! `messages_fetched`: Fetches that returned at least one message
//! `messages_acknowledged`: Removals the target accepted with status 200
//! `bytes_read`: Total fetch response body bytes read
//! `ack_failure`: Removals refused by the target or lost in transit
//! `request_failure`: Fetches refused by the target or lost in transit
//! `response_decode_failure`: Fetch bodies that did not decode as a message list
//!

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::BodyExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::{task::JoinSet, time::sleep};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    General,
    common::{self, HttpClient, MetricsBuilder},
};
use crate::signals;

fn default_parallel_callers() -> u16 {
    10
}

fn default_duration_seconds() -> u64 {
    60
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of this workload.
pub struct Config {
    /// The URI of the target's message endpoint, must be a valid URI
    #[serde(with = "http_serde::uri")]
    pub target_uri: Uri,
    /// The number of concurrent logical callers to maintain
    #[serde(default = "default_parallel_callers")]
    pub parallel_callers: u16,
    /// The wall-clock seconds this workload runs for
    #[serde(default = "default_duration_seconds")]
    pub duration_seconds: u64,
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Consumer`].
pub enum Error {
    /// Wrapper around [`hyper::http::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
}

/// The message-consuming workload.
///
/// This workload drains the target's queue: each caller repeatedly fetches at
/// most one message under a fresh caller identity and, when a message comes
/// back, acknowledges it with a removal request.
#[derive(Debug)]
pub struct Consumer {
    uri: Uri,
    parallel_callers: u16,
    duration: Duration,
    metric_labels: Vec<(String, String)>,
    shutdown: signals::Watcher,
}

impl Consumer {
    /// Create a new [`Consumer`] instance
    pub fn new(general: General, config: &Config, shutdown: signals::Watcher) -> Self {
        let labels = MetricsBuilder::new("consumer").with_id(general.id).build();

        Self {
            uri: config.target_uri.clone(),
            parallel_callers: config.parallel_callers,
            duration: Duration::from_secs(config.duration_seconds),
            metric_labels: labels,
            shutdown,
        }
    }

    /// Run [`Consumer`] to completion or until a shutdown signal is received.
    ///
    /// Spawns one worker per configured caller, each issuing fetch/remove
    /// request pairs in a closed loop. When the workload duration elapses or
    /// shutdown is signaled, in-flight requests are abandoned without
    /// cleanup.
    ///
    /// # Errors
    ///
    /// Function will return an error if a worker fails to construct an HTTP
    /// request for the target.
    pub async fn spin(mut self) -> Result<(), Error> {
        let client = common::build_client(self.parallel_callers);

        let mut workers = JoinSet::new();
        for _ in 0..self.parallel_callers {
            let worker = Worker {
                client: client.clone(),
                uri: self.uri.clone(),
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

#[derive(Debug, Deserialize)]
struct FetchedMessage {
    #[serde(rename = "messageId")]
    message_id: String,
    /// The message body. Read only for accounting; the target also returns
    /// it on fetch.
    #[serde(default)]
    #[allow(dead_code)]
    message: Option<String>,
}

struct Worker {
    client: HttpClient,
    uri: Uri,
    labels: Vec<(String, String)>,
}

impl Worker {
    async fn run(mut self) -> Result<(), Error> {
        loop {
            self.consume_one().await?;
        }
    }

    /// Fetch at most one message under a fresh caller identity, acknowledging
    /// it if the target returned one. Every terminal state short of a
    /// malformed request simply ends the iteration.
    async fn consume_one(&mut self) -> Result<(), Error> {
        let client_id = Uuid::new_v4();
        let uri = common::uri_with_query(&self.uri, &format!("clientId={client_id}&count=1"))?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(crate::full(Bytes::new()))?;

        counter!("requests_sent", &self.labels).increment(1);
        let response = match self.client.request(request).await {
            Ok(response) => response,
            Err(err) => {
                error!("Failed to send fetch request to {uri}: {err}", uri = self.uri);
                let mut error_labels = self.labels.clone();
                error_labels.push(("error".to_string(), err.to_string()));
                counter!("request_failure", &error_labels).increment(1);
                return Ok(());
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            let mut status_labels = self.labels.clone();
            status_labels.push(("status_code".to_string(), status.as_u16().to_string()));
            counter!("request_failure", &status_labels).increment(1);
            return Ok(());
        }

        let body = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!("Failed to read fetch response body: {err}");
                let mut error_labels = self.labels.clone();
                error_labels.push(("error".to_string(), err.to_string()));
                counter!("request_failure", &error_labels).increment(1);
                return Ok(());
            }
        };
        counter!("bytes_read", &self.labels).increment(body.len() as u64);

        let messages: Vec<FetchedMessage> = match serde_json::from_slice(&body) {
            Ok(messages) => messages,
            Err(err) => {
                warn!("Fetch response body did not decode as a message list: {err}");
                counter!("response_decode_failure", &self.labels).increment(1);
                return Ok(());
            }
        };

        let Some(message) = messages.first() else {
            // Queue is empty. Normal, no removal request is issued.
            return Ok(());
        };
        counter!("messages_fetched", &self.labels).increment(1);

        self.acknowledge(&message.message_id, client_id).await
    }

    /// Issue the removal request for `message_id`. The status check is for
    /// reporting only; a refused removal never halts the workload.
    async fn acknowledge(&mut self, message_id: &str, client_id: Uuid) -> Result<(), Error> {
        let uri = common::uri_with_query(
            &self.uri,
            &format!("messageId={message_id}&clientId={client_id}"),
        )?;
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(crate::full(Bytes::new()))?;

        counter!("requests_sent", &self.labels).increment(1);
        match self.client.request(request).await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::OK {
                    counter!("messages_acknowledged", &self.labels).increment(1);
                } else {
                    warn!("Removal of message {message_id} returned status {status}");
                    let mut status_labels = self.labels.clone();
                    status_labels.push(("status_code".to_string(), status.as_u16().to_string()));
                    counter!("ack_failure", &status_labels).increment(1);
                }
            }
            Err(err) => {
                error!("Failed to send removal request to {uri}: {err}", uri = self.uri);
                let mut error_labels = self.labels.clone();
                error_labels.push(("error".to_string(), err.to_string()));
                counter!("ack_failure", &error_labels).increment(1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use std::time::Duration;

    use tokio::time::sleep;
    use warp::Filter;

    use super::{Config, Consumer};
    use crate::{signals, workload::General};

    #[derive(Debug, Default)]
    struct ServiceLog {
        fetch_client_ids: Vec<String>,
        removals: Vec<(String, String)>,
    }

    fn config_for(addr: std::net::SocketAddr) -> Config {
        Config {
            target_uri: format!("http://{addr}/messages")
                .parse()
                .expect("valid uri"),
            parallel_callers: 1,
            duration_seconds: 60,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_message_is_fetched_then_removed() {
        let log: Arc<Mutex<ServiceLog>> = Arc::new(Mutex::new(ServiceLog::default()));
        let delivered = Arc::new(AtomicUsize::new(0));

        let get_log = Arc::clone(&log);
        let get_delivered = Arc::clone(&delivered);
        let get = warp::get()
            .and(warp::path("messages"))
            .and(warp::query::<HashMap<String, String>>())
            .map(move |query: HashMap<String, String>| {
                let client_id = query.get("clientId").cloned().unwrap_or_default();
                assert_eq!(query.get("count").map(String::as_str), Some("1"));
                if get_delivered.fetch_add(1, Ordering::SeqCst) == 0 {
                    get_log
                        .lock()
                        .expect("lock poisoned")
                        .fetch_client_ids
                        .push(client_id);
                    warp::reply::json(&serde_json::json!([
                        {"messageId": "abc", "message": "hello"}
                    ]))
                } else {
                    warp::reply::json(&serde_json::json!([]))
                }
            });

        let delete_log = Arc::clone(&log);
        let delete = warp::delete()
            .and(warp::path("messages"))
            .and(warp::query::<HashMap<String, String>>())
            .map(move |query: HashMap<String, String>| {
                delete_log.lock().expect("lock poisoned").removals.push((
                    query.get("messageId").cloned().unwrap_or_default(),
                    query.get("clientId").cloned().unwrap_or_default(),
                ));
                warp::reply()
            });

        let (addr, serve_fut) = warp::serve(get.or(delete)).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server_handle = tokio::spawn(serve_fut);

        let (shutdown_watcher, shutdown_broadcast) = signals::signal();
        let consumer = Consumer::new(
            General {
                id: Some("consumer-single-test".to_string()),
            },
            &config_for(addr),
            shutdown_watcher,
        );
        let spin = tokio::spawn(consumer.spin());

        sleep(Duration::from_millis(500)).await;
        shutdown_broadcast.signal();
        spin.await
            .expect("spin task panicked")
            .expect("spin errored");

        let log = log.lock().expect("lock poisoned");
        assert_eq!(log.removals.len(), 1);
        let (message_id, client_id) = &log.removals[0];
        assert_eq!(message_id, "abc");
        // The removal is scoped by the same caller identity the fetch used.
        assert_eq!(client_id, &log.fetch_client_ids[0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_queue_issues_no_removals() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let removals = Arc::new(AtomicUsize::new(0));

        let get_fetches = Arc::clone(&fetches);
        let get = warp::get().and(warp::path("messages")).map(move || {
            get_fetches.fetch_add(1, Ordering::SeqCst);
            warp::reply::json(&serde_json::json!([]))
        });
        let delete_removals = Arc::clone(&removals);
        let delete = warp::delete().and(warp::path("messages")).map(move || {
            delete_removals.fetch_add(1, Ordering::SeqCst);
            warp::reply()
        });

        let (addr, serve_fut) = warp::serve(get.or(delete)).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server_handle = tokio::spawn(serve_fut);

        let (shutdown_watcher, shutdown_broadcast) = signals::signal();
        let consumer = Consumer::new(
            General {
                id: Some("consumer-empty-test".to_string()),
            },
            &config_for(addr),
            shutdown_watcher,
        );
        let spin = tokio::spawn(consumer.spin());

        sleep(Duration::from_millis(500)).await;
        shutdown_broadcast.signal();
        spin.await
            .expect("spin task panicked")
            .expect("spin errored");

        assert!(fetches.load(Ordering::SeqCst) >= 1);
        assert_eq!(removals.load(Ordering::SeqCst), 0);
    }

    // The same message delivered twice: the first removal succeeds, the
    // second is refused. The workload must issue both and carry on.
    #[tokio::test(flavor = "multi_thread")]
    async fn refused_second_removal_is_not_fatal() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let removals = Arc::new(AtomicUsize::new(0));

        let get_delivered = Arc::clone(&delivered);
        let get = warp::get().and(warp::path("messages")).map(move || {
            if get_delivered.fetch_add(1, Ordering::SeqCst) < 2 {
                warp::reply::json(&serde_json::json!([
                    {"messageId": "abc", "message": "hello"}
                ]))
            } else {
                warp::reply::json(&serde_json::json!([]))
            }
        });
        let delete_removals = Arc::clone(&removals);
        let delete = warp::delete().and(warp::path("messages")).map(move || {
            let status = if delete_removals.fetch_add(1, Ordering::SeqCst) == 0 {
                warp::http::StatusCode::OK
            } else {
                warp::http::StatusCode::NOT_FOUND
            };
            warp::reply::with_status(warp::reply(), status)
        });

        let (addr, serve_fut) = warp::serve(get.or(delete)).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server_handle = tokio::spawn(serve_fut);

        let (shutdown_watcher, shutdown_broadcast) = signals::signal();
        let consumer = Consumer::new(
            General {
                id: Some("consumer-double-ack-test".to_string()),
            },
            &config_for(addr),
            shutdown_watcher,
        );
        let spin = tokio::spawn(consumer.spin());

        sleep(Duration::from_millis(500)).await;
        shutdown_broadcast.signal();
        spin.await
            .expect("spin task panicked")
            .expect("spin errored");

        assert_eq!(removals.load(Ordering::SeqCst), 2);
    }
}
