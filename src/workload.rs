//! Hopper workloads
//!
//! A hopper workload pushes traffic at the target message-queue service, the
//! variants of [`Server`]. Each workload works in the same basic way: a fixed
//! pool of concurrent logical callers is spun up and each caller issues its
//! operation in a closed loop, one request at a time, until the workload
//! duration elapses or shutdown is signaled. The workloads share no state and
//! interact only through the queue held by the target service.

use serde::{Deserialize, Serialize};

use crate::signals;

pub(crate) mod common;
pub mod consumer;
pub mod producer;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`].
pub enum Error {
    /// See [`crate::workload::producer::Error`] for details.
    #[error(transparent)]
    Producer(#[from] producer::Error),
    /// See [`crate::workload::consumer::Error`] for details.
    #[error(transparent)]
    Consumer(#[from] consumer::Error),
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Server`]
pub struct Config {
    /// Common workload configs
    #[serde(flatten)]
    pub general: General,
    /// The workload config
    #[serde(flatten)]
    pub inner: Inner,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configurations common to all [`Server`] variants
pub struct General {
    /// The ID assigned to this workload
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Server`]
pub enum Inner {
    /// See [`crate::workload::producer::Config`] for details.
    Producer(producer::Config),
    /// See [`crate::workload::consumer::Config`] for details.
    Consumer(consumer::Config),
}

#[derive(Debug)]
/// The workload server.
///
/// All workloads supported by hopper are a variant of this enum. Please see
/// variant documentation for details.
pub enum Server {
    /// See [`crate::workload::producer::Producer`] for details.
    Producer(producer::Producer),
    /// See [`crate::workload::consumer::Consumer`] for details.
    Consumer(consumer::Consumer),
}

impl Server {
    /// Create a new [`Server`]
    ///
    /// This function creates a new [`Server`] instance, deferring to the
    /// underlying sub-server.
    ///
    /// # Errors
    ///
    /// Function will return an error if the underlying sub-server creation
    /// signals error.
    pub fn new(config: Config, shutdown: signals::Watcher) -> Result<Self, Error> {
        let srv = match config.inner {
            Inner::Producer(conf) => {
                Self::Producer(producer::Producer::new(config.general, conf, shutdown)?)
            }
            Inner::Consumer(conf) => {
                Self::Consumer(consumer::Consumer::new(config.general, &conf, shutdown))
            }
        };
        Ok(srv)
    }

    /// Run this [`Server`] to completion
    ///
    /// This function runs the sub-server to its completion, or until a
    /// shutdown signal is received.
    ///
    /// # Errors
    ///
    /// Function will return an error if the underlying sub-server signals
    /// error.
    pub async fn run(self) -> Result<(), Error> {
        match self {
            Server::Producer(inner) => inner.spin().await?,
            Server::Consumer(inner) => inner.spin().await?,
        }

        Ok(())
    }
}
