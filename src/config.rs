//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program.

use std::net::SocketAddr;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;

use crate::workload;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error for duplicate IDs in workloads
    #[error("Duplicate workload ID found: {0}")]
    DuplicateWorkloadId(String),
}

/// Main configuration struct for this program
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The method by which to express telemetry
    pub telemetry: Option<Telemetry>,
    /// The workloads to apply to the target service
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub workload: Vec<workload::Config>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Defines the manner of hopper's telemetry.
///
/// Hopper emits its internal telemetry for scraping at a prometheus poll
/// endpoint.
pub struct Telemetry {
    /// Address and port for the prometheus exporter
    pub prometheus_addr: SocketAddr,
    /// Additional labels to include in every metric
    #[serde(default)]
    pub global_labels: FxHashMap<String, String>,
}

impl Config {
    /// Parse a [`Config`] from yaml `contents`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the contents are not valid yaml per
    /// the configuration schema or if two workloads carry the same ID.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)?;

        let mut ids = FxHashSet::default();
        for workload in &config.workload {
            if let Some(id) = &workload.general.id {
                if !ids.insert(id.clone()) {
                    return Err(Error::DuplicateWorkloadId(id.clone()));
                }
            }
        }

        Ok(config)
    }
}
