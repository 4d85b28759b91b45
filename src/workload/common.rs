//! Common types for workloads

use bytes::Bytes;
use http::Uri;
use http_body_util::combinators::BoxBody;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

/// The HTTP client type shared by workloads.
pub(crate) type HttpClient = Client<HttpConnector, BoxBody<Bytes, hyper::Error>>;

/// Build an HTTP client sized for `parallel_callers` concurrent requests.
pub(crate) fn build_client(parallel_callers: u16) -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(usize::from(parallel_callers))
        .retry_canceled_requests(false)
        .build_http()
}

/// Rebuild `base` with `query` attached, preserving scheme, authority and
/// path.
pub(crate) fn uri_with_query(base: &Uri, query: &str) -> Result<Uri, http::Error> {
    let path = base.path();
    let mut builder = Uri::builder();
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    builder.path_and_query(format!("{path}?{query}")).build()
}

/// Builder for consistent metric labels across workloads
pub(super) struct MetricsBuilder {
    labels: Vec<(String, String)>,
}

impl MetricsBuilder {
    /// Create a new metrics builder with standard component labels
    pub(super) fn new(component_name: &str) -> Self {
        Self {
            labels: vec![
                ("component".to_string(), "workload".to_string()),
                ("component_name".to_string(), component_name.to_string()),
            ],
        }
    }

    /// Add an ID label if provided
    pub(super) fn with_id(mut self, id: Option<String>) -> Self {
        if let Some(id) = id {
            self.labels.push(("id".to_string(), id));
        }
        self
    }

    /// Build the final label set
    pub(super) fn build(self) -> Vec<(String, String)> {
        self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::uri_with_query;
    use http::Uri;

    #[test]
    fn query_attaches_to_base_path() {
        let base: Uri = "http://localhost:8080/messages"
            .parse()
            .expect("valid uri");
        let uri = uri_with_query(&base, "clientId=abc&count=1").expect("query attach");
        assert_eq!(
            uri.to_string(),
            "http://localhost:8080/messages?clientId=abc&count=1"
        );
    }

    #[test]
    fn existing_query_is_replaced() {
        let base: Uri = "http://localhost:8080/messages?stale=1"
            .parse()
            .expect("valid uri");
        let uri = uri_with_query(&base, "count=1").expect("query attach");
        assert_eq!(uri.to_string(), "http://localhost:8080/messages?count=1");
    }
}
