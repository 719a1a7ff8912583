//! Install telemetry - anonymously bumps a plugin's download count.
//!
//! Reporting is best-effort: every failure is logged and swallowed, nothing is
//! retried, and the installer never waits on it beyond the per-task timeout.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

const PLUGINS_ENDPOINT: &str = "/api/plugins.json";

/// Result of one report. Never escalated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Delivered,
    /// Collector answered with a non-2xx status
    Rejected(u16),
    /// Encoding or transport failure
    Failed(String),
    /// The installer gave up waiting
    TimedOut,
}

impl ReportOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Sink for install notifications
#[async_trait]
pub trait InstallReporter: Send + Sync {
    async fn report(&self, path: &str) -> ReportOutcome;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PluginInstalled<'a> {
    path: &'a str,
}

/// Posts `{"Path": ...}` to the collector
#[derive(Clone)]
pub struct TelemetryReporter {
    client: Client,
    endpoint: String,
}

impl TelemetryReporter {
    pub fn new(collector_base: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, collector_base))
    }

    pub fn with_client(client: Client, collector_base: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}{}", collector_base.trim_end_matches('/'), PLUGINS_ENDPOINT),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl InstallReporter for TelemetryReporter {
    async fn report(&self, path: &str) -> ReportOutcome {
        debug!(path = %path, "Incrementing download count");

        let body = match serde_json::to_vec(&PluginInstalled { path }) {
            Ok(body) => body,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to build telemetry payload");
                return ReportOutcome::Failed(e.to_string());
            }
        };

        let response = match self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to update plugin download count");
                return ReportOutcome::Failed(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(path = %path, status = %status, "Collector rejected download count");
            return ReportOutcome::Rejected(status.as_u16());
        }
        ReportOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_endpoint_joins_base() {
        let reporter = TelemetryReporter::with_client(Client::new(), "https://www.itsabot.org/");
        assert_eq!(reporter.endpoint(), "https://www.itsabot.org/api/plugins.json");
    }

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(PluginInstalled {
            path: "example.org/plug-a",
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"Path": "example.org/plug-a"}));
    }

    #[tokio::test]
    async fn test_report_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/plugins.json"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({"Path": "example.org/plug-a"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = TelemetryReporter::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let outcome = reporter.report("example.org/plug-a").await;
        assert_eq!(outcome, ReportOutcome::Delivered);
        assert!(outcome.is_delivered());
    }

    #[tokio::test]
    async fn test_report_rejected_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reporter = TelemetryReporter::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            reporter.report("example.org/plug-a").await,
            ReportOutcome::Rejected(500)
        );
    }

    #[tokio::test]
    async fn test_report_transport_failure() {
        // Nothing listens on a port we just released
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let reporter = TelemetryReporter::new(&uri, Duration::from_secs(2)).unwrap();
        let outcome = reporter.report("example.org/plug-a").await;
        assert!(matches!(outcome, ReportOutcome::Failed(_)));
    }
}
