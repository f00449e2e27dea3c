//! Detection service client.
//!
//! [`DetectionService`] is the seam between the monitoring engine and the
//! remote analysis backend. [`HttpDetectionClient`] speaks the JSON
//! protocol over blocking `ureq` calls moved onto tokio's blocking pool.

use proctor_common::config::ServiceConfig;
use proctor_common::{
    AnalyzeFrameRequest, AnalyzeFrameResponse, GetViolationsResponse, ProctorError,
    RecordedViolation, ReportViolationRequest, SessionIds,
};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Remote frame analysis and violation records.
pub trait DetectionService: Send + Sync + 'static {
    /// Submit one frame for hybrid analysis.
    fn analyze_frame(
        &self,
        request: AnalyzeFrameRequest,
    ) -> impl Future<Output = Result<AnalyzeFrameResponse, ProctorError>> + Send;

    /// Record a violation. Callers treat this as fire-and-forget.
    fn report_violation(
        &self,
        request: ReportViolationRequest,
    ) -> impl Future<Output = Result<(), ProctorError>> + Send;

    /// All recorded violations of a session, newest first.
    fn fetch_violations(
        &self,
        ids: &SessionIds,
    ) -> impl Future<Output = Result<Vec<RecordedViolation>, ProctorError>> + Send;
}

/// HTTP client for the detection service.
#[derive(Clone)]
pub struct HttpDetectionClient {
    agent: ureq::Agent,
    base_url: Arc<str>,
}

impl HttpDetectionClient {
    pub fn new(config: &ServiceConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(config.request_timeout())
            .build()
            .into();
        Self {
            agent,
            base_url: Arc::from(config.base_url.trim_end_matches('/')),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post_json<B, T>(&self, path: &'static str, body: B) -> Result<T, ProctorError>
    where
        B: serde::Serialize + Send + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let agent = self.agent.clone();
        let url = self.url(path);
        tokio::task::spawn_blocking(move || {
            let mut response = agent.post(&url).send_json(&body).map_err(transport_error)?;
            response
                .body_mut()
                .read_json::<T>()
                .map_err(|e| ProctorError::Protocol(format!("{path}: {e}")))
        })
        .await
        .map_err(|e| ProctorError::Transport(format!("request task failed: {e}")))?
    }
}

fn transport_error(err: ureq::Error) -> ProctorError {
    match err {
        ureq::Error::StatusCode(code) => ProctorError::Rejected(format!("HTTP {code}")),
        other => ProctorError::Transport(other.to_string()),
    }
}

impl DetectionService for HttpDetectionClient {
    async fn analyze_frame(
        &self,
        request: AnalyzeFrameRequest,
    ) -> Result<AnalyzeFrameResponse, ProctorError> {
        let response: AnalyzeFrameResponse = self.post_json("hybrid_analyze", request).await?;
        if !response.success {
            return Err(ProctorError::Rejected("analysis unsuccessful".into()));
        }
        Ok(response)
    }

    async fn report_violation(&self, request: ReportViolationRequest) -> Result<(), ProctorError> {
        let kind = request.violation_type;
        let ack: serde_json::Value = self.post_json("report_violation", request).await?;
        if ack.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let reason = ack
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(ProctorError::Rejected(reason));
        }
        debug!(%kind, "Violation recorded");
        Ok(())
    }

    async fn fetch_violations(
        &self,
        ids: &SessionIds,
    ) -> Result<Vec<RecordedViolation>, ProctorError> {
        let agent = self.agent.clone();
        let url = self.url("get_violations");
        let ids = ids.clone();
        let response: GetViolationsResponse = tokio::task::spawn_blocking(move || {
            let mut response = agent
                .get(&url)
                .query("student_id", &ids.student_id)
                .query("exam_id", &ids.exam_id)
                .call()
                .map_err(transport_error)?;
            response
                .body_mut()
                .read_json::<GetViolationsResponse>()
                .map_err(|e| ProctorError::Protocol(format!("get_violations: {e}")))
        })
        .await
        .map_err(|e| ProctorError::Transport(format!("request task failed: {e}")))??;

        if !response.success {
            let reason = response.error.unwrap_or_else(|| "unknown error".into());
            warn!(%reason, "Violation fetch rejected");
            return Err(ProctorError::Rejected(reason));
        }
        Ok(response.violations)
    }
}
