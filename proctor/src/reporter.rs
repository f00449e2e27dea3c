//! Fire-and-forget violation reporting.

use crate::service::DetectionService;
use proctor_common::{ProctorError, ReportViolationRequest, SessionIds, ViolationEvent};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Sends violation events to the detection service without blocking the
/// caller. Delivery failures are logged and dropped.
pub struct ViolationReporter<S> {
    service: Arc<S>,
    ids: Option<SessionIds>,
}

impl<S> Clone for ViolationReporter<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            ids: self.ids.clone(),
        }
    }
}

impl<S: DetectionService> ViolationReporter<S> {
    pub fn new(service: Arc<S>, ids: Option<SessionIds>) -> Self {
        Self { service, ids }
    }

    pub fn ids(&self) -> Option<&SessionIds> {
        self.ids.as_ref()
    }

    /// Queue `event` for delivery.
    ///
    /// Fails only when the session identifiers are missing; nothing is sent
    /// in that case. The returned handle may be dropped.
    pub fn report(&self, event: &ViolationEvent) -> Result<JoinHandle<()>, ProctorError> {
        let Some(ids) = &self.ids else {
            warn!(kind = %event.kind, "Student ID or Exam ID not found; violation not reported");
            return Err(ProctorError::MissingSessionIds);
        };

        let request = ReportViolationRequest::from_event(ids, event);
        let service = Arc::clone(&self.service);
        let kind = event.kind;
        Ok(tokio::spawn(async move {
            match service.report_violation(request).await {
                Ok(()) => debug!(%kind, "Violation reported"),
                Err(e) => warn!(%kind, "Failed to report violation: {e}"),
            }
        }))
    }
}
