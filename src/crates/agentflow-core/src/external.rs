//! Human-in-the-loop request/response contract
//!
//! An [`ExternalInputRequest`] suspends the run; the matching
//! [`ExternalInputResponse`] resumes it. The two are correlated by the
//! request's content id - for approval flows that is the proposed call id
//! embedded in the message content. A response that does not match any
//! outstanding request (wrong id or wrong shape) is rejected and the run
//! stays suspended.

use crate::envelope::{DeliveryId, ExecutorId};
use crate::messages::ChatMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request published by an executor asking the run to suspend for input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalInputRequest {
    /// Unique request id
    pub request_id: String,

    /// Executor the eventual response is routed back to
    pub executor_id: ExecutorId,

    /// Delivery cohort of the envelope being handled when the request was
    /// raised; the response envelope rejoins it
    pub delivery_id: DeliveryId,

    /// Chat-message-shaped payload, possibly carrying an approval request
    pub message: ChatMessage,
}

impl ExternalInputRequest {
    /// Create a request with a fresh id
    pub fn new(
        executor_id: impl Into<ExecutorId>,
        delivery_id: impl Into<DeliveryId>,
        message: ChatMessage,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            executor_id: executor_id.into(),
            delivery_id: delivery_id.into(),
            message,
        }
    }

    /// Correlation id: the approval call id when present, else message id
    pub fn content_id(&self) -> String {
        self.message.content_id()
    }
}

/// Response supplied by the caller to resume a suspended run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalInputResponse {
    /// Explicit request id; when absent, correlation is by content id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Chat message carrying the approval/denial or other requested input
    pub message: ChatMessage,
}

impl ExternalInputResponse {
    /// Response correlated by content id only
    pub fn new(message: ChatMessage) -> Self {
        Self {
            request_id: None,
            message,
        }
    }

    /// Response targeting a specific request id
    pub fn for_request(request_id: impl Into<String>, message: ChatMessage) -> Self {
        Self {
            request_id: Some(request_id.into()),
            message,
        }
    }
}

/// Find the pending request a response answers
///
/// Correlation rules, in order:
/// 1. An explicit `request_id` must name a pending request.
/// 2. Otherwise the response's content id must equal a pending request's
///    content id.
/// 3. If the matched request carries an approval request, the response
///    must carry an approval response for the same call id.
///
/// Returns the index into `pending`, or the rejection reason.
pub fn match_response(
    pending: &[ExternalInputRequest],
    response: &ExternalInputResponse,
) -> Result<usize, String> {
    let index = match &response.request_id {
        Some(request_id) => pending
            .iter()
            .position(|r| &r.request_id == request_id)
            .ok_or_else(|| format!("no pending request with id '{}'", request_id))?,
        None => {
            let content_id = response.message.content_id();
            pending
                .iter()
                .position(|r| r.content_id() == content_id)
                .ok_or_else(|| {
                    format!("no pending request with content id '{}'", content_id)
                })?
        }
    };

    let request = &pending[index];
    if let Some((call_id, _, _)) = request.message.approval_request_part() {
        match response.message.approval_response_part() {
            Some((response_call_id, _)) if response_call_id == call_id => {}
            Some((response_call_id, _)) => {
                return Err(format!(
                    "approval response for call '{}' does not match requested call '{}'",
                    response_call_id, call_id
                ));
            }
            None => {
                return Err(format!(
                    "request '{}' expects an approval response for call '{}'",
                    request.request_id, call_id
                ));
            }
        }
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approval_pending() -> Vec<ExternalInputRequest> {
        vec![ExternalInputRequest::new(
            "agent",
            "d-1",
            ChatMessage::approval_request("call-42", "send_email", json!({})),
        )]
    }

    #[test]
    fn test_match_by_content_id() {
        let pending = approval_pending();
        let response = ExternalInputResponse::new(ChatMessage::approval_response("call-42", true));
        assert_eq!(match_response(&pending, &response), Ok(0));
    }

    #[test]
    fn test_match_by_request_id() {
        let pending = approval_pending();
        let response = ExternalInputResponse::for_request(
            pending[0].request_id.clone(),
            ChatMessage::approval_response("call-42", false),
        );
        assert_eq!(match_response(&pending, &response), Ok(0));
    }

    #[test]
    fn test_wrong_call_id_rejected() {
        let pending = approval_pending();
        let response = ExternalInputResponse::new(ChatMessage::approval_response("call-99", true));
        assert!(match_response(&pending, &response).is_err());
    }

    #[test]
    fn test_wrong_shape_rejected() {
        let pending = approval_pending();
        let response = ExternalInputResponse::for_request(
            pending[0].request_id.clone(),
            ChatMessage::user("sure, go ahead"),
        );
        assert!(match_response(&pending, &response).is_err());
    }

    #[test]
    fn test_unknown_request_id_rejected() {
        let pending = approval_pending();
        let response = ExternalInputResponse::for_request(
            "nope",
            ChatMessage::approval_response("call-42", true),
        );
        assert!(match_response(&pending, &response).is_err());
    }
}
