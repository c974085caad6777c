//! Request envelope and response shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::WorkerRequest;

/// A request as delivered by the control-plane queue.
///
/// Delivery is at-least-once; `request_id` is the correlation key for the
/// response and for de-duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Queue-assigned request identifier.
    pub request_id: String,

    /// Request kind, e.g. `deploy` or `createContainer`.
    pub request_type: String,

    /// Raw params; decoded by [`RequestEnvelope::decode`].
    #[serde(default)]
    pub params: Value,

    /// Address of the requester. Becomes the owner label on created objects.
    pub user_address: String,

    /// Enqueue time in epoch milliseconds.
    #[serde(default)]
    pub created_at: i64,
}

impl RequestEnvelope {
    /// Decode the params into a typed request.
    pub fn decode(&self) -> Result<WorkerRequest, ProtocolError> {
        if !WorkerRequest::KINDS.contains(&self.request_type.as_str()) {
            return Err(ProtocolError::UnknownRequestType(self.request_type.clone()));
        }

        let params = match &self.params {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        let tagged = serde_json::json!({
            "requestType": self.request_type,
            "params": params,
        });

        serde_json::from_value(tagged).map_err(|e| ProtocolError::InvalidParams {
            request_type: self.request_type.clone(),
            message: e.to_string(),
        })
    }
}

/// Response sent back for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerResponse {
    /// Success payload.
    Success { data: Value },

    /// Failure with a stable status code.
    Failure {
        #[serde(rename = "errorMessage")]
        error_message: String,
        #[serde(rename = "statusCode")]
        status_code: u16,
    },
}

impl WorkerResponse {
    /// Build a success response.
    pub fn success(data: Value) -> Self {
        WorkerResponse::Success { data }
    }

    /// Build a failure response.
    pub fn failure(error_message: impl Into<String>, status_code: u16) -> Self {
        WorkerResponse::Failure {
            error_message: error_message.into(),
            status_code,
        }
    }

    /// Returns true for a success response.
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerResponse::Success { .. })
    }
}
