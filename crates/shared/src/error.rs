use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status 0 means the request never produced an HTTP response
/// (connection refused, timeout, invalid URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("backend request failed: status={status} body={body:?}")]
pub struct FetchError {
    pub status: u16,
    pub body: String,
}

impl FetchError {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self {
            status: 0,
            body: detail.into(),
        }
    }

    pub fn is_network(&self) -> bool {
        self.status == 0
    }
}
