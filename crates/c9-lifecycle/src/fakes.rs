//! In-memory response sender (testing only)

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{LifecycleError, Result};
use crate::response::{ResponseDocument, ResponseSender};

/// Records every response instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, ResponseDocument)>>,
    reject_with: Option<u16>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record, then fail as if the callback URL answered `status`.
    pub fn rejecting(status: u16) -> Self {
        Self {
            reject_with: Some(status),
            ..Self::default()
        }
    }

    /// `(response_url, document)` pairs, in send order.
    pub fn sent(&self) -> Vec<(String, ResponseDocument)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseSender for RecordingSender {
    async fn send(&self, response_url: &str, document: &ResponseDocument) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((response_url.to_string(), document.clone()));

        match self.reject_with {
            Some(status) => Err(LifecycleError::Callback {
                status,
                body: "<Error><Code>AccessDenied</Code></Error>".to_string(),
            }),
            None => Ok(()),
        }
    }
}
