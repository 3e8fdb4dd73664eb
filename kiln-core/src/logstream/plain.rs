//! Log writer for runtimes that emit plain text output.

use super::{LogRecord, LogWriter};
use crate::error::{KilnError, Result};
use crate::rpc::ManagerClient;
use async_trait::async_trait;
use std::sync::Arc;

/// Wraps each chunk of raw runtime output in a `{"stream": …}` record
/// and publishes it.
///
/// Runtimes on this path report failures through the call's return
/// value, never through the output stream, so there is no error slot to
/// capture: `err_response` always answers "no error".
pub struct PlainLogWriter {
    client: Arc<dyn ManagerClient>,
}

impl PlainLogWriter {
    pub fn new(client: Arc<dyn ManagerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogWriter for PlainLogWriter {
    async fn write(&self, chunk: &[u8]) -> Result<()> {
        let record = LogRecord {
            stream: String::from_utf8_lossy(chunk).into_owned(),
            ..Default::default()
        };

        let entry = serde_json::to_string(&record)
            .map_err(|err| KilnError::Internal(format!("marshaling log entry: {err}")))?;
        self.client.publish_build_log_entry(&entry).await
    }

    fn err_response(&self) -> Option<String> {
        None
    }

    fn reset_error(&self) {}
}
