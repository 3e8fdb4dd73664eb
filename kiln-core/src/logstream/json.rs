//! Log writer for runtimes that emit a chunked JSON object stream.

use super::{LogRecord, LogWriter, ProgressFilter};
use crate::error::{KilnError, Result};
use crate::rpc::ManagerClient;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Consumes concatenated JSON objects split across arbitrary `write`
/// boundaries, filters low-value progress entries, and republishes the
/// rest through the manager client.
///
/// The runtime sometimes hands over only the beginning of an object;
/// whatever fails to decode at the tail of a chunk is carried over and
/// prepended to the next one.
pub struct JsonLogWriter {
    client: Arc<dyn ManagerClient>,
    carry: Mutex<Vec<u8>>,
    last_error: Mutex<Option<String>>,
    filter: Mutex<ProgressFilter>,
}

impl JsonLogWriter {
    pub fn new(client: Arc<dyn ManagerClient>) -> Self {
        Self {
            client,
            carry: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            filter: Mutex::new(ProgressFilter::default()),
        }
    }

    /// Splits `chunk` (prefixed by any carry-over) into complete records,
    /// stashing a partial trailing object for the next call.
    fn decode(&self, chunk: &[u8]) -> Result<Vec<LogRecord>> {
        let mut buf = std::mem::take(&mut *self.carry.lock().expect("carry lock poisoned"));
        buf.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut consumed = buf.len();
        let mut stream = serde_json::Deserializer::from_slice(&buf).into_iter::<LogRecord>();
        loop {
            match stream.next() {
                Some(Ok(record)) => {
                    consumed = stream.byte_offset();
                    records.push(record);
                }
                // The object was split mid-way; keep the tail for the
                // next write.
                Some(Err(err)) if err.is_eof() => {
                    consumed = stream.byte_offset();
                    break;
                }
                Some(Err(err)) => {
                    let entry = String::from_utf8_lossy(&buf[stream.byte_offset()..]);
                    return Err(KilnError::Internal(format!(
                        "corrupt runtime log stream: {err}; failed entry: {entry}"
                    )));
                }
                None => {
                    consumed = buf.len();
                    break;
                }
            }
        }

        if consumed < buf.len() {
            *self.carry.lock().expect("carry lock poisoned") = buf[consumed..].to_vec();
        }

        Ok(records)
    }
}

#[async_trait]
impl LogWriter for JsonLogWriter {
    async fn write(&self, chunk: &[u8]) -> Result<()> {
        let records = self.decode(chunk)?;

        for record in records {
            if !record.error.is_empty() {
                *self.last_error.lock().expect("error lock poisoned") = Some(record.error);
            } else {
                let skip = self
                    .filter
                    .lock()
                    .expect("filter lock poisoned")
                    .should_skip(&record);
                if !skip {
                    let entry = serde_json::to_string(&record)
                        .map_err(|err| KilnError::Internal(format!("marshaling log entry: {err}")))?;
                    self.client.publish_build_log_entry(&entry).await?;
                }
            }

            // With a large batch of messages the publish loop can hog the
            // executor; give the heartbeat a chance to run.
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    fn err_response(&self) -> Option<String> {
        self.last_error.lock().expect("error lock poisoned").take()
    }

    fn reset_error(&self) {
        *self.last_error.lock().expect("error lock poisoned") = None;
    }
}
