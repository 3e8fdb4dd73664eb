//! Build-log transcoding between the container runtime and the manager.
//!
//! The runtime adapters write their progress output here and the writer
//! republishes it, entry by entry, over the manager's log stream. There
//! are two variants behind one trait: [`JsonLogWriter`] consumes the
//! chunked JSON object stream a Docker daemon produces, and
//! [`PlainLogWriter`] wraps the raw text lines a podman build produces.
//! Which one a build uses follows the configured runtime.

mod json;
mod plain;

pub use json::JsonLogWriter;
pub use plain::PlainLogWriter;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Progress below this many bytes since the last published entry is not
/// worth a round trip to the manager.
const MIN_PROGRESS_DELTA: i64 = 10_000_000;
const BUFFERING_STATUS: &str = "Buffering to disk";
const PUSHING_STATUS: &str = "Pushing";

/// Sink for container-runtime progress output.
///
/// `write` may be called with arbitrarily split byte chunks; the
/// implementation owns reassembly. A streamed error from the runtime is
/// captured rather than published and can be collected exactly once via
/// `err_response`.
#[async_trait]
pub trait LogWriter: Send + Sync {
    async fn write(&self, chunk: &[u8]) -> Result<()>;

    /// Returns the captured runtime error, clearing it. Subsequent calls
    /// return `None` until another error is streamed.
    fn err_response(&self) -> Option<String>;

    /// Throws away any error state from previously streamed logs.
    fn reset_error(&self);
}

/// Byte-count detail attached to pull/push progress entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDetail {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub current: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total: i64,
}

impl ProgressDetail {
    fn is_empty(&self) -> bool {
        self.current == 0 && self.total == 0
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// One entry of a container runtime's progress stream. Only `error`
/// distinguishes a failure entry; fields the worker does not know are
/// carried through verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(
        default,
        rename = "progressDetail",
        skip_serializing_if = "ProgressDetail::is_empty"
    )]
    pub progress_detail: ProgressDetail,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Suppresses progress entries that moved too little since the entry
/// last sent to the manager.
#[derive(Debug, Default)]
pub(crate) struct ProgressFilter {
    last_sent: Option<LogRecord>,
}

impl ProgressFilter {
    /// Decides whether `record` should be skipped. When the answer is
    /// "publish", the record becomes the new reference point.
    pub(crate) fn should_skip(&mut self, record: &LogRecord) -> bool {
        let skip = match &self.last_sent {
            None => false,
            Some(last) => {
                if record.status == BUFFERING_STATUS && last.status == BUFFERING_STATUS {
                    record.progress_detail.current
                        < last.progress_detail.current + MIN_PROGRESS_DELTA
                } else if record.status == PUSHING_STATUS && last.status == PUSHING_STATUS {
                    // Always send the final chunk of a push.
                    record.progress_detail.current != last.progress_detail.total
                        && record.progress_detail.current
                            < last.progress_detail.current + MIN_PROGRESS_DELTA
                } else {
                    false
                }
            }
        };

        if !skip {
            self.last_sent = Some(record.clone());
        }
        skip
    }
}
