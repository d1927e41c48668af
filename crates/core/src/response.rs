//! Materialized responses and logical-error detection.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;

use crate::store::ContentStore;
use crate::CourierError;

/// Where a response body lives.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    /// Buffered in memory.
    Memory(Bytes),
    /// Streamed to a destination path during execution. Read back through
    /// the operation's [`ContentStore`].
    File(PathBuf),
}

/// A finished HTTP response attached to a terminal operation.
#[derive(Debug, Clone)]
pub struct Response {
    status_code: u16,
    headers: HashMap<String, String>,
    body: ResponseBody,
}

impl Response {
    /// Response buffered in memory.
    #[must_use]
    pub fn in_memory(status_code: u16, headers: HashMap<String, String>, body: Bytes) -> Self {
        Self {
            status_code,
            headers,
            body: ResponseBody::Memory(body),
        }
    }

    /// Response whose body was written to `path`.
    #[must_use]
    pub fn in_file(status_code: u16, headers: HashMap<String, String>, path: PathBuf) -> Self {
        Self {
            status_code,
            headers,
            body: ResponseBody::File(path),
        }
    }

    /// HTTP status code.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Where the body lives.
    #[must_use]
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Load the body bytes, reading back through `store` for file bodies.
    pub fn bytes(&self, store: &dyn ContentStore) -> Result<Bytes, CourierError> {
        match &self.body {
            ResponseBody::Memory(bytes) => Ok(bytes.clone()),
            ResponseBody::File(path) => store.load(path).map(Bytes::from),
        }
    }
}

/// Detect the logical-error convention: a JSON array containing exactly one
/// object with an error-shaped field (`error`, `errorCode`, or `message`).
///
/// Such a payload arrives with a 2xx status but represents an
/// application-level failure; the engine promotes it to
/// [`CourierError::LogicalPayload`] so error observers fire instead of
/// completion observers. Non-JSON and any other JSON shape pass.
#[must_use]
pub fn detect_logical_error(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let array = value.as_array()?;
    if array.len() != 1 {
        return None;
    }
    let object = array[0].as_object()?;
    for field in ["error", "errorCode", "message"] {
        if let Some(v) = object.get(field) {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Some(text);
        }
    }
    None
}
