//! Request-body assembly: default form/query encoding, the custom-encoder
//! seam, and deterministic `multipart/form-data` construction.

use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use uuid::Uuid;

/// Default MIME type for attachments that do not declare one.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type produced by [`encode_form`].
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Caller-supplied transform from ordered parameters to a body string.
///
/// Paired with a content type when installed on an operation; overrides the
/// default form encoding for POST/PUT/PATCH.
pub type BodyEncoder = Arc<dyn Fn(&[(String, String)]) -> String + Send + Sync>;

/// One file attachment in a multipart upload.
#[derive(Clone)]
pub struct FilePart {
    /// Raw file bytes.
    pub data: Bytes,
    /// `name=` attribute of the Content-Disposition header. When absent the
    /// attribute is omitted entirely.
    pub field_name: Option<String>,
    /// `filename=` attribute.
    pub file_name: String,
    /// Declared MIME type; [`OCTET_STREAM`] when absent.
    pub mime_type: Option<String>,
}

impl std::fmt::Debug for FilePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePart")
            .field("len", &self.data.len())
            .field("field_name", &self.field_name)
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

fn percent(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Encode ordered parameters as a query / form-urlencoded string.
#[must_use]
pub fn encode_form(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent(k), percent(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Append parameters to a URL as a query string.
#[must_use]
pub fn append_query(url: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return url.to_owned();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{}", encode_form(params))
}

/// Generate a multipart boundary unique to one request attempt.
#[must_use]
pub fn multipart_boundary() -> String {
    format!("courier-{}", Uuid::new_v4().simple())
}

/// Build a `multipart/form-data` body.
///
/// Parameters come first as plain form fields, then attachments in the
/// order they were added. The layout is deterministic for a given boundary:
/// equal inputs produce byte-identical bodies.
#[must_use]
pub fn encode_multipart(
    params: &[(String, String)],
    parts: &[FilePart],
    boundary: &str,
) -> Vec<u8> {
    let mut body = Vec::new();

    for (name, value) in params {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    for part in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        let disposition = match &part.field_name {
            Some(field) => format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"{}\"\r\n",
                part.file_name
            ),
            None => format!(
                "Content-Disposition: form-data; filename=\"{}\"\r\n",
                part.file_name
            ),
        };
        body.extend_from_slice(disposition.as_bytes());
        let mime = part.mime_type.as_deref().unwrap_or(OCTET_STREAM);
        body.extend_from_slice(format!("Content-Type: {mime}\r\n\r\n").as_bytes());
        body.extend_from_slice(&part.data);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

/// Content-Type header value for a multipart body with the given boundary.
#[must_use]
pub fn multipart_content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={boundary}")
}
