//! HTTP-style request/response framing.
//!
//! Only framing lives here: reading a request line, headers and body off a
//! channel, and serialising a response. What a request means is decided by
//! a [`Router`]; streamed uploads go to an [`UploadStore`].

mod parse;
mod response;
mod server;
mod store;

pub use parse::{parse_head, read_body, read_head, read_request, stream_body};
pub use response::{reason_phrase, Response};
pub use server::{NoUploads, RequestServer, Router, StatusRouter, StoredUpload, UploadSink, UploadStore};
pub use store::DirectoryStore;

use crate::error::FramingError;

/// Header list with case-insensitive lookup. Order is kept for output only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Drop every entry named `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Parsed `Content-Length`, if present.
    pub fn content_length(&self) -> Result<Option<usize>, FramingError> {
        match self.headers.get("content-length") {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| FramingError::ContentLength(raw.to_string())),
        }
    }
}

/// A complete request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub head: RequestHead,
    pub body: Option<Vec<u8>>,
}

impl ParsedRequest {
    pub fn method(&self) -> &str {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        &self.head.path
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        self.body.as_deref().unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_lookup_ignores_case() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        h.insert("X-Trace", "1");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("x-trace"), Some("1"));
        assert!(!h.contains("accept"));
        h.remove("CONTENT-type");
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_content_length_parsing() {
        let mut head = RequestHead {
            method: "POST".into(),
            path: "/".into(),
            version: "HTTP/1.1".into(),
            headers: Headers::new(),
        };
        assert_eq!(head.content_length().unwrap(), None);
        head.headers.insert("content-length", " 42 ");
        assert_eq!(head.content_length().unwrap(), Some(42));
        head.headers.remove("content-length");
        head.headers.insert("Content-Length", "-3");
        assert!(matches!(
            head.content_length(),
            Err(FramingError::ContentLength(_))
        ));
    }
}
