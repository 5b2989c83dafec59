use std::collections::HashMap;

use crate::buffer::SmartBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    PATCH,
    OPTIONS,
}

impl Method {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "PATCH" => Some(Method::PATCH),
            "OPTIONS" => Some(Method::OPTIONS),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::PATCH => "PATCH",
            Method::OPTIONS => "OPTIONS",
        }
    }
}

/// A fully parsed request.
///
/// Header names are stored in canonical `Title-Case-Dash` form; lookups
/// through [`HttpRequest::header`] must use that casing. The body lives
/// in a [`SmartBuffer`] so large uploads spill to disk instead of
/// accumulating in memory.
pub struct HttpRequest {
    pub method: Method,
    /// Percent-decoded path plus query string.
    pub uri: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    /// Number of header lines observed, including any the map collapsed.
    pub header_count: usize,
    pub body: SmartBuffer,
    pub total_body_size: usize,
}

impl HttpRequest {
    pub fn new(body: SmartBuffer) -> Self {
        Self {
            method: Method::GET,
            uri: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            header_count: 0,
            body,
            total_body_size: 0,
        }
    }

    /// Looks up a header by its canonical name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn cookie_header(&self) -> Option<&str> {
        self.header("Cookie")
    }

    pub fn keep_alive(&self) -> bool {
        self.header("Connection")
            .map(|v| !v.eq_ignore_ascii_case("close"))
            .unwrap_or(true) // HTTP/1.1 default
    }
}
