use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::buffer::{BufferContext, SmartBuffer};

/// Status codes the server emits by name.
pub mod status {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const NO_CONTENT: u16 = 204;
    pub const MOVED_PERMANENTLY: u16 = 301;
    pub const FOUND: u16 = 302;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const CONFLICT: u16 = 409;
    pub const CONTENT_TOO_LARGE: u16 = 413;
    pub const REQUEST_URI_TOO_LONG: u16 = 414;
    pub const UNSUPPORTED_MEDIA_TYPE: u16 = 415;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const GATEWAY_TIMEOUT: u16 = 504;
    pub const HTTP_VERSION_NOT_SUPPORTED: u16 = 505;
}

/// Canonical reason phrase for the codes this server uses; anything else
/// maps to `Unknown`.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        status::OK => "OK",
        status::CREATED => "Created",
        status::NO_CONTENT => "No Content",
        status::MOVED_PERMANENTLY => "Moved Permanently",
        status::FOUND => "Found",
        status::BAD_REQUEST => "Bad Request",
        status::FORBIDDEN => "Forbidden",
        status::NOT_FOUND => "Not Found",
        status::METHOD_NOT_ALLOWED => "Method Not Allowed",
        status::REQUEST_TIMEOUT => "Request Timeout",
        status::CONFLICT => "Conflict",
        status::CONTENT_TOO_LARGE => "Content Too Large",
        status::REQUEST_URI_TOO_LONG => "Request URI Too Long",
        status::UNSUPPORTED_MEDIA_TYPE => "Unsupported Media Type",
        status::INTERNAL_SERVER_ERROR => "Internal Server Error",
        status::NOT_IMPLEMENTED => "Not Implemented",
        status::GATEWAY_TIMEOUT => "Gateway Timeout",
        status::HTTP_VERSION_NOT_SUPPORTED => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

pub fn is_valid_status(code: u16) -> bool {
    (100..600).contains(&code)
}

/// An outgoing response: status line, headers, `Set-Cookie` list and a
/// [`SmartBuffer`] body.
///
/// Responses default to chunked transfer encoding so handlers can stream
/// bodies of unknown length; [`HttpResponse::disable_chunked_encoding`]
/// switches to a `Content-Length` body. The chunked framing itself is
/// produced by the writer layer, not by the header serialization here.
pub struct HttpResponse {
    status: u16,
    status_message: String,
    headers: HashMap<String, String>,
    set_cookies: Vec<String>,
    body: SmartBuffer,
    chunked_encoding: bool,
}

impl HttpResponse {
    pub fn new(ctx: &Rc<BufferContext>, status: u16) -> Self {
        debug_assert!(is_valid_status(status));
        let mut headers = HashMap::new();
        headers.insert("Transfer-Encoding".to_string(), "chunked".to_string());
        Self {
            status,
            status_message: reason_phrase(status).to_string(),
            headers,
            set_cookies: Vec::new(),
            body: SmartBuffer::new(ctx),
            chunked_encoding: true,
        }
    }

    /// Minimal HTML page for a status code, with a dedicated page for 404.
    pub fn html(ctx: &Rc<BufferContext>, status_code: u16, message: &str) -> Self {
        let mut response = Self::new(ctx, status_code);
        let page = if status_code == status::NOT_FOUND {
            not_found_page()
        } else {
            let detail = if message.is_empty() {
                String::new()
            } else {
                format!(": {message}")
            };
            format!(
                "<html><head><title>{code}</title></head>\
                 <body><h1>{code} {reason}{detail}</h1></body></html>",
                code = status_code,
                reason = response.status_message,
            )
        };
        response.set_body(page.as_bytes());
        response.set_header("Content-Type", "text/html");
        response
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    /// Sets the status code, deriving the reason phrase from the table
    /// unless an override is supplied.
    pub fn set_status(&mut self, code: u16, message: Option<&str>) {
        debug_assert!(is_valid_status(code));
        self.status = code;
        self.status_message = match message {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => reason_phrase(code).to_string(),
        };
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Appends to the body. With chunked encoding disabled the
    /// `Content-Length` header is set to the length of this slice.
    pub fn set_body(&mut self, body: &[u8]) {
        self.body.append(body);
        if !self.chunked_encoding {
            self.headers
                .insert("Content-Length".to_string(), body.len().to_string());
        }
    }

    /// Adopts an externally produced body (e.g. a static file buffer) and
    /// streams it chunked.
    pub fn enable_chunked_encoding(&mut self, body: SmartBuffer) {
        self.body = body;
        self.chunked_encoding = true;
        self.headers.remove("Content-Length");
        self.headers
            .insert("Transfer-Encoding".to_string(), "chunked".to_string());
    }

    pub fn disable_chunked_encoding(&mut self) {
        self.chunked_encoding = false;
        self.headers.remove("Transfer-Encoding");
    }

    pub fn is_chunked_encoding(&self) -> bool {
        self.chunked_encoding
    }

    pub fn add_set_cookie(&mut self, cookie: impl Into<String>) {
        self.set_cookies.push(cookie.into());
    }

    pub fn set_cookies(&self) -> &[String] {
        &self.set_cookies
    }

    /// Shared handle to the body buffer.
    pub fn body(&self) -> SmartBuffer {
        self.body.clone()
    }

    /// Serializes the status line, headers and cookie lines, terminated
    /// by the empty line.
    pub fn to_header_string(&self) -> String {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.status_message);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        for cookie in &self.set_cookies {
            out.push_str("Set-Cookie: ");
            out.push_str(cookie);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

/// Header block followed by the body, for in-memory bodies. File-backed
/// bodies render as the header block alone; streaming them is the
/// writer's job.
impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header_string())?;
        if let Some(bytes) = self.body.memory_contents() {
            f.write_str(&String::from_utf8_lossy(&bytes))?;
        }
        Ok(())
    }
}

fn not_found_page() -> String {
    format!(
        "<html><head><title>{code} Not Found</title>\
         <style>\
         body {{ margin: 0; height: 100vh; background: #111; color: white; }}\
         .content {{ position: absolute; top: 50%; left: 50%; \
         transform: translate(-50%, -50%); text-align: center; }}\
         .big-404 {{ font-size: 120px; font-weight: bold; margin: 0; }}\
         </style></head>\
         <body><div class=\"content\">\
         <p class=\"big-404\">404</p><h1>Page Not Found</h1>\
         </div></body></html>",
        code = status::NOT_FOUND,
    )
}
