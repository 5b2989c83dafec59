//! Incremental HTTP/1.1 request parser.
//!
//! The parser is fed raw bytes in whatever fragments the transport
//! delivers and makes forward progress on each call. It walks
//! request-line → headers → body and ends in one of two terminal states:
//! `Complete`, after which the request can be taken, or `Error`, which
//! latches the HTTP status code to answer with and refuses further input.

use std::rc::Rc;
use std::time::Instant;

use bytes::{Buf, BytesMut};

use crate::buffer::{BufferContext, SmartBuffer};
use crate::config::LimitsConfig;
use crate::http::request::{HttpRequest, Method};
use crate::http::response::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Complete,
    Error,
}

/// Invoked with the `Host` value when the first `Host` header arrives, so
/// the virtual-host layer can pick a server before the body shows up.
pub type HostCallback = Box<dyn FnMut(&str)>;

pub struct Parser {
    state: ParseState,
    limits: LimitsConfig,
    ctx: Rc<BufferContext>,
    buffer: BytesMut,
    request: HttpRequest,
    content_length: usize,
    chunked_transfer: bool,
    chunk_size: usize,
    has_chunk_size: bool,
    error_status: u16,
    header_start: Option<Instant>,
    body_start: Option<Instant>,
    on_host: Option<HostCallback>,
}

impl Parser {
    pub fn new(limits: LimitsConfig, ctx: Rc<BufferContext>) -> Self {
        Self {
            state: ParseState::RequestLine,
            request: HttpRequest::new(SmartBuffer::new(&ctx)),
            limits,
            ctx,
            buffer: BytesMut::new(),
            content_length: 0,
            chunked_transfer: false,
            chunk_size: 0,
            has_chunk_size: false,
            error_status: status::BAD_REQUEST,
            header_start: None,
            body_start: None,
            on_host: None,
        }
    }

    pub fn set_host_callback(&mut self, callback: HostCallback) {
        self.on_host = Some(callback);
    }

    /// Feeds bytes to the state machine. Returns `true` only on the call
    /// that completes the request; a completed or failed parser ignores
    /// further input.
    pub fn parse(&mut self, data: &[u8]) -> bool {
        if matches!(self.state, ParseState::Complete | ParseState::Error) {
            return false;
        }

        self.buffer.extend_from_slice(data);

        let mut need_more = false;
        while !need_more {
            match self.state {
                ParseState::RequestLine => need_more = !self.parse_request_line(),
                ParseState::Headers => need_more = !self.parse_headers(),
                ParseState::Body => need_more = !self.parse_body(),
                ParseState::Complete => return true,
                ParseState::Error => return false,
            }
        }
        false
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// Status code to answer with once the parser is in `Error`.
    pub fn error_status(&self) -> u16 {
        self.error_status
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// When the request line completed; cleared again when the header
    /// block ends. An external watchdog uses this to time out slow peers.
    pub fn header_start(&self) -> Option<Instant> {
        self.header_start
    }

    /// When the header block completed and a body was expected.
    pub fn body_start(&self) -> Option<Instant> {
        self.body_start
    }

    /// Hands the completed request over and readies the parser for the
    /// next one on the connection.
    pub fn take_request(&mut self) -> HttpRequest {
        let fresh = HttpRequest::new(SmartBuffer::new(&self.ctx));
        let request = std::mem::replace(&mut self.request, fresh);
        self.reset_scalars();
        request
    }

    /// Puts the parser back at the request line with a fresh request.
    pub fn reset(&mut self) {
        self.request = HttpRequest::new(SmartBuffer::new(&self.ctx));
        self.reset_scalars();
    }

    fn reset_scalars(&mut self) {
        self.state = ParseState::RequestLine;
        self.buffer.clear();
        self.content_length = 0;
        self.chunked_transfer = false;
        self.chunk_size = 0;
        self.has_chunk_size = false;
        self.error_status = status::BAD_REQUEST;
        self.header_start = None;
        self.body_start = None;
    }

    fn fail(&mut self, code: u16, reason: &str) -> bool {
        tracing::debug!(status = code, reason, "rejecting request");
        self.error_status = code;
        self.state = ParseState::Error;
        false
    }

    fn parse_request_line(&mut self) -> bool {
        let end = match find_crlf(&self.buffer) {
            Some(end) => end,
            None => {
                // No terminator yet. Leave room for a CR that has arrived
                // ahead of its LF before declaring the line oversized.
                if self.buffer.len() > self.limits.max_request_line_size + 1 {
                    return self.fail(status::REQUEST_URI_TOO_LONG, "request line too long");
                }
                return false;
            }
        };

        if end > self.limits.max_request_line_size {
            return self.fail(status::REQUEST_URI_TOO_LONG, "request line too long");
        }

        let line = self.buffer.split_to(end + 2);
        let line = match std::str::from_utf8(&line[..end]) {
            Ok(s) => s,
            Err(_) => return self.fail(status::BAD_REQUEST, "request line is not valid UTF-8"),
        };

        if line.is_empty() || line.starts_with(|c: char| c.is_ascii_whitespace()) {
            return self.fail(status::BAD_REQUEST, "empty or indented request line");
        }
        if line.trim_end() != line {
            return self.fail(status::BAD_REQUEST, "trailing data in request line");
        }

        let mut parts = line.split_ascii_whitespace();
        let (method_str, uri, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (m, u, v),
            _ => return self.fail(status::BAD_REQUEST, "malformed request line"),
        };
        if parts.next().is_some() {
            return self.fail(status::BAD_REQUEST, "extra data in request line");
        }

        let method = match Method::from_str(method_str) {
            Some(m) => m,
            None => return self.fail(status::BAD_REQUEST, "unknown method"),
        };

        if (uri.is_empty() || !uri.starts_with('/')) && !uri.contains("://") {
            return self.fail(status::BAD_REQUEST, "malformed URI");
        }

        let vb = version.as_bytes();
        if vb.len() < 8
            || !version.starts_with("HTTP/")
            || vb[5] != b'1'
            || vb[6] != b'.'
            || vb[7] != b'1'
        {
            return self.fail(status::HTTP_VERSION_NOT_SUPPORTED, "unsupported HTTP version");
        }

        self.request.method = method;
        self.request.uri = decode_uri(uri);
        self.request.version = version.to_string();

        self.state = ParseState::Headers;
        self.header_start = Some(Instant::now());
        true
    }

    fn parse_headers(&mut self) -> bool {
        loop {
            let end = match find_crlf(&self.buffer) {
                Some(end) => end,
                None => {
                    if self.limits.client_max_header_size > 0
                        && self.buffer.len() > self.limits.client_max_header_size + 1
                    {
                        return self.fail(status::BAD_REQUEST, "header line too long");
                    }
                    return false;
                }
            };

            if end == 0 {
                self.buffer.advance(2);
                self.header_start = None;
                return self.finish_headers();
            }

            if self.limits.client_max_header_size > 0 && end > self.limits.client_max_header_size {
                return self.fail(status::BAD_REQUEST, "header line too long");
            }

            self.request.header_count += 1;
            if self.request.header_count > self.limits.max_header_count {
                return self.fail(status::BAD_REQUEST, "too many headers");
            }

            let line = self.buffer.split_to(end + 2);
            let line = match std::str::from_utf8(&line[..end]) {
                Ok(s) => s,
                Err(_) => return self.fail(status::BAD_REQUEST, "header is not valid UTF-8"),
            };

            let colon = match line.find(':') {
                Some(c) => c,
                None => return self.fail(status::BAD_REQUEST, "header has no colon"),
            };
            let name = &line[..colon];
            if name.is_empty() || !name.bytes().all(is_tchar) {
                return self.fail(status::BAD_REQUEST, "header name violates token grammar");
            }

            let value = line[colon + 1..].trim_start_matches(|c| c == ' ' || c == '\t');
            if value.bytes().any(|b| b.is_ascii_control()) {
                return self.fail(status::BAD_REQUEST, "header value contains control bytes");
            }

            let name = canonical_header_name(name);

            if name == "Host" {
                if self.request.headers.contains_key("Host") {
                    return self.fail(status::BAD_REQUEST, "duplicate Host header");
                }
                if value.is_empty() {
                    return self.fail(status::BAD_REQUEST, "empty Host header");
                }
                if let Some(on_host) = self.on_host.as_mut() {
                    on_host(value);
                }
            }

            if name == "Transfer-Encoding" {
                if value != "chunked" {
                    return self.fail(status::NOT_IMPLEMENTED, "unsupported transfer encoding");
                }
                self.chunked_transfer = true;
            }

            self.request.headers.insert(name, value.to_string());
        }
    }

    fn finish_headers(&mut self) -> bool {
        let content_length_present = self.request.headers.contains_key("Content-Length");
        if let Some(raw) = self.request.headers.get("Content-Length") {
            if raw.starts_with('-') {
                return self.fail(status::BAD_REQUEST, "negative Content-Length");
            }
            self.content_length = match raw.parse::<usize>() {
                Ok(n) => n,
                Err(_) => return self.fail(status::BAD_REQUEST, "unparsable Content-Length"),
            };
        }

        if !self.request.headers.contains_key("Host") {
            return self.fail(status::BAD_REQUEST, "missing Host header");
        }

        if content_length_present && self.chunked_transfer {
            return self.fail(
                status::BAD_REQUEST,
                "Content-Length conflicts with chunked transfer",
            );
        }

        if self.content_length > 0 || self.chunked_transfer {
            self.body_start = Some(Instant::now());
            self.state = ParseState::Body;
        } else {
            self.state = ParseState::Complete;
        }
        true
    }

    fn parse_body(&mut self) -> bool {
        if !self.chunked_transfer
            && self.limits.client_max_body_size > 0
            && self.content_length > self.limits.client_max_body_size
        {
            return self.fail(status::CONTENT_TOO_LARGE, "Content-Length exceeds body limit");
        }

        if self.chunked_transfer {
            return self.parse_chunked_body();
        }

        if self.request.total_body_size + self.buffer.len() > self.content_length {
            return self.fail(status::BAD_REQUEST, "body exceeds Content-Length");
        }

        let data = self.buffer.split();
        let complete = self.append_to_body(&data);
        if self.state == ParseState::Error {
            return false;
        }
        if complete {
            self.state = ParseState::Complete;
        }
        complete
    }

    fn parse_chunked_body(&mut self) -> bool {
        loop {
            let end = match find_crlf(&self.buffer) {
                Some(end) => end,
                None => return false,
            };

            if !self.has_chunk_size {
                let line = match std::str::from_utf8(&self.buffer[..end]) {
                    Ok(s) => s,
                    Err(_) => return self.fail(status::BAD_REQUEST, "invalid chunk size"),
                };
                // A chunk extension may trail the size after a semicolon.
                let size_hex = line.split(';').next().unwrap_or("");
                if size_hex.is_empty() || !size_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return self.fail(status::BAD_REQUEST, "invalid chunk size");
                }
                self.chunk_size = match usize::from_str_radix(size_hex, 16) {
                    Ok(n) => n,
                    Err(_) => return self.fail(status::BAD_REQUEST, "invalid chunk size"),
                };
                self.has_chunk_size = true;

                if self.limits.client_max_body_size > 0
                    && self.request.total_body_size + self.chunk_size
                        > self.limits.client_max_body_size
                {
                    return self.fail(status::CONTENT_TOO_LARGE, "chunked body exceeds body limit");
                }

                self.buffer.advance(end + 2);
                continue;
            }

            if self.chunk_size == 0 {
                if end != 0 {
                    return self.fail(status::BAD_REQUEST, "data after final chunk size");
                }
                self.buffer.advance(2);
                if !self.buffer.is_empty() {
                    return self.fail(status::BAD_REQUEST, "extra data after final chunk");
                }
                self.state = ParseState::Complete;
                return true;
            }

            if self.buffer.len() < self.chunk_size + 2 {
                return false;
            }
            if self.buffer[self.chunk_size] != b'\r' || self.buffer[self.chunk_size + 1] != b'\n' {
                return self.fail(status::BAD_REQUEST, "missing CRLF after chunk data");
            }

            let data = self.buffer.split_to(self.chunk_size);
            self.append_to_body(&data);
            if self.state == ParseState::Error {
                return false;
            }
            self.has_chunk_size = false;
            self.buffer.advance(2);
        }
    }

    /// Appends to the request body. Returns whether the identity body is
    /// now complete; chunked parsing ignores the return value.
    fn append_to_body(&mut self, data: &[u8]) -> bool {
        if self.limits.client_max_body_size > 0
            && self.request.total_body_size > self.limits.client_max_body_size
        {
            self.fail(status::CONTENT_TOO_LARGE, "body exceeds body limit");
            return false;
        }

        self.request.total_body_size += data.len();
        self.request.body.append(data);
        self.request.total_body_size >= self.content_length
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

/// Canonical `Title-Case-Dash` form: first character and every character
/// following a dash uppercased, the rest lowercased.
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Percent-decodes a URI in the forgiving style clients expect: `%HH`
/// becomes the byte it names, `+` becomes a space, and malformed escapes
/// pass through literally.
pub fn decode_uri(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
            {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
