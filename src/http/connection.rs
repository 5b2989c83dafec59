use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::timeout;

use crate::buffer::{BufferContext, PollFdHandler};
use crate::config::Config;
use crate::http::parser::{ParseState, Parser};
use crate::http::request::HttpRequest;
use crate::http::response::{status, HttpResponse};
use crate::http::writer::ResponseWriter;
use crate::session::{SessionHandle, SessionRegistry};

/// The request-handling layer's seam. Handlers receive the parsed request
/// and the resolved session, and produce a response; infrastructure
/// failures become 500-class responses inside the handler.
pub trait RequestHandler {
    fn handle(
        &self,
        request: &mut HttpRequest,
        session: &SessionHandle,
        ctx: &Rc<BufferContext>,
    ) -> HttpResponse;
}

/// Handles a single client connection.
///
/// The connection cycles Reading → Processing → Writing, looping back to
/// Reading on keep-alive and dropping to Closed otherwise. Reading feeds
/// the incremental parser; a latched parser error produces an error page
/// with the parser's status code and closes the connection after the
/// write.
pub struct Connection<S, H> {
    stream: S,
    parser: Parser,
    handler: Rc<H>,
    sessions: Arc<SessionRegistry>,
    fd_handler: Rc<RefCell<PollFdHandler>>,
    ctx: Rc<BufferContext>,
    read_timeout: Duration,
    state: ConnectionState,
    request_start: Option<Instant>,
}

enum ConnectionState {
    Reading,
    Processing(HttpRequest),
    /// Response plus whether the connection survives it.
    Writing(HttpResponse, bool),
    Closed,
}

enum ReadOutcome {
    Request(HttpRequest),
    /// Parser latched this status; answer with it and close.
    Rejected(u16),
    Eof,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: RequestHandler,
{
    pub fn new(
        stream: S,
        config: &Config,
        ctx: Rc<BufferContext>,
        fd_handler: Rc<RefCell<PollFdHandler>>,
        sessions: Arc<SessionRegistry>,
        handler: Rc<H>,
    ) -> Self {
        Self {
            stream,
            parser: Parser::new(config.limits.clone(), ctx.clone()),
            handler,
            sessions,
            fd_handler,
            ctx,
            read_timeout: config.request_timeout(),
            state: ConnectionState::Reading,
            request_start: None,
        }
    }

    /// Runs the connection state machine until the connection closes.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Reading) {
                ConnectionState::Reading => match self.read_request().await? {
                    ReadOutcome::Request(request) => {
                        self.request_start = Some(Instant::now());
                        tracing::info!(
                            method = request.method.as_str(),
                            uri = %request.uri,
                            "received request"
                        );
                        self.state = ConnectionState::Processing(request);
                    }
                    ReadOutcome::Rejected(code) => {
                        tracing::debug!(status = code, "answering rejected request");
                        let response = HttpResponse::html(&self.ctx, code, "");
                        self.state = ConnectionState::Writing(response, false);
                    }
                    ReadOutcome::Eof => {
                        tracing::debug!("client closed connection");
                        self.state = ConnectionState::Closed;
                    }
                },

                ConnectionState::Processing(mut request) => {
                    let keep_alive = request.keep_alive();
                    let session =
                        SessionHandle::resolve(self.sessions.clone(), request.cookie_header());
                    let mut response = self.handler.handle(&mut request, &session, &self.ctx);
                    if session.is_new() {
                        response.add_set_cookie(format!("sessionId={}", session.id()));
                    }

                    if let Some(start) = self.request_start.take() {
                        tracing::info!(
                            method = request.method.as_str(),
                            uri = %request.uri,
                            status = response.status(),
                            duration_ms = start.elapsed().as_millis() as u64,
                            "request completed"
                        );
                    }
                    self.state = ConnectionState::Writing(response, keep_alive);
                }

                ConnectionState::Writing(response, keep_alive) => {
                    ResponseWriter::new(&response, self.fd_handler.clone())
                        .write_to_stream(&mut self.stream)
                        .await
                        .context("writing response")?;

                    if keep_alive {
                        self.parser.reset();
                        self.state = ConnectionState::Reading;
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => break,
            }
        }
        Ok(())
    }

    /// Reads from the peer until the parser completes a request, rejects
    /// the input, or the peer goes away. A read that exceeds the idle
    /// timeout is answered with 408.
    async fn read_request(&mut self) -> anyhow::Result<ReadOutcome> {
        loop {
            let mut buf = [0u8; 4096];
            let n = match timeout(self.read_timeout, self.stream.read(&mut buf)).await {
                Ok(result) => result.context("reading from client")?,
                Err(_) => return Ok(ReadOutcome::Rejected(status::REQUEST_TIMEOUT)),
            };
            if n == 0 {
                return Ok(ReadOutcome::Eof);
            }

            if self.parser.parse(&buf[..n]) {
                return Ok(ReadOutcome::Request(self.parser.take_request()));
            }
            if self.parser.state() == ParseState::Error {
                return Ok(ReadOutcome::Rejected(self.parser.error_status()));
            }
        }
    }
}
