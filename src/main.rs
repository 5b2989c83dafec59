use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use outpost::buffer::{BufferContext, PollFdHandler, SmartBuffer};
use outpost::config::Config;
use outpost::http::connection::RequestHandler;
use outpost::http::request::{HttpRequest, Method};
use outpost::http::response::{status, HttpResponse};
use outpost::server::listener;
use outpost::session::{SessionHandle, SessionRegistry};

/// Demo request-handling layer: a greeting route, session-owned uploads
/// and deletes, and static files streamed through spillable buffers.
struct AppHandler {
    root: PathBuf,
}

impl AppHandler {
    fn serve_static(&self, path: &str, ctx: &Rc<BufferContext>) -> HttpResponse {
        // No path traversal.
        if path.contains("..") {
            return HttpResponse::html(ctx, status::BAD_REQUEST, "invalid path");
        }

        let rel = if path == "/" { "index.html" } else { &path[1..] };
        let full = self.root.join(rel);

        match std::fs::File::open(&full) {
            Ok(file) => match SmartBuffer::from_file(ctx, file) {
                Ok(body) => {
                    let mut response = HttpResponse::new(ctx, status::OK);
                    response.set_header("Content-Type", content_type(&full));
                    response.enable_chunked_encoding(body);
                    response
                }
                Err(e) => {
                    tracing::error!(path = %full.display(), error = %e, "failed to read file");
                    HttpResponse::html(ctx, status::INTERNAL_SERVER_ERROR, "")
                }
            },
            Err(_) => HttpResponse::html(ctx, status::NOT_FOUND, ""),
        }
    }
}

impl RequestHandler for AppHandler {
    fn handle(
        &self,
        request: &mut HttpRequest,
        session: &SessionHandle,
        ctx: &Rc<BufferContext>,
    ) -> HttpResponse {
        let path = request.uri.split('?').next().unwrap_or("/").to_string();

        if path == "/hello" && request.method == Method::GET {
            let mut response = HttpResponse::new(ctx, status::OK);
            response.set_header("Content-Type", "text/plain");
            response.set_body(b"Hello from outpost\n");
            return response;
        }

        if let Some(name) = path.strip_prefix("/upload/") {
            return match request.method {
                Method::POST | Method::PUT => {
                    session.add_uploaded_file(name);
                    let mut response = HttpResponse::new(ctx, status::CREATED);
                    response.set_header("Content-Type", "text/plain");
                    response.set_body(
                        format!("stored {} ({} bytes)\n", name, request.total_body_size)
                            .as_bytes(),
                    );
                    response
                }
                Method::DELETE => {
                    if !session.owns_file(name) {
                        HttpResponse::html(ctx, status::FORBIDDEN, "not your file")
                    } else if session.remove_file(name) {
                        HttpResponse::new(ctx, status::NO_CONTENT)
                    } else {
                        HttpResponse::html(ctx, status::NOT_FOUND, "")
                    }
                }
                _ => HttpResponse::html(ctx, status::METHOD_NOT_ALLOWED, ""),
            };
        }

        match request.method {
            Method::GET | Method::HEAD => self.serve_static(&path, ctx),
            _ => HttpResponse::html(ctx, status::METHOD_NOT_ALLOWED, ""),
        }
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let cfg = Config::load();

    let fd_handler = Rc::new(RefCell::new(PollFdHandler::new()));
    let ctx = BufferContext::new(
        cfg.buffer.temp_dir.clone(),
        cfg.buffer.max_in_memory_size,
        fd_handler.clone(),
    );

    let sessions = Arc::new(SessionRegistry::new());
    if cfg.session.file.exists() {
        match sessions.deserialize(&cfg.session.file) {
            Ok(()) => tracing::info!(count = sessions.len(), "restored sessions"),
            Err(e) => tracing::warn!(error = %e, "could not restore sessions"),
        }
    }

    let handler = Rc::new(AppHandler {
        root: PathBuf::from("public"),
    });

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            tokio::select! {
                res = listener::run(
                    cfg.clone(),
                    ctx.clone(),
                    fd_handler.clone(),
                    sessions.clone(),
                    handler,
                ) => res,

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    Ok(())
                }
            }
        })
        .await?;

    match sessions.serialize(&cfg.session.file) {
        Ok(()) => tracing::info!(count = sessions.len(), "sessions saved"),
        Err(e) => tracing::warn!(error = %e, "could not save sessions"),
    }
    Ok(())
}
