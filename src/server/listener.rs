use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::buffer::{BufferContext, PollFdHandler};
use crate::config::Config;
use crate::http::connection::{Connection, RequestHandler};
use crate::session::SessionRegistry;

/// Accepts connections and spawns one local task per client.
///
/// Tasks are spawned on the current thread's `LocalSet`; the whole server
/// is a single-threaded reactor, which is what lets buffers share state
/// through `Rc`.
pub async fn run<H>(
    config: Config,
    ctx: Rc<BufferContext>,
    fd_handler: Rc<RefCell<PollFdHandler>>,
    sessions: Arc<SessionRegistry>,
    handler: Rc<H>,
) -> anyhow::Result<()>
where
    H: RequestHandler + 'static,
{
    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    info!("Listening on {}", config.server.listen_addr);

    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::debug!(%peer, "accepted connection");

        let mut connection = Connection::new(
            socket,
            &config,
            ctx.clone(),
            fd_handler.clone(),
            sessions.clone(),
            handler.clone(),
        );
        tokio::task::spawn_local(async move {
            if let Err(e) = connection.run().await {
                tracing::debug!(error = %e, "connection ended with error");
            }
        });
    }
}
