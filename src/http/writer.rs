use std::cell::RefCell;
use std::rc::Rc;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::buffer::PollFdHandler;
use crate::http::response::HttpResponse;

/// Bytes requested from the body buffer per round.
const STREAM_CHUNK: usize = 60_000;

/// Consecutive no-progress event-loop ticks tolerated before the body
/// stream is declared stalled.
const MAX_STALLED_TICKS: u32 = 1000;

/// Serializes a response onto a stream: header block first, then the body
/// pulled out of its `SmartBuffer`, framed as chunked transfer encoding
/// when the response asks for it.
pub struct ResponseWriter<'a> {
    response: &'a HttpResponse,
    fd_handler: Rc<RefCell<PollFdHandler>>,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(response: &'a HttpResponse, fd_handler: Rc<RefCell<PollFdHandler>>) -> Self {
        Self {
            response,
            fd_handler,
        }
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        stream
            .write_all(self.response.to_header_string().as_bytes())
            .await?;

        let body = self.response.body();
        let chunked = self.response.is_chunked_encoding();
        let mut stalled = 0u32;

        loop {
            let chunk = body.take_read_buffer();
            if !chunk.is_empty() {
                stalled = 0;
                if chunked {
                    stream
                        .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                        .await?;
                    stream.write_all(&chunk).await?;
                    stream.write_all(b"\r\n").await?;
                } else {
                    stream.write_all(&chunk).await?;
                }
            }

            if body.is_terminated() {
                anyhow::bail!("response body buffer failed mid-stream");
            }
            if body.is_drained() {
                break;
            }

            // Pending disk writes must land before the tail of the body
            // becomes readable, so only request reads for flushed bytes.
            if body.outstanding() == 0 {
                let remaining = body.read_remaining();
                if remaining > 0 {
                    body.read(remaining.min(STREAM_CHUNK));
                }
            }

            if body.is_file() {
                let progressed = self.fd_handler.borrow_mut().poll_once(0)?;
                if progressed == 0 {
                    stalled += 1;
                    if stalled > MAX_STALLED_TICKS {
                        anyhow::bail!("response body I/O stalled");
                    }
                    tokio::task::yield_now().await;
                }
            }
        }

        if chunked {
            stream.write_all(b"0\r\n\r\n").await?;
        }
        stream.flush().await?;
        Ok(())
    }
}
