use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Buf, Bytes, BytesMut};

use crate::buffer::fd_handler::{Events, FdHandler};

/// Upper bound on the bytes pulled from disk per readable event.
const READ_CHUNK_LIMIT: usize = 60_000;

/// Shared construction context for buffers: the spill directory, the
/// default in-memory budget, the process-wide spill-file counter and the
/// readiness handler file-backed buffers register with.
///
/// One context is built at startup and threaded to everything that
/// creates buffers; nothing here is a global.
pub struct BufferContext {
    temp_dir: PathBuf,
    default_max_memory: usize,
    counter: AtomicUsize,
    handler: Rc<RefCell<dyn FdHandler>>,
}

impl BufferContext {
    pub fn new(
        temp_dir: PathBuf,
        default_max_memory: usize,
        handler: Rc<RefCell<dyn FdHandler>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            temp_dir,
            default_max_memory,
            counter: AtomicUsize::new(0),
            handler,
        })
    }

    fn next_spill_path(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.temp_dir.join(format!("smartbuffer_{}", n))
    }
}

/// Growable byte store that transparently migrates from memory to a temp
/// file once it outgrows its budget, and never migrates back.
///
/// `SmartBuffer` is a cheap-to-clone handle; clones share the same
/// underlying storage, and the backing descriptor and any spill file are
/// released when the last handle drops. The readiness callback only holds
/// a weak reference, so registration with the event loop never keeps a
/// buffer alive.
#[derive(Clone)]
pub struct SmartBuffer {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    ctx: Rc<BufferContext>,
    max_memory: usize,
    /// Contents while in memory mode. Retained after reads; the read
    /// cursor tracks consumption separately.
    memory: BytesMut,
    /// Bytes accepted by `append` but not yet written to the file.
    write_queue: BytesMut,
    /// Bytes pulled in by satisfied reads, waiting to be consumed.
    read_buffer: BytesMut,
    /// Logical size: memory length, or bytes actually on disk.
    size: usize,
    read_pos: usize,
    /// Requested read bytes not yet satisfied (file mode only).
    outstanding: usize,
    file: Option<File>,
    /// Set only for files this buffer created by spilling; adopted
    /// descriptors are closed but never unlinked.
    spill_path: Option<PathBuf>,
    /// Latched on spill or descriptor adoption; never cleared.
    file_mode: bool,
    registered: bool,
    terminated: bool,
}

impl SmartBuffer {
    /// Memory-mode buffer with the context's default spill threshold.
    pub fn new(ctx: &Rc<BufferContext>) -> Self {
        Self::with_limit(ctx, ctx.default_max_memory)
    }

    /// Memory-mode buffer that spills once `size` exceeds `max_memory`.
    pub fn with_limit(ctx: &Rc<BufferContext>, max_memory: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                ctx: ctx.clone(),
                max_memory,
                memory: BytesMut::new(),
                write_queue: BytesMut::new(),
                read_buffer: BytesMut::new(),
                size: 0,
                read_pos: 0,
                outstanding: 0,
                file: None,
                spill_path: None,
                file_mode: false,
                registered: false,
                terminated: false,
            })),
        }
    }

    /// Adopts an existing readable file, e.g. a static file being served.
    /// The buffer owns the descriptor for its lifetime but will not unlink
    /// the path behind it.
    pub fn from_file(ctx: &Rc<BufferContext>, file: File) -> std::io::Result<Self> {
        let size = file.metadata()?.len() as usize;
        let buf = Self::with_limit(ctx, ctx.default_max_memory);
        {
            let mut inner = buf.inner.borrow_mut();
            inner.size = size;
            inner.file = Some(file);
            inner.file_mode = true;
        }
        buf.register();
        Ok(buf)
    }

    /// Appends bytes. In memory mode this may trigger the one-way spill
    /// to a temp file; in file mode the bytes queue up for the event loop
    /// to drain. Appends to a terminated buffer are dropped.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let needs_spill = {
            let mut inner = self.inner.borrow_mut();
            if inner.terminated {
                return;
            }
            if inner.file.is_some() {
                inner.write_queue.extend_from_slice(data);
                false
            } else {
                inner.memory.extend_from_slice(data);
                inner.size += data.len();
                inner.size > inner.max_memory
            }
        };
        if needs_spill {
            self.spill();
        }
    }

    /// Requests that up to `length` bytes be pulled into the read buffer.
    /// Memory mode satisfies the request synchronously; file mode raises
    /// the outstanding count and lets readiness events fulfill it.
    /// Requesting past end-of-file terminates the buffer when the read
    /// comes back empty.
    pub fn read(&self, length: usize) {
        let mut inner = self.inner.borrow_mut();
        if length == 0 || inner.size == 0 || inner.terminated {
            return;
        }

        if inner.file.is_some() {
            inner.outstanding += length;
            return;
        }

        if inner.read_pos >= inner.size {
            return;
        }
        let available = inner.size - inner.read_pos;
        let take = length.min(available);
        let start = inner.read_pos;
        let chunk = inner.memory[start..start + take].to_vec();
        inner.read_buffer.extend_from_slice(&chunk);
        inner.read_pos += take;
    }

    /// Consumes `length` bytes from the head of the read buffer.
    pub fn clean_read_buffer(&self, length: usize) {
        let mut inner = self.inner.borrow_mut();
        let n = length.min(inner.read_buffer.len());
        inner.read_buffer.advance(n);
    }

    /// Takes the entire current read buffer.
    pub fn take_read_buffer(&self) -> Bytes {
        let mut inner = self.inner.borrow_mut();
        let len = inner.read_buffer.len();
        inner.read_buffer.split_to(len).freeze()
    }

    /// Copy of the current read buffer, without consuming it.
    pub fn read_buffer(&self) -> Bytes {
        self.inner.borrow().read_buffer.clone().freeze()
    }

    /// Contents of a memory-mode buffer; `None` once spilled.
    pub fn memory_contents(&self) -> Option<Bytes> {
        let inner = self.inner.borrow();
        if inner.file_mode || inner.terminated {
            None
        } else {
            Some(inner.memory.clone().freeze())
        }
    }

    pub fn size(&self) -> usize {
        self.inner.borrow().size
    }

    pub fn is_file(&self) -> bool {
        self.inner.borrow().file_mode
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.borrow().terminated
    }

    pub fn outstanding(&self) -> usize {
        self.inner.borrow().outstanding
    }

    /// Copy of the bytes still queued for the backing file.
    pub fn write_buffer(&self) -> Bytes {
        self.inner.borrow().write_queue.clone().freeze()
    }

    pub fn pending_write_len(&self) -> usize {
        self.inner.borrow().write_queue.len()
    }

    /// Bytes not yet pulled through the read cursor.
    pub fn read_remaining(&self) -> usize {
        let inner = self.inner.borrow();
        inner.size.saturating_sub(inner.read_pos)
    }

    /// True once every appended byte has been flushed, read back and
    /// consumed, or the buffer died. Used by the writer to detect the end
    /// of a body stream.
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.borrow();
        inner.terminated
            || (inner.write_queue.is_empty()
                && inner.outstanding == 0
                && inner.read_pos >= inner.size
                && inner.read_buffer.is_empty())
    }

    /// One-way transition to file mode. On failure the buffer stays in
    /// memory and keeps growing.
    fn spill(&self) {
        let spilled = {
            let mut inner = self.inner.borrow_mut();
            if inner.file.is_some() {
                return;
            }

            let path = inner.ctx.next_spill_path();
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
            {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e,
                        "failed to create spill file, staying in memory");
                    return;
                }
            };
            tracing::debug!(path = %path.display(), bytes = inner.size, "spilling buffer to file");

            // Size restarts at the file's byte count and grows back as the
            // pending writes drain.
            inner.size = 0;
            let queued = inner.memory.split();
            inner.write_queue.unsplit(queued);
            inner.file = Some(file);
            inner.spill_path = Some(path);
            inner.file_mode = true;
            true
        };
        if spilled {
            self.register();
        }
    }

    fn register(&self) {
        let (fd, handler) = {
            let inner = self.inner.borrow();
            let fd = match &inner.file {
                Some(f) => f.as_raw_fd(),
                None => return,
            };
            (fd, inner.ctx.handler.clone())
        };
        let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        handler.borrow_mut().add_fd(
            fd,
            Events::READABLE | Events::WRITABLE,
            Box::new(move |fd, events| match weak.upgrade() {
                Some(inner) => inner.borrow_mut().on_file_event(fd, events),
                None => true,
            }),
        );
        self.inner.borrow_mut().registered = true;
    }
}

impl Inner {
    /// Readiness callback. Returns `true` to drop the registration.
    fn on_file_event(&mut self, fd: RawFd, events: Events) -> bool {
        if events.contains(Events::WRITABLE) && !self.write_queue.is_empty() {
            let result = {
                let file = match self.file.as_mut() {
                    Some(f) => f,
                    None => return true,
                };
                file.seek(SeekFrom::Start(self.size as u64))
                    .and_then(|_| file.write(&self.write_queue))
            };
            match result {
                Ok(0) => {
                    tracing::error!(fd, "file rejected write, terminating buffer");
                    return self.terminate();
                }
                Ok(n) => {
                    self.size += n;
                    self.write_queue.advance(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::error!(fd, error = %e, "failed to write to file");
                    return self.terminate();
                }
            }
        }

        if events.contains(Events::READABLE) && self.outstanding > 0 {
            let want = self.outstanding.min(READ_CHUNK_LIMIT);
            let mut chunk = vec![0u8; want];
            let result = {
                let file = match self.file.as_mut() {
                    Some(f) => f,
                    None => return true,
                };
                file.seek(SeekFrom::Start(self.read_pos as u64))
                    .and_then(|_| file.read(&mut chunk))
            };
            match result {
                Ok(0) => return self.terminate(),
                Ok(n) => {
                    self.read_buffer.extend_from_slice(&chunk[..n]);
                    self.read_pos += n;
                    self.outstanding -= n.min(self.outstanding);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::error!(fd, error = %e, "failed to read from file");
                    return self.terminate();
                }
            }
        }

        false
    }

    fn terminate(&mut self) -> bool {
        self.file = None;
        self.registered = false;
        self.terminated = true;
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.registered {
            if let Some(file) = &self.file {
                self.ctx.handler.borrow_mut().remove_fd(file.as_raw_fd());
            }
            self.registered = false;
        }
        // Dropping the handle closes the descriptor.
        self.file.take();
        if let Some(path) = self.spill_path.take() {
            tracing::debug!(path = %path.display(), "removing spill file");
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(path = %path.display(), error = %e,
                        "failed to remove spill file");
                }
            }
        }
    }
}
