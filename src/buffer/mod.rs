//! Spillable byte buffers and the readiness plumbing they drain through.
//!
//! A [`SmartBuffer`](smart_buffer::SmartBuffer) starts life as a plain
//! in-memory byte store and transparently migrates to a temp file once it
//! outgrows its memory budget. File-backed buffers never block: their disk
//! reads and writes are driven by readiness events delivered through the
//! [`FdHandler`](fd_handler::FdHandler) seam.

pub mod fd_handler;
pub mod smart_buffer;

pub use fd_handler::{Events, FdCallback, FdHandler, PollFdHandler};
pub use smart_buffer::{BufferContext, SmartBuffer};
