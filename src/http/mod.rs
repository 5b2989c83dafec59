//! HTTP/1.1 protocol implementation.
//!
//! The layer is organized into several submodules:
//!
//! - **`parser`**: incremental request parser; tolerates arbitrary TCP
//!   fragmentation and latches a precise status code on malformed input
//! - **`request`**: parsed request representation
//! - **`response`**: response assembly with status table and cookies
//! - **`writer`**: serializes responses, including chunked body framing
//! - **`connection`**: per-connection Reading → Processing → Writing
//!   state machine with keep-alive support

pub mod connection;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

pub use connection::{Connection, RequestHandler};
pub use parser::{ParseState, Parser};
pub use request::{HttpRequest, Method};
pub use response::HttpResponse;
pub use writer::ResponseWriter;
