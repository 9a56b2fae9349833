//! The request-path executor: retries, key rotation, streaming vs buffered
//! forwarding for a single inbound proxy request.

pub mod executor;
pub mod types;

pub use executor::{ProxyExecutor, MAX_BODY_SIZE_BYTES};
pub use types::{AttemptLog, ByteStream, ProxyContext, ProxyResponse, ResponseBody};
