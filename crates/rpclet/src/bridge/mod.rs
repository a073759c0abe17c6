//! Wire layer between rpclet and its worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: JSON-RPC 2.0 envelopes (requests, responses, error objects)
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
