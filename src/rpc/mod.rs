//! Inter-stage RPC: wire protocol, multi-stream clients, the pooled client
//! layer with backoff, and the server.
//!
//! Error classification here drives the retry policy of the whole fabric:
//! only transport-temporary failures (dial timeouts, backoff refusals) are
//! retried, by reopening clients through the pool on the next call. A
//! shutdown or non-temporary network error resets the cached client.

pub mod client;
pub mod pool;
pub(crate) mod server;
pub mod wire;

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use snafu::Snafu;

use crate::types::StageId;

/// Errors from the RPC layer.
#[derive(Debug, Snafu)]
pub enum RpcError {
    /// The pool refused to dial: the peer is inside its backoff window.
    /// Classified temporary and timeout.
    #[snafu(display("rpc client backing off until {until:?}"))]
    Backoff {
        /// End of the backoff window.
        until: Instant,
    },

    /// The connection was shut down. Always triggers a client reset.
    #[snafu(display("rpc connection shut down"))]
    Shutdown,

    /// Dialing the peer failed.
    #[snafu(display("dial {addr} failed: {source}"))]
    Dial {
        /// Peer address.
        addr: SocketAddr,
        /// The socket error.
        source: io::Error,
    },

    /// An established stream failed.
    #[snafu(display("rpc i/o failure: {source}"))]
    Io {
        /// The socket error.
        source: io::Error,
    },

    /// No address is known for the stage.
    #[snafu(display("no known address for stage {stage}"))]
    UnknownPeer {
        /// The unresolvable stage.
        stage: StageId,
    },

    /// A frame could not be encoded or decoded.
    #[snafu(display("wire codec failure: {source}"))]
    Codec {
        /// The serializer error.
        source: postcard::Error,
    },

    /// The peer returned an application-level error.
    #[snafu(display("remote error: {message}"))]
    Remote {
        /// The peer's error text.
        message: String,
    },

    /// The peer answered with a response of the wrong shape.
    #[snafu(display("unexpected response for {method}"))]
    UnexpectedResponse {
        /// Wire method that was called.
        method: &'static str,
    },
}

impl RpcError {
    /// Whether the failure is transient: safe to retry after backoff.
    pub fn is_temporary(&self) -> bool {
        match self {
            RpcError::Backoff { .. } => true,
            RpcError::Dial { source, .. } | RpcError::Io { source } => io_is_temporary(source),
            _ => false,
        }
    }

    /// Whether the failure is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            RpcError::Backoff { .. } => true,
            RpcError::Dial { source, .. } | RpcError::Io { source } => {
                source.kind() == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }

    /// Whether the cached client that produced this error must be replaced:
    /// a shutdown, or a non-temporary network error.
    pub(crate) fn should_reset(&self) -> bool {
        match self {
            RpcError::Shutdown => true,
            RpcError::Dial { source, .. } | RpcError::Io { source } => !io_is_temporary(source),
            _ => false,
        }
    }
}

fn io_is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_temporary_timeout() {
        let err = RpcError::Backoff {
            until: Instant::now(),
        };
        assert!(err.is_temporary());
        assert!(err.is_timeout());
        assert!(!err.should_reset());
    }

    #[test]
    fn shutdown_resets() {
        assert!(RpcError::Shutdown.should_reset());
        assert!(!RpcError::Shutdown.is_temporary());
    }

    #[test]
    fn connection_reset_resets_but_timeout_does_not() {
        let reset = RpcError::Io {
            source: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        };
        assert!(reset.should_reset());
        assert!(!reset.is_temporary());

        let timed_out = RpcError::Io {
            source: io::Error::new(io::ErrorKind::TimedOut, "slow"),
        };
        assert!(!timed_out.should_reset());
        assert!(timed_out.is_temporary());
        assert!(timed_out.is_timeout());
    }
}
