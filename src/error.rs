//! Error taxonomy shared by every component of the RPC layer.
//!
//! Validation failures (`InvalidServiceName`, `BadParameter`) are raised
//! synchronously before any state changes. Transport failures are surfaced
//! once to the operation that hit them; nothing here retries.

/// Errors returned by discovery, server, client and pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// A service or module name does not match `^[A-Za-z][A-Za-z0-9-]*$`.
    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),

    /// Malformed flags or arguments.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// The announcement or browse mechanism failed.
    #[error("transport error: {0}")]
    TransportError(String),

    /// A client connection could not be established or was lost.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// The remote does not expose the requested service.
    #[error("unsupported service: {0}")]
    UnsupportedService(String),

    /// No currently-known service matches the requested flags.
    #[error("no route available for {0}")]
    NoRouteAvailable(String),

    /// The operation is not valid in the component's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// The remote handler failed this call; the connection is still usable.
    #[error("remote error ({kind}): {message}")]
    Remote {
        /// Machine-readable failure class reported by the server.
        kind: String,
        /// Human-readable message reported by the server.
        message: String,
    },
}

impl RpcError {
    pub(crate) fn transport(e: impl std::fmt::Display) -> Self {
        Self::TransportError(e.to_string())
    }

    pub(crate) fn connection(e: impl std::fmt::Display) -> Self {
        Self::ConnectionError(e.to_string())
    }
}

pub type Result<T, E = RpcError> = std::result::Result<T, E>;
