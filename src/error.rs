use thiserror::Error;

/// Everything that can go wrong between accepting a client socket and
/// releasing its upstream. Each variant maps to one handler policy:
/// terminate-and-record, escalate to the listener, or swallow.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream operation timed out: {0}")]
    Timeout(String),

    #[error("upstream connection failed: {0}")]
    Conn(String),

    #[error("sending to upstream failed: {0}")]
    Send(String),

    #[error("receiving from upstream failed: {0}")]
    Recv(String),

    #[error("upstream closed without sending any data")]
    EmptyRecv,

    #[error("malformed status line: {0:?}")]
    BadStatusLine(String),

    #[error("first upstream chunk is not a valid status line")]
    BadResponse,

    /// An error raised inside one of the two relay tasks. The inner error
    /// is one of `Timeout`, `Io`, `Recv` or `BadResponse`.
    #[error("relay failed: {0}")]
    Stream(#[source] Box<ProxyError>),

    #[error("no proxy matches host {host:?} on port {port}")]
    NoProxy { host: String, port: u16 },

    #[error("upstream supports no protocol usable for this scheme")]
    NoProto,

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Short label stored in the telemetry record's `error` column.
    pub fn record_label(&self) -> &'static str {
        match self {
            ProxyError::Timeout(_) => "Proxy Timeout",
            ProxyError::Conn(_) => "Proxy Connection Error",
            ProxyError::Send(_) => "Proxy Send Error",
            ProxyError::Recv(_) => "Proxy Recv Error",
            ProxyError::EmptyRecv => "Proxy Empty Response",
            ProxyError::BadStatusLine(_) | ProxyError::BadResponse => "Bad Response",
            ProxyError::Stream(inner) => inner.record_label(),
            ProxyError::NoProxy { .. } => "No Proxy",
            ProxyError::NoProto => "NoProto",
            ProxyError::Cancelled => "Cancelled",
            ProxyError::Io(_) => "Stream Error",
        }
    }

    /// True when the failure is a deadline expiry, looking through the
    /// relay wrapper. Drives the forgiven post-EOF case: the response has
    /// fully returned and only the upstream's trailing read timed out.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProxyError::Timeout(_) => true,
            ProxyError::Stream(inner) => inner.is_timeout(),
            ProxyError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    pub(crate) fn on_stream(cause: ProxyError) -> ProxyError {
        ProxyError::Stream(Box::new(cause))
    }
}
