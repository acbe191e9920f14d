use std::collections::BTreeSet;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::OwnedMutexGuard;
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::ProxyError;
use crate::wire;

/// Upstream protocols a proxy endpoint may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize, serde::Serialize)]
pub enum Proto {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
    #[serde(rename = "CONNECT:80")]
    Connect80,
    #[serde(rename = "CONNECT:25")]
    Connect25,
    #[serde(rename = "SOCKS4")]
    Socks4,
    #[serde(rename = "SOCKS5")]
    Socks5,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Proto::Http => "HTTP",
            Proto::Https => "HTTPS",
            Proto::Connect80 => "CONNECT:80",
            Proto::Connect25 => "CONNECT:25",
            Proto::Socks4 => "SOCKS4",
            Proto::Socks5 => "SOCKS5",
        };
        f.write_str(name)
    }
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// One upstream proxy endpoint.
///
/// The endpoint itself is immutable and shared; everything that changes
/// while a request is in flight (socket, TLS upgrade, transfer stats) lives
/// in the [`Lease`] handed out by [`Upstream::checkout`]. The internal mutex
/// guarantees no two live handlers ever drive the same endpoint.
pub struct Upstream {
    pub host: String,
    pub port: u16,
    auth_token: Option<String>,
    pub types: BTreeSet<Proto>,
    pub timeout: Duration,
    pub verify_tls: bool,
    pub geo_code: String,
    lease: Arc<tokio::sync::Mutex<()>>,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Upstream {
            host: host.into(),
            port,
            auth_token: None,
            types: [Proto::Http, Proto::Https].into_iter().collect(),
            timeout: DEFAULT_TIMEOUT,
            verify_tls: false,
            geo_code: "US".to_string(),
            lease: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Precomputes the Basic token injected into forwarded request heads.
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.auth_token = Some(BASE64.encode(format!("{username}:{password}")));
        self
    }

    pub fn types(mut self, types: impl IntoIterator<Item = Proto>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn geo_code(mut self, code: impl Into<String>) -> Self {
        self.geo_code = code.into();
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_auth(&self) -> bool {
        self.auth_token.is_some()
    }

    /// Borrow the endpoint exclusively. Waits until any current borrower
    /// releases it (drops its lease).
    pub async fn checkout(self: &Arc<Self>) -> Lease {
        let permit = self.lease.clone().lock_owned().await;
        Lease {
            endpoint: self.clone(),
            _permit: permit,
            conn: None,
            closed: true,
            stats: Stats::default(),
        }
    }
}

impl fmt::Display for Upstream {
    // US [HTTP, HTTPS] 10.0.0.1:8080
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<String> = self.types.iter().map(|t| t.to_string()).collect();
        write!(
            f,
            "{} [{}] {}:{}",
            self.geo_code,
            types.join(", "),
            self.host,
            self.port
        )
    }
}

/// Transfer counters accumulated over one borrow.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub total_time_ms: u64,
    pub bw_up: u64,
    pub bw_down: u64,
    pub last_status: Option<u16>,
}

/// The upstream socket, possibly upgraded to TLS in place. Readers and
/// writers always see the upgraded stream once it exists.
pub enum Conn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An exclusive borrow of an [`Upstream`] for the lifetime of one request.
pub struct Lease {
    endpoint: Arc<Upstream>,
    _permit: OwnedMutexGuard<()>,
    conn: Option<Conn>,
    closed: bool,
    pub stats: Stats,
}

impl Lease {
    pub fn endpoint(&self) -> &Arc<Upstream> {
        &self.endpoint
    }

    /// Open the TCP connection to the proxy, bounded by the endpoint
    /// timeout.
    ///
    /// # Errors
    /// `Timeout` past the deadline, `Conn` on refusal or any OS error.
    pub async fn connect(&mut self) -> Result<(), ProxyError> {
        let started = Instant::now();
        let addr = (self.endpoint.host.clone(), self.endpoint.port);
        match timeout(self.endpoint.timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                self.note("Connection: timeout", started);
                Err(ProxyError::Timeout("Connection: timeout".to_string()))
            }
            Ok(Err(e)) => {
                self.note("Connection: failed", started);
                Err(ProxyError::Conn(e.to_string()))
            }
            Ok(Ok(stream)) => {
                self.note("Connection: success", started);
                self.conn = Some(Conn::Plain(stream));
                self.closed = false;
                Ok(())
            }
        }
    }

    /// Upgrade the already-open socket to TLS, SNI set to the endpoint host.
    /// Certificate checking follows `verify_tls`; when off, the handshake
    /// accepts any chain.
    pub async fn connect_tls(&mut self) -> Result<(), ProxyError> {
        let started = Instant::now();
        let Some(Conn::Plain(tcp)) = self.conn.take() else {
            return Err(ProxyError::Conn(
                "tls upgrade without an open connection".to_string(),
            ));
        };

        let connector = TlsConnector::from(client_tls_config(self.endpoint.verify_tls));
        let name = ServerName::try_from(self.endpoint.host.clone())
            .map_err(|_| ProxyError::Conn(format!("invalid server name {:?}", self.endpoint.host)))?;

        match timeout(self.endpoint.timeout, connector.connect(name, tcp)).await {
            Err(_) => {
                self.note("SSL: Connection: timeout", started);
                Err(ProxyError::Timeout("SSL: Connection: timeout".to_string()))
            }
            Ok(Err(e)) => {
                self.note("SSL: Connection: failed", started);
                Err(ProxyError::Conn(e.to_string()))
            }
            Ok(Ok(stream)) => {
                self.note("SSL: Connection: success", started);
                self.conn = Some(Conn::Tls(Box::new(stream)));
                self.closed = false;
                Ok(())
            }
        }
    }

    /// Write request bytes to the upstream. When the endpoint carries
    /// credentials, a `Proxy-Authorization: Basic` header is spliced in at
    /// the end-of-headers marker first.
    pub async fn send(&mut self, req: &[u8]) -> Result<(), ProxyError> {
        let started = Instant::now();
        let payload = match &self.endpoint.auth_token {
            Some(token) => {
                debug!("setting Proxy-Authorization");
                inject_basic_auth(req, token)
            }
            None => req.to_vec(),
        };

        self.stats.bw_up += payload.len() as u64;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ProxyError::Send("no open connection".to_string()))?;

        let res = async {
            conn.write_all(&payload).await?;
            conn.flush().await
        }
        .await;

        match res {
            Ok(()) => {
                self.note(&format!("Request: {} bytes", payload.len()), started);
                Ok(())
            }
            Err(e) => {
                self.note("Sending: failed", started);
                Err(ProxyError::Send(e.to_string()))
            }
        }
    }

    /// Read one response, bounded per read by the endpoint timeout.
    ///
    /// With `length > 0` reads until that many bytes arrived, tolerating
    /// short reads. Otherwise reads an HTTP/1.1 head and then a body framed
    /// by `Content-Length` or chunked transfer encoding; `head_only` stops
    /// at the end of the head.
    ///
    /// # Errors
    /// `Timeout`, `Recv` on reset or OS error, `EmptyRecv` when the peer
    /// closed before sending anything.
    pub async fn recv(&mut self, length: usize, head_only: bool) -> Result<Vec<u8>, ProxyError> {
        let started = Instant::now();
        let deadline = self.endpoint.timeout;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ProxyError::Recv("no open connection".to_string()))?;

        let mut resp: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; 65536];

        let result = async {
            if length > 0 {
                while resp.len() < length {
                    let n = read_bounded(conn, &mut chunk, deadline).await?;
                    if n == 0 {
                        break;
                    }
                    resp.extend_from_slice(&chunk[..n]);
                }
            } else {
                // read the head
                let head_end = loop {
                    if let Some(i) = find(&resp, b"\r\n\r\n") {
                        break Some(i);
                    }
                    let n = read_bounded(conn, &mut chunk, deadline).await?;
                    if n == 0 {
                        break None;
                    }
                    resp.extend_from_slice(&chunk[..n]);
                };

                if let (Some(head_end), false) = (head_end, head_only) {
                    let head = wire::parse_headers(&resp[..head_end + 4])?;
                    if let Some(len) = head
                        .fields
                        .get("Content-Length")
                        .and_then(|v| v.parse::<usize>().ok())
                    {
                        let total = head_end + 4 + len;
                        while resp.len() < total {
                            let n = read_bounded(conn, &mut chunk, deadline).await?;
                            if n == 0 {
                                break;
                            }
                            resp.extend_from_slice(&chunk[..n]);
                        }
                    } else if head
                        .fields
                        .get("Transfer-Encoding")
                        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
                    {
                        while !chunked_body_complete(&resp[head_end + 4..]) {
                            let n = read_bounded(conn, &mut chunk, deadline).await?;
                            if n == 0 {
                                break;
                            }
                            resp.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) if resp.is_empty() => {
                self.note("Receiving: empty", started);
                Err(ProxyError::EmptyRecv)
            }
            Ok(()) => {
                if let Ok(line) = wire::parse_status_line(&wire::first_line(&resp)) {
                    self.stats.last_status = line.status;
                }
                self.stats.bw_down += resp.len() as u64;
                self.note(&format!("Received: {} bytes", resp.len()), started);
                Ok(resp)
            }
            Err(e) => {
                self.note("Receiving: failed", started);
                Err(e)
            }
        }
    }

    /// Hand the two stream halves to the relay tasks. The lease keeps its
    /// stats; the socket itself now belongs to the relays.
    pub fn split(&mut self) -> Result<(ReadHalf<Conn>, WriteHalf<Conn>), ProxyError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| ProxyError::Conn("not connected".to_string()))?;
        Ok(tokio::io::split(conn))
    }

    /// Release the borrow: half-close the socket if still held and reset the
    /// per-borrow state. Safe to call at any point, including when
    /// `connect` never succeeded, and safe to call twice.
    pub async fn close(&mut self) {
        debug!(
            "{} - Connection: closed {:?}",
            self.endpoint.addr(),
            self.stats
        );
        if !self.closed {
            if let Some(conn) = self.conn.as_mut() {
                let _ = conn.shutdown().await;
            }
        }
        self.conn = None;
        self.closed = true;
        self.stats = Stats::default();
    }

    /// Log one endpoint operation the same way every time and fold its
    /// runtime into the borrow stats.
    fn note(&mut self, msg: &str, started: Instant) {
        let runtime = started.elapsed().as_millis() as u64;
        self.stats.total_time_ms += runtime;
        debug!("{} - {} Runtime: {}ms", self.endpoint.addr(), msg, runtime);
    }

    /// Fold externally measured time (the streaming phase) into the stats.
    pub fn add_runtime(&mut self, msg: &str, started: Instant) {
        self.note(msg, started);
    }
}

async fn read_bounded(
    conn: &mut Conn,
    buf: &mut [u8],
    deadline: Duration,
) -> Result<usize, ProxyError> {
    match timeout(deadline, conn.read(buf)).await {
        Err(_) => Err(ProxyError::Timeout("Receiving: timeout".to_string())),
        Ok(Err(e)) => Err(ProxyError::Recv(e.to_string())),
        Ok(Ok(n)) => Ok(n),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splice `Proxy-Authorization` in front of the final end-of-headers
/// marker. The last `\r\n\r\n` is replaced exactly once.
fn inject_basic_auth(req: &[u8], token: &str) -> Vec<u8> {
    let marker = b"\r\n\r\n";
    let Some(pos) = req.windows(marker.len()).rposition(|w| w == marker) else {
        return req.to_vec();
    };
    let header = format!("\r\nProxy-Authorization: Basic {token}\r\n\r\n");
    let mut out = Vec::with_capacity(req.len() + header.len());
    out.extend_from_slice(&req[..pos]);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&req[pos + marker.len()..]);
    out
}

/// Walk the chunked framing: complete once the zero-size line arrived.
fn chunked_body_complete(mut body: &[u8]) -> bool {
    loop {
        let Some(line_end) = find(body, b"\r\n") else {
            return false;
        };
        let size_line = String::from_utf8_lossy(&body[..line_end]);
        let size_str = size_line.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_str, 16) else {
            return false;
        };
        if size == 0 {
            return true;
        }
        let next = line_end + 2 + size + 2;
        if body.len() < next {
            return false;
        }
        body = &body[next..];
    }
}

static VERIFYING_TLS: OnceLock<Arc<ClientConfig>> = OnceLock::new();
static TRUSTING_TLS: OnceLock<Arc<ClientConfig>> = OnceLock::new();

fn client_tls_config(verify: bool) -> Arc<ClientConfig> {
    if verify {
        VERIFYING_TLS
            .get_or_init(|| {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                Arc::new(
                    ClientConfig::builder()
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                )
            })
            .clone()
    } else {
        TRUSTING_TLS
            .get_or_init(|| {
                let mut config = ClientConfig::builder()
                    .with_root_certificates(RootCertStore::empty())
                    .with_no_client_auth();
                config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(AcceptAnyCert::default()));
                Arc::new(config)
            })
            .clone()
    }
}

/// Certificate verifier used when `verify_tls` is off: signatures are still
/// checked, the chain is not.
#[derive(Debug)]
struct AcceptAnyCert(Arc<rustls::crypto::CryptoProvider>);

impl Default for AcceptAnyCert {
    fn default() -> Self {
        AcceptAnyCert(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
