use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, error};

use crate::error::ProxyError;
use crate::router::Router;
use crate::telemetry::{RecordSink, RequestRecord, Scheme};
use crate::upstream::{Conn, Lease, Proto, Upstream};
use crate::wire::{self, Headers};

/// Per-read buffer size for the client head and both relay directions.
pub const CHUNK: usize = 65536;

/// Canonical acknowledgement written to the client once a CONNECT tunnel is
/// open.
pub const CONNECTED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Everything a connection handler borrows from its listener.
#[derive(Clone)]
pub struct HandlerCtx {
    pub router: Arc<Router>,
    pub sink: Arc<dyn RecordSink>,
    /// Per-chunk relay deadline.
    pub timeout: Duration,
    /// Port the listener accepted this client on; scopes rule matching.
    pub port: u16,
    pub shutdown: watch::Receiver<bool>,
}

/// Byte totals and the captured response line from the two relays. Fields
/// stay `None` when the corresponding relay never finished, so telemetry can
/// tell "nothing sent" apart from "unknown".
#[derive(Debug, Default)]
struct StreamTotals {
    up: Option<u64>,
    down: Option<u64>,
    first_line: Option<String>,
    client_eof: bool,
}

/// Handle one accepted client connection end-to-end:
/// parse the request head, pick an upstream through the router, negotiate
/// the upstream protocol, pump bytes both ways, classify the outcome, emit
/// exactly one telemetry record, release the upstream.
///
/// Errors raised before an upstream was selected (unparsable head, no
/// matching rule) surface to the listener without a record; `NoProxy` in
/// particular makes the listener shut itself down.
pub async fn handle(mut client: TcpStream, ctx: HandlerCtx) -> Result<(), ProxyError> {
    let time_of_request = unix_now();
    let accepted = Instant::now();

    let (request, headers) = parse_request(&mut client).await?;
    let scheme = if headers.is_connect() {
        Scheme::Https
    } else {
        Scheme::Http
    };
    let host = headers.host.clone().unwrap_or_default();

    let (endpoint, pool_name) = ctx.router.select(&host, ctx.port)?;
    debug!(
        "request: {} {}; scheme: {}; proxy: {}; pool: {}",
        headers.method.as_deref().unwrap_or("-"),
        headers.path.as_deref().unwrap_or("-"),
        scheme,
        endpoint,
        pool_name
    );

    let mut shutdown = ctx.shutdown.clone();
    let mut totals = StreamTotals::default();

    let (lease, outcome) = tokio::select! {
        res = run_exchange(&endpoint, &mut client, &request, scheme, &ctx, &mut totals) => res,
        _ = cancelled(&mut shutdown) => (None, Err(ProxyError::Cancelled)),
    };

    let (error_label, swallow) = classify(&outcome, scheme, totals.client_eof);
    if let Some(label) = &error_label {
        debug!("client eof: {}; outcome: {}", totals.client_eof, label);
    }

    let stats = lease
        .as_ref()
        .map(|l| l.stats.clone())
        .unwrap_or_default();
    let total_time_ms = if lease.is_some() {
        stats.total_time_ms
    } else {
        accepted.elapsed().as_millis() as u64
    };
    let status_code = totals
        .first_line
        .as_deref()
        .and_then(|line| wire::parse_status_line(line).ok())
        .and_then(|h| h.status);

    let record = RequestRecord {
        proxy: endpoint.addr(),
        domain: host,
        path: short_path(&headers, scheme),
        scheme,
        bw_up: totals.up.map(|b| b + stats.bw_up),
        bw_down: totals.down.map(|b| b + stats.bw_down),
        status_code,
        error: error_label,
        total_time_ms,
        time_of_request,
        pool_name,
        listener_port: ctx.port,
    };
    if let Err(e) = ctx.sink.emit(record) {
        error!("failed to save request record: {e:#}");
    }

    if let Some(mut lease) = lease {
        lease.close().await;
    }
    let _ = client.shutdown().await;

    match outcome {
        Err(e) if !swallow => Err(e),
        _ => Ok(()),
    }
}

/// Check the endpoint out and run the request through it. Split out so the
/// caller can race the whole borrow (including the wait for a busy
/// endpoint) against shutdown.
async fn run_exchange(
    endpoint: &Arc<Upstream>,
    client: &mut TcpStream,
    request: &[u8],
    scheme: Scheme,
    ctx: &HandlerCtx,
    totals: &mut StreamTotals,
) -> (Option<Lease>, Result<(), ProxyError>) {
    let mut lease = endpoint.checkout().await;
    let res = drive(&mut lease, client, request, scheme, ctx, totals).await;
    (Some(lease), res)
}

async fn drive(
    lease: &mut Lease,
    client: &mut TcpStream,
    request: &[u8],
    scheme: Scheme,
    ctx: &HandlerCtx,
    totals: &mut StreamTotals,
) -> Result<(), ProxyError> {
    let proto = choose_proto(&lease.endpoint().types, scheme)?;
    debug!("proto: {} for scheme {}", proto, scheme);

    lease.connect().await?;

    if scheme == Scheme::Https && matches!(proto, Proto::Socks4 | Proto::Socks5) {
        // Tunnel-capable upstream: acknowledge the CONNECT to the client
        // and start pumping opaque bytes.
        client.write_all(CONNECTED).await?;
        client.flush().await?;
    } else {
        lease.send(request).await?;
    }

    let streaming = Instant::now();
    let (upstream_rd, upstream_wr) = lease.split()?;
    let res = run_relays(client, upstream_rd, upstream_wr, ctx.timeout, totals).await;
    lease.add_runtime("Streaming: done", streaming);
    res
}

/// Run the two directional relays as sibling futures and gather both
/// results. The first relay error drops the other relay on the floor, the
/// same as cancelling it.
async fn run_relays(
    client: &mut TcpStream,
    mut upstream_rd: ReadHalf<Conn>,
    mut upstream_wr: WriteHalf<Conn>,
    chunk_timeout: Duration,
    totals: &mut StreamTotals,
) -> Result<(), ProxyError> {
    let (mut client_rd, mut client_wr) = client.split();

    let up = relay(&mut client_rd, &mut upstream_wr, chunk_timeout, false);
    let down = relay(&mut upstream_rd, &mut client_wr, chunk_timeout, true);
    tokio::pin!(up, down);

    let mut up_res: Option<Result<RelayOut, ProxyError>> = None;
    let mut down_res: Option<Result<RelayOut, ProxyError>> = None;

    while up_res.is_none() || down_res.is_none() {
        tokio::select! {
            r = &mut up, if up_res.is_none() => {
                let failed = r.is_err();
                up_res = Some(r);
                if failed {
                    break;
                }
            }
            r = &mut down, if down_res.is_none() => {
                let failed = r.is_err();
                down_res = Some(r);
                if failed {
                    break;
                }
            }
        }
    }

    totals.client_eof = matches!(&up_res, Some(Ok(_)));
    if let Some(Ok(out)) = &up_res {
        totals.up = Some(out.bytes);
    }
    if let Some(Ok(out)) = &down_res {
        totals.down = Some(out.bytes);
        totals.first_line = out.first_line.clone();
    }

    match (up_res, down_res) {
        (Some(Err(e)), _) => Err(e),
        (_, Some(Err(e))) => Err(e),
        _ => Ok(()),
    }
}

#[derive(Debug)]
struct RelayOut {
    bytes: u64,
    first_line: Option<String>,
}

/// One directional byte pump. Reads up to [`CHUNK`] bytes per iteration
/// under the per-chunk deadline; an empty read half-closes the write side
/// and ends the relay cleanly. With `check_response` the first chunk's
/// first line must parse as a status line.
async fn relay<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_timeout: Duration,
    check_response: bool,
) -> Result<RelayOut, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK];
    let mut out = RelayOut {
        bytes: 0,
        first_line: None,
    };
    let mut checked = false;

    loop {
        let n = match timeout(chunk_timeout, reader.read(&mut buf)).await {
            Err(_) => {
                return Err(ProxyError::on_stream(ProxyError::Timeout(
                    "Streaming: timeout".to_string(),
                )))
            }
            Ok(Err(e)) => return Err(ProxyError::on_stream(ProxyError::Io(e))),
            Ok(Ok(n)) => n,
        };
        if n == 0 {
            let _ = writer.shutdown().await;
            break;
        }

        if check_response && !checked {
            let line = wire::first_line(&buf[..n]);
            if wire::parse_status_line(&line).is_err() {
                return Err(ProxyError::on_stream(ProxyError::BadResponse));
            }
            out.first_line = Some(line);
            checked = true;
        }

        out.bytes += n as u64;
        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        if let Err(e) = write.await {
            return Err(ProxyError::on_stream(ProxyError::Io(e)));
        }
    }

    Ok(out)
}

/// Read the client's request head (one 64 KiB read). POST heads that end at
/// the header boundary get one extra read, since the body arrives
/// separately from some user agents.
async fn parse_request(client: &mut TcpStream) -> Result<(Vec<u8>, Headers), ProxyError> {
    let mut buf = vec![0u8; CHUNK];
    let n = client.read(&mut buf).await?;
    let mut request = buf[..n].to_vec();
    let headers = wire::parse_headers(&request)?;

    if headers.method.as_deref() == Some("POST") && request.ends_with(b"\r\n\r\n") {
        let n = client.read(&mut buf).await?;
        request.extend_from_slice(&buf[..n]);
    }
    Ok((request, headers))
}

/// Pick the upstream protocol for the client scheme out of what the
/// endpoint supports.
fn choose_proto(types: &BTreeSet<Proto>, scheme: Scheme) -> Result<Proto, ProxyError> {
    match scheme {
        Scheme::Http => {
            if types.contains(&Proto::Connect80) {
                return Ok(Proto::Connect80);
            }
            [Proto::Http, Proto::Socks4, Proto::Socks5]
                .into_iter()
                .find(|p| types.contains(p))
                .ok_or(ProxyError::NoProto)
        }
        Scheme::Https => [Proto::Https, Proto::Socks4, Proto::Socks5]
            .into_iter()
            .find(|p| types.contains(p))
            .ok_or(ProxyError::NoProto),
    }
}

/// Map the exchange outcome to the telemetry error label and decide whether
/// the handler swallows the error. A relay timeout after the client reached
/// EOF means the response already finished and only the trailing upstream
/// read expired, so it counts as success. Stream failures on HTTPS tunnels
/// are reported as TLS trouble, since the opaque payload gives nothing
/// better to go on.
fn classify(
    outcome: &Result<(), ProxyError>,
    scheme: Scheme,
    client_eof: bool,
) -> (Option<String>, bool) {
    match outcome {
        Ok(()) => (None, true),
        Err(ProxyError::Cancelled) => (Some("Cancelled".to_string()), true),
        Err(ProxyError::Stream(inner)) => {
            if client_eof && inner.is_timeout() {
                (None, true)
            } else if scheme == Scheme::Https {
                (Some("SSL Error".to_string()), false)
            } else {
                (Some(inner.record_label().to_string()), false)
            }
        }
        Err(e) => (Some(e.record_label().to_string()), false),
    }
}

/// `/last-segment` of the request path for HTTP requests; CONNECT tunnels
/// have no visible path.
fn short_path(headers: &Headers, scheme: Scheme) -> Option<String> {
    if scheme != Scheme::Http {
        return None;
    }
    let path = headers.path.as_deref()?;
    if !path.contains('/') {
        return None;
    }
    Some(format!("/{}", path.rsplit('/').next().unwrap_or_default()))
}

/// Resolves once the listener has signalled shutdown; pends forever
/// otherwise.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    loop {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *rx.borrow() {
            return;
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(list: &[Proto]) -> BTreeSet<Proto> {
        list.iter().copied().collect()
    }

    #[test]
    fn http_prefers_connect80() {
        let t = types(&[Proto::Http, Proto::Connect80, Proto::Socks5]);
        assert_eq!(choose_proto(&t, Scheme::Http).unwrap(), Proto::Connect80);
    }

    #[test]
    fn http_falls_back_to_any_usable_proto() {
        let t = types(&[Proto::Http]);
        assert_eq!(choose_proto(&t, Scheme::Http).unwrap(), Proto::Http);
        let t = types(&[Proto::Socks5]);
        assert_eq!(choose_proto(&t, Scheme::Http).unwrap(), Proto::Socks5);
    }

    #[test]
    fn https_never_picks_plain_http() {
        let t = types(&[Proto::Http, Proto::Connect80]);
        assert!(matches!(
            choose_proto(&t, Scheme::Https),
            Err(ProxyError::NoProto)
        ));
        let t = types(&[Proto::Http, Proto::Socks5]);
        assert_eq!(choose_proto(&t, Scheme::Https).unwrap(), Proto::Socks5);
    }

    #[test]
    fn connect25_alone_supports_neither_scheme() {
        let t = types(&[Proto::Connect25]);
        assert!(choose_proto(&t, Scheme::Http).is_err());
        assert!(choose_proto(&t, Scheme::Https).is_err());
    }

    #[test]
    fn short_path_keeps_the_last_segment() {
        let mut h = Headers::default();
        h.path = Some("http://example.com/a/b/x".to_string());
        assert_eq!(short_path(&h, Scheme::Http).as_deref(), Some("/x"));
        assert_eq!(short_path(&h, Scheme::Https), None);

        h.path = Some("example.com:443".to_string());
        assert_eq!(short_path(&h, Scheme::Http), None);
    }

    #[test]
    fn classification_follows_the_policy_table() {
        // clean exchange
        assert_eq!(classify(&Ok(()), Scheme::Http, true), (None, true));

        // stream timeout after the client finished counts as success
        let timed = Err(ProxyError::on_stream(ProxyError::Timeout("t".into())));
        assert_eq!(classify(&timed, Scheme::Http, true), (None, true));

        // same timeout with the client still open terminates
        let (label, swallow) = classify(&timed, Scheme::Http, false);
        assert_eq!(label.as_deref(), Some("Proxy Timeout"));
        assert!(!swallow);

        // stream failures on tunnels become TLS trouble
        let bad = Err(ProxyError::on_stream(ProxyError::BadResponse));
        let (label, _) = classify(&bad, Scheme::Https, false);
        assert_eq!(label.as_deref(), Some("SSL Error"));
        let (label, _) = classify(&bad, Scheme::Http, false);
        assert_eq!(label.as_deref(), Some("Bad Response"));

        // shutdown is recorded but swallowed
        let (label, swallow) = classify(&Err(ProxyError::Cancelled), Scheme::Http, false);
        assert_eq!(label.as_deref(), Some("Cancelled"));
        assert!(swallow);

        // connect-phase failure
        let (label, swallow) = classify(&Err(ProxyError::Conn("refused".into())), Scheme::Http, false);
        assert_eq!(label.as_deref(), Some("Proxy Connection Error"));
        assert!(!swallow);
    }

    #[tokio::test]
    async fn relay_passes_bytes_and_captures_the_status_line() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .build();
        let mut writer = tokio_test::io::Builder::new()
            .write(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .build();

        let out = relay(&mut reader, &mut writer, Duration::from_secs(1), true)
            .await
            .unwrap();
        assert_eq!(out.bytes, 40);
        assert_eq!(out.first_line.as_deref(), Some("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn relay_rejects_a_garbage_first_chunk() {
        let mut reader = tokio_test::io::Builder::new().read(b"garbage\r\n").build();
        let mut writer = tokio_test::io::Builder::new().build();

        let res = relay(&mut reader, &mut writer, Duration::from_secs(1), true).await;
        match res {
            Err(ProxyError::Stream(inner)) => assert!(matches!(*inner, ProxyError::BadResponse)),
            other => panic!("expected stream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_without_checking_forwards_anything() {
        let mut reader = tokio_test::io::Builder::new().read(b"garbage\r\n").build();
        let mut writer = tokio_test::io::Builder::new().write(b"garbage\r\n").build();

        let out = relay(&mut reader, &mut writer, Duration::from_secs(1), false)
            .await
            .unwrap();
        assert_eq!(out.bytes, 9);
        assert!(out.first_line.is_none());
    }

    #[tokio::test]
    async fn relay_times_out_on_a_stalled_reader() {
        let mut reader = tokio_test::io::Builder::new()
            .wait(Duration::from_secs(60))
            .build();
        let mut writer = tokio_test::io::Builder::new().build();

        let res = relay(&mut reader, &mut writer, Duration::from_millis(50), false).await;
        match res {
            Err(e) => assert!(e.is_timeout()),
            Ok(_) => panic!("expected a timeout"),
        }
    }
}
