use std::collections::HashMap;

use crate::error::ProxyError;

/// Parsed first line plus header fields of an HTTP/1.1 message.
///
/// The well-known pieces live in typed fields; everything else stays in the
/// `fields` map under its title-cased name.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    pub version: Option<String>,
    // request form
    pub method: Option<String>,
    pub path: Option<String>,
    // response form
    pub status: Option<u16>,
    pub reason: Option<String>,
    // split out of a CONNECT target or a Host header
    pub host: Option<String>,
    pub port: Option<u16>,
    pub fields: HashMap<String, String>,
}

impl Headers {
    pub fn is_connect(&self) -> bool {
        self.method.as_deref() == Some("CONNECT")
    }
}

/// Parse the first CRLF-delimited line of an HTTP/1.1 message.
///
/// A line starting with `HTTP/` is a response (`version status reason...`);
/// anything else must be a request (`method path version`). For CONNECT the
/// `host:port` target is split out.
pub fn parse_status_line(line: &str) -> Result<Headers, ProxyError> {
    let mut headers = Headers::default();
    let parts: Vec<&str> = line.split_whitespace().collect();

    if line.starts_with("HTTP/") {
        // HTTP/1.1 200 OK
        if parts.len() < 2 {
            return Err(ProxyError::BadStatusLine(line.to_string()));
        }
        headers.version = Some(parts[0].to_uppercase());
        headers.status = Some(
            parts[1]
                .parse()
                .map_err(|_| ProxyError::BadStatusLine(line.to_string()))?,
        );
        let reason = parts[2..].join(" ");
        headers.reason = Some(if reason.eq_ignore_ascii_case("ok") {
            "OK".to_string()
        } else {
            title_case(&reason)
        });
    } else {
        // GET / HTTP/1.1
        if parts.len() != 3 {
            return Err(ProxyError::BadStatusLine(line.to_string()));
        }
        let method = parts[0].to_uppercase();
        headers.path = Some(parts[1].to_string());
        headers.version = Some(parts[2].to_uppercase());
        if method == "CONNECT" {
            let (host, port) = parts[1]
                .split_once(':')
                .ok_or_else(|| ProxyError::BadStatusLine(line.to_string()))?;
            headers.host = Some(host.to_string());
            headers.port = Some(
                port.parse()
                    .map_err(|_| ProxyError::BadStatusLine(line.to_string()))?,
            );
        }
        headers.method = Some(method);
    }

    Ok(headers)
}

/// Parse a request or response head: status line, then `Name: value` pairs
/// until the first empty line. Header names come out title-cased no matter
/// how the peer spelled them.
pub fn parse_headers(raw: &[u8]) -> Result<Headers, ProxyError> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");

    let first = lines.next().unwrap_or_default();
    let mut headers = parse_status_line(first)?;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers
            .fields
            .insert(title_case(name.trim()), value.trim().to_string());
    }

    if headers.host.is_none() {
        if let Some(host) = headers.fields.get("Host") {
            match host.split_once(':') {
                // keep the raw value when the suffix is not a port number
                Some((name, port)) if port.parse::<u16>().is_ok() => {
                    headers.host = Some(name.to_string());
                    headers.port = port.parse().ok();
                }
                _ => headers.host = Some(host.clone()),
            }
        }
    }

    Ok(headers)
}

/// Python's `str.title()`: a letter is upper-cased when the previous byte is
/// not alphabetic, lower-cased otherwise. `content-LENGTH` -> `Content-Length`.
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// First CRLF-delimited line of a buffer, or the whole buffer if it has no
/// line break yet.
pub fn first_line(data: &[u8]) -> String {
    let end = data
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_round_trip() {
        let h = parse_status_line("GET http://example.com/x HTTP/1.1").unwrap();
        assert_eq!(h.method.as_deref(), Some("GET"));
        assert_eq!(h.path.as_deref(), Some("http://example.com/x"));
        assert_eq!(h.version.as_deref(), Some("HTTP/1.1"));
        assert!(h.status.is_none());
    }

    #[test]
    fn connect_line_splits_target() {
        let h = parse_status_line("CONNECT example.com:443 HTTP/1.1").unwrap();
        assert_eq!(h.method.as_deref(), Some("CONNECT"));
        assert_eq!(h.host.as_deref(), Some("example.com"));
        assert_eq!(h.port, Some(443));
    }

    #[test]
    fn response_line_parses_status_and_reason() {
        let h = parse_status_line("HTTP/1.1 200 ok").unwrap();
        assert_eq!(h.status, Some(200));
        assert_eq!(h.reason.as_deref(), Some("OK"));

        let h = parse_status_line("HTTP/1.1 404 not found").unwrap();
        assert_eq!(h.status, Some(404));
        assert_eq!(h.reason.as_deref(), Some("Not Found"));
    }

    #[test]
    fn lower_cased_method_is_normalized() {
        let h = parse_status_line("get / HTTP/1.1").unwrap();
        assert_eq!(h.method.as_deref(), Some("GET"));
    }

    #[test]
    fn wrong_arity_is_a_bad_status_line() {
        assert!(matches!(
            parse_status_line("garbage"),
            Err(ProxyError::BadStatusLine(_))
        ));
        assert!(matches!(
            parse_status_line("GET /"),
            Err(ProxyError::BadStatusLine(_))
        ));
        assert!(matches!(
            parse_status_line("CONNECT example.com HTTP/1.1"),
            Err(ProxyError::BadStatusLine(_))
        ));
    }

    #[test]
    fn headers_are_title_cased() {
        let raw = b"GET / HTTP/1.1\r\nhost: example.com\r\ncontent-LENGTH: 4\r\n\r\nbody";
        let h = parse_headers(raw).unwrap();
        assert_eq!(h.host.as_deref(), Some("example.com"));
        assert_eq!(h.fields.get("Content-Length").map(String::as_str), Some("4"));
    }

    #[test]
    fn host_header_port_is_split() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let h = parse_headers(raw).unwrap();
        assert_eq!(h.host.as_deref(), Some("example.com"));
        assert_eq!(h.port, Some(443));
    }

    #[test]
    fn headers_stop_at_blank_line() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nX-Smuggled: yes\r\n";
        let h = parse_headers(raw).unwrap();
        assert!(h.fields.get("X-Smuggled").is_none());
    }

    #[test]
    fn value_keeps_embedded_colons() {
        let raw = b"GET / HTTP/1.1\r\nReferer: http://a/b\r\nHost: a\r\n\r\n";
        let h = parse_headers(raw).unwrap();
        assert_eq!(h.fields.get("Referer").map(String::as_str), Some("http://a/b"));
    }

    #[test]
    fn first_line_stops_at_crlf() {
        assert_eq!(first_line(b"HTTP/1.1 200 OK\r\nrest"), "HTTP/1.1 200 OK");
        assert_eq!(first_line(b"no break"), "no break");
    }
}
