use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

/// Client-facing scheme of one proxied request. HTTPS means the client
/// issued a CONNECT and the payload is tunneled opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Scheme {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "HTTP"),
            Scheme::Https => write!(f, "HTTPS"),
        }
    }
}

/// One telemetry row per handled client request, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    /// `host:port` of the chosen upstream.
    pub proxy: String,
    pub domain: String,
    /// Shortened request path; `None` for CONNECT tunnels.
    pub path: Option<String>,
    pub scheme: Scheme,
    pub bw_up: Option<u64>,
    pub bw_down: Option<u64>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub total_time_ms: u64,
    /// Unix seconds at which the client request arrived.
    pub time_of_request: u64,
    pub pool_name: String,
    pub listener_port: u16,
}

/// Where completed-request records go. Emission is best-effort: the handler
/// logs a failed emit and moves on.
pub trait RecordSink: Send + Sync {
    fn emit(&self, record: RequestRecord) -> anyhow::Result<()>;
}

/// Default sink: a bounded in-memory ring the introspection API reads, plus
/// one structured log line per record when request logging is enabled.
pub struct RequestLog {
    log_requests: bool,
    capacity: usize,
    entries: Mutex<VecDeque<RequestRecord>>,
}

impl RequestLog {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(log_requests: bool) -> Self {
        Self::with_capacity(log_requests, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(log_requests: bool, capacity: usize) -> Self {
        RequestLog {
            log_requests,
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Records, most recent last.
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSink for RequestLog {
    fn emit(&self, record: RequestRecord) -> anyhow::Result<()> {
        if self.log_requests {
            info!(
                proxy = %record.proxy,
                domain = %record.domain,
                path = record.path.as_deref().unwrap_or("-"),
                scheme = %record.scheme,
                bw_up = record.bw_up,
                bw_down = record.bw_down,
                status = record.status_code,
                error = record.error.as_deref().unwrap_or("-"),
                total_time_ms = record.total_time_ms,
                pool = %record.pool_name,
                port = record.listener_port,
                "request"
            );
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("request log poisoned"))?;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(proxy: &str) -> RequestRecord {
        RequestRecord {
            proxy: proxy.to_string(),
            domain: "example.com".to_string(),
            path: Some("/x".to_string()),
            scheme: Scheme::Http,
            bw_up: Some(10),
            bw_down: Some(20),
            status_code: Some(200),
            error: None,
            total_time_ms: 5,
            time_of_request: 1_700_000_000,
            pool_name: "a".to_string(),
            listener_port: 8080,
        }
    }

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let log = RequestLog::with_capacity(false, 2);
        log.emit(record("p1:80")).unwrap();
        log.emit(record("p2:80")).unwrap();
        log.emit(record("p3:80")).unwrap();

        let got = log.snapshot();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].proxy, "p2:80");
        assert_eq!(got[1].proxy, "p3:80");
    }

    #[test]
    fn records_serialize_with_wire_scheme_names() {
        let json = serde_json::to_value(record("p:80")).unwrap();
        assert_eq!(json["scheme"], "HTTP");
        assert_eq!(json["status_code"], 200);
        assert!(json["error"].is_null());
    }
}
