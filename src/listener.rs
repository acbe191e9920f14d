use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener as TcpAcceptor, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::handler::{self, HandlerCtx};
use crate::router::Router;
use crate::telemetry::RecordSink;

/// Accepts client connections on one `(host, port)` and runs a handler task
/// per connection. In-flight handlers are tracked so `stop()` can drain
/// them; a handler failing with `NoProxy` shuts the listener down.
pub struct Listener {
    host: String,
    pub port: u16,
    router: Arc<Router>,
    sink: Arc<dyn RecordSink>,
    timeout: Duration,
    shutdown: watch::Sender<bool>,
    connections: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Listener {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        router: Arc<Router>,
        sink: Arc<dyn RecordSink>,
        timeout: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Listener {
            host: host.into(),
            port,
            router,
            sink,
            timeout,
            shutdown,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            accept_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Bind the accept socket and start serving. Returns once the socket is
    /// bound; accepting runs in a background task until [`stop`].
    ///
    /// # Errors
    /// Fails when the address cannot be bound.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let acceptor = TcpAcceptor::bind((self.host.as_str(), self.port)).await?;
        info!("listening established on {}", acceptor.local_addr()?);

        let this = self.clone();
        let task = tokio::spawn(async move { this.accept_loop(acceptor).await });
        *self.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, acceptor: TcpAcceptor) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let sock = tokio::select! {
                res = acceptor.accept() => match res {
                    Ok((sock, peer)) => {
                        debug!("accepted connection from {peer}");
                        sock
                    }
                    Err(e) => {
                        warn!("failed to accept connection: {e}");
                        continue;
                    }
                },
                _ = handler::cancelled(&mut shutdown) => break,
            };
            self.spawn_handler(sock);
        }
        debug!("accept loop on port {} exited", self.port);
    }

    fn spawn_handler(self: &Arc<Self>, sock: TcpStream) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = HandlerCtx {
            router: self.router.clone(),
            sink: self.sink.clone(),
            timeout: self.timeout,
            port: self.port,
            shutdown: self.shutdown.subscribe(),
        };

        let this = self.clone();
        // holding the map lock across the spawn orders the insert before the
        // handler's own removal
        let mut connections = self.connections.lock().unwrap();
        let task = tokio::spawn(async move {
            let res = handler::handle(sock, ctx).await;
            this.connections.lock().unwrap().remove(&id);
            match res {
                Ok(()) => {}
                Err(e @ ProxyError::NoProxy { .. }) => {
                    error!("{e}; shutting the listener down");
                    this.stop().await;
                }
                Err(e) => error!("connection ended with error: {e:#}"),
            }
        });
        connections.insert(id, task);
    }

    /// Signal in-flight handlers, give them a moment to record and release,
    /// then tear down whatever is left. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping listener on port {}", self.port);
        let _ = self.shutdown.send(true);
        tokio::time::sleep(Duration::from_millis(500)).await;

        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let stragglers: Vec<JoinHandle<()>> = self
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in stragglers {
            task.abort();
        }
        info!("server on port {} is stopped", self.port);
    }

    pub fn in_flight(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
