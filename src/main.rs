//! Convgate - single-user gate and rewriting proxy for a hosted chat service.
//!
//! Binds one local port, authenticates callers with signed cookie tokens,
//! authorizes per-conversation access against the ownership store, and
//! forwards everything else to the configured upstream host.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use convgate::config::{ConfigHandle, GateConfig};
use convgate::error::GateError;
use convgate::logging_layer::LoggingLayer;
use convgate::proxy_service::{GateBody, GateService};
use convgate::store::ConversationStore;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast};
use tokio::time::sleep;
use tower::ServiceBuilder;
use tracing::{error, info, warn};

/// Command-line configuration for the gate server.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "CONVGATE_PORT", default_value = "3000")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Graceful shutdown timeout in seconds
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "30")]
    shutdown_timeout: u64,

    /// Path to the JSON config file (defaults + env overrides if omitted)
    #[arg(short, long, env = "CONVGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the SQLite ownership database
    #[arg(long, env = "CONVGATE_DB", default_value = "./convgate.sqlite")]
    db_path: PathBuf,
}

/// Connection tracker for graceful shutdown.
#[derive(Clone)]
struct ConnectionTracker {
    active_connections: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    fn new() -> Self {
        Self {
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn increment(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    fn count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }
}

/// Main entry point for the convgate proxy.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let gate_config = GateConfig::load(cli.config.as_deref())?;

    #[cfg(feature = "metrics")]
    {
        let metrics_port = gate_config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(metrics_port).await {
                error!(error = %e, "Metrics server error");
            }
        });
        info!(metrics_port, "Metrics endpoint started");
    }

    let store = ConversationStore::open(&cli.db_path)?;
    let config = ConfigHandle::new(gate_config);
    let snapshot = config.current();

    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(
        bind = %cli.bind,
        port = cli.port,
        upstream = %snapshot.upstream_host,
        db = %cli.db_path.display(),
        shutdown_timeout = cli.shutdown_timeout,
        max_concurrent_streams = snapshot.max_concurrent_streams,
        "Convgate starting"
    );

    let gate_service = GateService::new(config.clone(), store)?;
    let service_stack = ServiceBuilder::new()
        .layer(LoggingLayer)
        .service(gate_service);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    let connection_tracker = ConnectionTracker::new();
    let tracker_clone = connection_tracker.clone();

    // Connection-level concurrency limit.
    let semaphore = Arc::new(Semaphore::new(snapshot.max_concurrent_streams));

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                let _ = shutdown_tx_clone.send(());
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let shutdown_tx_sigterm = shutdown_tx.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    let _ = shutdown_tx_sigterm.send(());
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(p) => p,
                            Err(_) => {
                                warn!(
                                    peer = %peer_addr,
                                    max_streams = snapshot.max_concurrent_streams,
                                    "Rejected connection: max concurrent streams reached"
                                );
                                tokio::spawn(async move {
                                    let _ = send_503_response(stream).await;
                                });
                                continue;
                            }
                        };

                        if let Err(e) = configure_tcp_stream(&stream, &snapshot) {
                            error!(error = %e, "Failed to configure socket");
                        }

                        let service_stack = service_stack.clone();
                        let mut conn_shutdown_rx = shutdown_tx.subscribe();
                        let tracker = connection_tracker.clone();

                        tracker.increment();

                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, service_stack, &mut conn_shutdown_rx).await
                            {
                                error!(error = %e, "Connection handling error");
                            }

                            tracker.decrement();
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    info!(
        active_connections = tracker_clone.count(),
        timeout_seconds = cli.shutdown_timeout,
        "Waiting for active connections to drain"
    );

    let shutdown_deadline = Duration::from_secs(cli.shutdown_timeout);
    let start = std::time::Instant::now();

    while tracker_clone.count() > 0 {
        if start.elapsed() >= shutdown_deadline {
            warn!(
                active_connections = tracker_clone.count(),
                "Shutdown timeout reached, forcing exit"
            );
            break;
        }

        sleep(Duration::from_millis(100)).await;
    }

    if tracker_clone.count() == 0 {
        info!("All connections drained, shutting down cleanly");
    }

    Ok(())
}

/// Serve a single connection, converting gate errors into the responses
/// the client is allowed to see.
async fn handle_connection<S>(
    stream: TcpStream,
    service: S,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), GateError>
where
    S: tower::Service<Request<Incoming>, Response = Response<GateBody>, Error = GateError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req| {
        let mut svc = service.clone();
        async move {
            let result: Result<_, std::convert::Infallible> = match svc.call(req).await {
                Ok(response) => {
                    convgate::metrics::record_request("ok");
                    Ok(response)
                }
                Err(e) => {
                    convgate::metrics::record_request(e.kind());
                    match &e {
                        // Expected gate outcomes; the access log already has them.
                        GateError::AuthenticationMissing | GateError::AuthorizationDenied(_) => {}
                        other => error!(error = %other, "Request failed"),
                    }
                    Ok(e.to_response().map(|body| {
                        body.map_err(|never: std::convert::Infallible| match never {})
                            .boxed()
                    }))
                }
            };
            result
        }
    });

    let executor = hyper_util::rt::TokioExecutor::new();
    let builder = auto::Builder::new(executor);
    let conn = builder.serve_connection_with_upgrades(io, svc_fn);

    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                error!(error = %e, "Connection error");
            }
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
        }
    }

    Ok(())
}

/// Configure a TcpStream with the tuned socket options.
fn configure_tcp_stream(stream: &TcpStream, config: &GateConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = socket2::SockRef::from(stream);

    let keepalive =
        socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keepalive_secs));
    socket.set_tcp_keepalive(&keepalive)?;

    socket.set_recv_buffer_size(config.socket_buffer_size)?;
    socket.set_send_buffer_size(config.socket_buffer_size)?;

    Ok(())
}

/// Send a 503 when the connection semaphore is exhausted.
async fn send_503_response(mut stream: TcpStream) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = "503 Service Unavailable\n\n\
                The gate has reached its maximum concurrent connection limit.\n\
                Please retry your request in a moment.";
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Retry-After: 1\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Serve the Prometheus metrics endpoint on a side port.
#[cfg(feature = "metrics")]
async fn serve_metrics(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    use axum::{Router, response::IntoResponse, routing::get};

    async fn metrics_handler() -> impl IntoResponse {
        match convgate::metrics::render() {
            Ok(text) => (
                axum::http::StatusCode::OK,
                [(
                    axum::http::header::CONTENT_TYPE,
                    "text/plain; charset=utf-8",
                )],
                text,
            )
                .into_response(),
            Err(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response(),
        }
    }

    let app = Router::new().route("/metrics", get(metrics_handler));

    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(addr = %addr, "Metrics server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
