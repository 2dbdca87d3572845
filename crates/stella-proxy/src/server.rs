//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! The server accepts TCP connections, reads the request head, and
//! dispatches on its shape:
//!
//! CONNECT method         -> [`connect`] handler (tunnel)
//! Absolute-form `http://` -> [`forward`] handler (rewritten request)
//! Anything else           -> `400 Bad Request`
//!
//! Every upstream connection is made through the dialer given to [`start`],
//! normally the composed hop chain.

use crate::config::ProxyConfig;
use crate::connect;
use crate::dial::Dialer;
use crate::error::{ProxyError, Result};
use crate::forward;
use crate::handshake::MAX_HEADER_SIZE;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Handle returned when the proxy server starts.
///
/// Call [`ProxyHandle::shutdown`] to stop accepting connections. Tunnels
/// already relaying keep running until either side closes.
pub struct ProxyHandle {
    /// The actual address the proxy is listening on
    pub local_addr: SocketAddr,
    /// Send `true` to trigger graceful shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyHandle {
    /// The port the proxy is listening on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Signal the proxy to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Shared state for the proxy server.
struct ProxyState {
    config: ProxyConfig,
    dialer: Arc<dyn Dialer>,
    /// One permit per live client connection; `None` when unlimited.
    connection_limit: Option<Arc<Semaphore>>,
}

/// Start the proxy server.
///
/// Binds to `config.bind_addr:config.bind_port` (port 0 = OS-assigned) and
/// begins accepting connections on the current runtime.
pub async fn start(config: ProxyConfig, dialer: Arc<dyn Dialer>) -> Result<ProxyHandle> {
    let bind_addr = SocketAddr::new(config.bind_addr, config.bind_port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;

    let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: bind_addr.to_string(),
        source: e,
    })?;

    info!("Proxy server listening on {}", local_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let connection_limit =
        (config.max_connections > 0).then(|| Arc::new(Semaphore::new(config.max_connections)));
    let state = Arc::new(ProxyState {
        config,
        dialer,
        connection_limit,
    });

    tokio::spawn(accept_loop(listener, state, shutdown_rx));

    Ok(ProxyHandle {
        local_addr,
        shutdown_tx,
    })
}

/// Accept loop: listen for connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        // The permit lives in the handler task and is released
                        // when that task ends, even by panic.
                        let permit = match &state.connection_limit {
                            Some(limit) => match Arc::clone(limit).try_acquire_owned() {
                                Ok(permit) => Some(permit),
                                Err(_) => {
                                    warn!(
                                        "Connection limit reached ({}), rejecting {}",
                                        state.config.max_connections, addr
                                    );
                                    drop(stream);
                                    continue;
                                }
                            },
                            None => None,
                        };

                        debug!("Accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = handle_connection(stream, &state).await {
                                debug!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Proxy server shutting down");
                    return;
                }
            }
        }
    }
}

/// Handle a single client connection.
async fn handle_connection(mut stream: TcpStream, state: &ProxyState) -> Result<()> {
    // The BufReader may read ahead past the head; those bytes are handed to
    // the handler so nothing the client sent is lost.
    let mut buf_reader = BufReader::new(&mut stream);
    let mut first_line = String::new();
    let n = (&mut buf_reader)
        .take(MAX_HEADER_SIZE as u64)
        .read_line(&mut first_line)
        .await?;

    if n == 0 {
        return Ok(()); // Client disconnected
    }
    if !first_line.ends_with('\n') {
        drop(buf_reader);
        return reject(&mut stream, 431, "Request Header Fields Too Large").await;
    }

    let mut header_bytes = Vec::new();
    loop {
        let mut line = String::new();
        let n = (&mut buf_reader)
            .take(MAX_HEADER_SIZE as u64 + 1)
            .read_line(&mut line)
            .await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        header_bytes.extend_from_slice(line.as_bytes());
        if header_bytes.len() > MAX_HEADER_SIZE {
            drop(buf_reader);
            return reject(&mut stream, 431, "Request Header Fields Too Large").await;
        }
    }

    let buffered = buf_reader.buffer().to_vec();
    drop(buf_reader);

    let first_line = first_line.trim_end();
    let dialer = state.dialer.as_ref();
    let deadline = state.config.dial_deadline;

    if first_line.starts_with("CONNECT ") {
        connect::handle_connect(first_line, &mut stream, &buffered, dialer, deadline).await
    } else if forward::is_absolute_form(first_line) {
        match forward::parse_forward_target(first_line) {
            Ok(_) => {
                forward::handle_forward(
                    first_line,
                    &mut stream,
                    &header_bytes,
                    &buffered,
                    dialer,
                    deadline,
                )
                .await
            }
            Err(e) => {
                reject(&mut stream, 400, "Bad Request").await?;
                Err(e)
            }
        }
    } else {
        debug!("Rejecting request: {}", first_line);
        reject(&mut stream, 400, "Bad Request").await
    }
}

async fn reject(stream: &mut TcpStream, status: u16, reason: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
