//! TCP listener and server lifecycle.
//!
//! [`Server::start`] binds and spawns the accept loop; [`Server::stop`] tears
//! the accept loop down and closes the listening socket. Connections already
//! accepted are not touched by `stop`: each runs in its own task until the
//! peer disconnects, asks to close, or the connection fails.
//!
//! Handlers reach the server that runs them through a [`ServerControl`],
//! which is how an api can shut its own server down.
//!
//! Without `max_connections` every accepted connection gets its own task and
//! nothing bounds how many run at once.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use procbridge_protocol::Connection;

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::ConnectionHandler;
use crate::registry::HandlerRegistry;

/// Pause after a failed accept, so persistent errors (fd exhaustion) do not
/// spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State of a started server.
struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// State shared between a [`Server`] and the [`ServerControl`]s it hands out.
struct Shared {
    /// Server configuration.
    config: ServerConfig,
    /// Handler shared by every connection task.
    handler: ConnectionHandler,
    /// Start/stop state lock; `Some` while started.
    state: Mutex<Option<Running>>,
    /// Mirrors whether the server is started, for waiters.
    running_tx: watch::Sender<bool>,
}

/// procbridge TCP server.
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Creates a server. The registry is frozen from here on.
    pub fn new(config: ServerConfig, registry: HandlerRegistry) -> Self {
        let (running_tx, _) = watch::channel(false);
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            config,
            handler: ConnectionHandler::new(Arc::new(registry))
                .with_control(ServerControl { server: weak.clone() }),
            state: Mutex::new(None),
            running_tx,
        });
        Self { shared }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Returns the registry requests are dispatched to.
    pub fn registry(&self) -> &HandlerRegistry {
        self.shared.handler.registry()
    }

    /// Returns a handle that can stop this server from elsewhere.
    pub fn control(&self) -> ServerControl {
        ServerControl {
            server: Arc::downgrade(&self.shared),
        }
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Calling `start` on a started server does nothing and returns the
    /// address it is already bound to.
    pub async fn start(&self) -> ServerResult<SocketAddr> {
        self.shared.start().await
    }

    /// Stops accepting connections and closes the listening socket.
    ///
    /// Returns once the listener has been dropped. Calling `stop` on a server
    /// that is not started does nothing.
    pub async fn stop(&self) -> ServerResult<()> {
        self.shared.stop().await
    }

    /// Returns true between a successful `start` and the next `stop`.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Returns the bound address while started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Waits until the server is stopped.
    ///
    /// Resolves immediately if the server is not started.
    pub async fn wait_for_stop(&self) {
        let mut rx = self.shared.running_tx.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }
}

impl Shared {
    async fn start(&self) -> ServerResult<SocketAddr> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            debug!(addr = %running.local_addr, "server already started");
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let limiter = self
            .config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.config.clone(),
            limiter,
            shutdown_rx,
        ));

        *state = Some(Running {
            local_addr,
            shutdown_tx,
            accept_task,
        });
        self.running_tx.send_replace(true);
        info!(addr = %local_addr, "server listening");
        Ok(local_addr)
    }

    async fn stop(&self) -> ServerResult<()> {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            debug!("server not started");
            return Ok(());
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }

        self.running_tx.send_replace(false);
        info!(addr = %running.local_addr, "server stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }
}

/// Handle to the server running a handler.
///
/// Obtained from [`RequestContext::server`](crate::RequestContext::server) or
/// [`Server::control`]. It does not keep the server alive; once the
/// [`Server`] is dropped every operation is a no-op. A connection handler
/// used without a server carries a detached control.
#[derive(Debug, Clone, Default)]
pub struct ServerControl {
    server: Weak<Shared>,
}

impl ServerControl {
    /// Creates a control that is not attached to any server.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Returns true if the server is alive and started.
    pub fn is_running(&self) -> bool {
        self.server
            .upgrade()
            .is_some_and(|server| server.is_running())
    }

    /// Stops the server in the background and returns immediately.
    ///
    /// A handler calling this still gets its response written; open
    /// connections keep being served.
    pub fn request_stop(&self) {
        let Some(server) = self.server.upgrade() else {
            debug!("stop requested without a server");
            return;
        };
        info!("server stop requested");
        tokio::spawn(async move {
            if let Err(e) = server.stop().await {
                warn!(error = %e, "requested stop failed");
            }
        });
    }

    /// Stops the server and waits until the listener is closed.
    pub async fn stop(&self) -> ServerResult<()> {
        match self.server.upgrade() {
            Some(server) => server.stop().await,
            None => Ok(()),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: ConnectionHandler,
    config: ServerConfig,
    limiter: Option<Arc<Semaphore>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let permit = match &limiter {
            Some(semaphore) => tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.ok(),
                _ = shutdown_rx.changed() => break,
            },
            None => None,
        };

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted connection");
                    let conn = Connection::from_tcp(stream).with_read_timeout(config.read_timeout);
                    tokio::spawn(serve_connection(handler.clone(), conn, peer, permit));
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    if backoff(&mut shutdown_rx).await {
                        break;
                    }
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("accept loop exited");
}

/// Sleeps for [`ACCEPT_BACKOFF`]. Returns true if stop was signalled meanwhile.
async fn backoff(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => false,
        _ = shutdown_rx.changed() => true,
    }
}

async fn serve_connection(
    handler: ConnectionHandler,
    conn: Connection<tokio::net::TcpStream>,
    peer: SocketAddr,
    _permit: Option<OwnedSemaphorePermit>,
) {
    match handler.handle_connection(conn).await {
        Ok(()) => debug!(peer = %peer, "connection closed"),
        Err(e) => warn!(peer = %peer, error = %e, "connection closed with error"),
    }
}
