use std::{net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use postern_common::{Signal, error::ListenerError, internal, tracing};
use tokio::{net::TcpListener, sync::broadcast::error::RecvError};

use crate::session::{Session, SessionConfig};

/// Accepts inbound SMTP connections and runs one session task per peer.
#[derive(Debug)]
pub struct Listener {
    socket: SocketAddr,
    config: Arc<SessionConfig>,
}

impl Listener {
    #[must_use]
    pub const fn new(socket: SocketAddr, config: Arc<SessionConfig>) -> Self {
        Self { socket, config }
    }

    /// Bind and serve until `shutdown` delivers [`Signal::Shutdown`], then
    /// wait for open sessions to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or accepting fails.
    pub async fn serve(
        &self,
        shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        let listener =
            TcpListener::bind(self.socket)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: self.socket.to_string(),
                    source,
                })?;

        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting a connection fails.
    #[tracing::instrument(level = "trace", skip_all, fields(socket = %self.socket), err)]
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        internal!(level = INFO, "Serving SMTP on {}", self.socket);
        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(level = INFO, "SMTP Listener {} received shutdown signal, finishing sessions ...", self.socket);
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    tracing::debug!("Connection received on {} from {peer}", self.socket);

                    let session = Session::create(stream, peer, Arc::clone(&self.config));
                    let signal = shutdown.resubscribe();
                    sessions.retain(|handle: &tokio::task::JoinHandle<()>| !handle.is_finished());
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            if err.is_client_error() {
                                internal!(level = DEBUG, "{peer}: {err}");
                            } else {
                                internal!(level = ERROR, "{peer}: {err}");
                            }
                        }
                    }));
                }
            }
        }

        Ok(())
    }
}
