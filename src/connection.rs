//! Accept loop and per-connection control.
//!
//! Every accepted connection gets a [`ConnectionControl`] inserted into the
//! extensions of each request it carries. Middleware that wants to simulate a
//! broken upstream asks the control to close the connection; the connection
//! task then drops the socket without writing anything back.

use axum::extract::ConnectInfo;
use axum::http::Extensions;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Handle to the transport connection a request arrived on.
#[derive(Debug, Clone, Default)]
pub struct ConnectionControl {
    close: Arc<Notify>,
}

impl ConnectionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the connection task to drop the socket.
    pub fn close(&self) {
        self.close.notify_one();
    }

    pub async fn closed(&self) {
        self.close.notified().await
    }
}

/// Closes the connection the request arrived on without sending a response.
///
/// When the transport supports it this never resolves: the connection task
/// drops the in-flight request together with the socket. Requests that did
/// not come through [`serve`] have no control attached and get
/// [`Error::HijackUnsupported`].
pub async fn drop_connection(extensions: &Extensions) -> Result<Infallible> {
    let control = extensions
        .get::<ConnectionControl>()
        .cloned()
        .ok_or(Error::HijackUnsupported)?;
    control.close();
    Ok(std::future::pending().await)
}

/// Accepts connections until `shutdown` flips, serving each on its own task.
///
/// Every connection task holds a clone of `drain`; the sender side resolves
/// `closed()` once all of them have finished.
pub(crate) async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
    drain: watch::Receiver<()>,
) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!(%remote_addr, error = %err, "could not set TCP_NODELAY");
        }

        tokio::spawn(serve_connection(
            stream,
            remote_addr,
            app.clone(),
            shutdown.clone(),
            drain.clone(),
        ));
    }

    debug!("stopped accepting connections");
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
    _drain: watch::Receiver<()>,
) {
    let control = ConnectionControl::new();
    let request_control = control.clone();
    let service = app.map_request(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(request_control.clone());
        request.extensions_mut().insert(ConnectInfo(remote_addr));
        request
    });

    let builder = Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(connection);

    let mut draining = *shutdown.borrow();
    if draining {
        connection.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(err) = result {
                    debug!(%remote_addr, error = %err, "connection ended with an error");
                }
                break;
            }
            _ = control.closed() => {
                debug!(%remote_addr, "dropping connection without a response");
                break;
            }
            _ = shutdown.changed(), if !draining => {
                // finishes in-flight requests and disables keep-alive
                connection.as_mut().graceful_shutdown();
                draining = true;
            }
        }
    }
}
