use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::config::ForwardingRule;
use crate::connection::ProxyConnection;
use crate::connid::ConnIdGenerator;
use crate::pipeline::ShutdownRx;
use crate::sink::EventSink;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bind the rule's local port on all IPv4 interfaces.
pub async fn bind(rule: &ForwardingRule) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, rule.local_port));
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            Err(err).with_context(|| format!("port {} is already in use", rule.local_port))
        }
        Err(err) => Err(err).with_context(|| format!("cannot bind to port {}", rule.local_port)),
    }
}

/// Accept clients on `listener` and hand each one to a [`ProxyConnection`] for the rule's
/// target. Stops accepting once `shutdown` fires; connections already running are left alone.
pub fn spawn(
    listener: TcpListener,
    rule: Arc<ForwardingRule>,
    sink: EventSink,
    ids: Arc<ConnIdGenerator>,
    shutdown: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move { accept_loop(listener, rule, sink, ids, shutdown).await })
}

#[instrument(skip_all, fields(local_port = rule.local_port, target = %rule.target()))]
async fn accept_loop(
    listener: TcpListener,
    rule: Arc<ForwardingRule>,
    sink: EventSink,
    ids: Arc<ConnIdGenerator>,
    mut shutdown: ShutdownRx,
) {
    info!("forwarding");
    loop {
        tokio::select! {
            biased;
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    info!("shutdown received; no longer accepting");
                    break;
                }
            }
            accept_res = listener.accept() => match accept_res {
                Ok((client, peer)) => {
                    let conn = ProxyConnection::new(client, rule.clone(), sink.clone(), &ids);
                    debug!(%peer, conn_id = conn.id(), "client accepted");
                    tokio::spawn(conn.start());
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
}
