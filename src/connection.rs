use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::config::ForwardingRule;
use crate::connid::ConnIdGenerator;
use crate::event::{EventKind, TraceEvent, format_addr};
use crate::sink::EventSink;

const BUFFER_SIZE: usize = 32 * 1024;

/// One accepted client paired with its outbound connection to the rule's target.
pub struct ProxyConnection {
    id: String,
    client: TcpStream,
    rule: Arc<ForwardingRule>,
    sink: EventSink,
}

impl ProxyConnection {
    pub fn new(
        client: TcpStream,
        rule: Arc<ForwardingRule>,
        sink: EventSink,
        ids: &ConnIdGenerator,
    ) -> Self {
        Self {
            id: ids.next(),
            client,
            rule,
            sink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connect to the target and relay traffic in both directions until either side stops.
    ///
    /// A failed connect drops the client without emitting any event. Otherwise an `open`
    /// event is recorded, followed by `data` events per chunk and one `close` per direction.
    #[instrument(skip_all, fields(conn_id = %self.id, target = %self.rule.target()))]
    pub async fn start(self) {
        let Self {
            id,
            client,
            rule,
            sink,
        } = self;
        let target = rule.target();

        let server = match TcpStream::connect((rule.target_host.as_str(), rule.target_port)).await
        {
            Ok(stream) => stream,
            Err(err) => {
                debug!(error = %err, "target connect failed; closing client");
                return;
            }
        };
        let client_addr = match client.peer_addr() {
            Ok(addr) => format_addr(&addr),
            Err(err) => {
                debug!(error = %err, "client went away before forwarding started");
                return;
            }
        };
        client.set_nodelay(true).ok();
        server.set_nodelay(true).ok();

        sink.record(&TraceEvent::now(&id, EventKind::Open, &client_addr, &target));
        debug!(client = %client_addr, "connection open");

        let (teardown, _) = watch::channel(false);
        let relay = Relay {
            id: &id,
            sink: &sink,
            teardown: &teardown,
        };
        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();
        tokio::join!(
            relay.forward(client_read, server_write, &client_addr, &target),
            relay.forward(server_read, client_write, &target, &client_addr),
        );
        debug!(client = %client_addr, "connection closed");
    }
}

/// State shared by the two directions of one connection.
struct Relay<'a> {
    id: &'a str,
    sink: &'a EventSink,
    teardown: &'a watch::Sender<bool>,
}

impl Relay<'_> {
    /// Copy `source` into `dest` one chunk at a time. Each chunk is recorded and fully written
    /// before the next read. EOF, an I/O error, or teardown by the other direction all end the
    /// loop with a single `close` event.
    async fn forward<R, W>(&self, mut source: R, mut dest: W, from: &str, to: &str)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut closed = self.teardown.subscribe();
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                _ = closed.wait_for(|done| *done) => break,
                read = source.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    debug!(%from, %to, error = %err, "read failed");
                    break;
                }
            };

            let chunk = &buf[..n];
            self.sink
                .record(&TraceEvent::now(self.id, EventKind::Data(chunk), from, to));

            let written = tokio::select! {
                biased;
                _ = closed.wait_for(|done| *done) => break,
                written = dest.write_all(chunk) => written,
            };
            if let Err(err) = written {
                debug!(%from, %to, error = %err, "write failed");
                break;
            }
        }

        self.sink
            .record(&TraceEvent::now(self.id, EventKind::Close, from, to));
        self.cleanup();
    }

    /// Make the other direction stop too. Safe to call more than once.
    fn cleanup(&self) {
        self.teardown.send_replace(true);
    }
}
