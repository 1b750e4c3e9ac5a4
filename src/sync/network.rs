//! Socket glue between tokio and the engine.
//!
//! - one accept loop per `[[bind]]` block
//! - one dialer task turning [`DialRequest`]s into TCP connects
//! - one task per connection moving lines between the socket and the engine
//! - the engine loop itself, which owns the [`SpanningTree`] and is the only
//!   place it is touched

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, error, info};
use treelink_proto::LineCodec;

use super::engine::{DialRequest, LinkEvent, SpanningTree};
use super::link::{LinkId, LinkIdAllocator, Outbound};
use crate::config::Config;
use crate::telemetry::spans;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind listeners, start the engine and run until Ctrl-C.
pub async fn run(config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    let server_name = config.server.name.clone();
    let mut engine = SpanningTree::new(config.clone());
    let ids = engine.link_ids();
    let (event_tx, mut events) = unbounded_channel::<LinkEvent>();
    let (dial_tx, dial_rx) = unbounded_channel::<DialRequest>();
    engine.set_dialer(dial_tx);

    for bind in config.bind.iter().filter(|b| b.is_servers()) {
        let listener = TcpListener::bind(bind.address).await?;
        let addr = bind.address.to_string();
        engine.add_listener(&addr);
        info!(address = %addr, "Server listener started");
        tokio::spawn(accept_loop(listener, ids.clone(), event_tx.clone()));
    }
    let connect_timeout = Duration::from_secs(config.protocol.connect_timeout);
    tokio::spawn(dial_loop(dial_rx, event_tx.clone(), connect_timeout));

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut hangup = Hangup::new()?;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    async move {
        info!("Engine running");
        loop {
            tokio::select! {
                Some(event) = events.recv() => engine.handle_event(event),
                _ = ticker.tick() => engine.tick(),
                _ = hangup.recv() => rehash(&mut engine, &config_path),
                res = &mut shutdown => {
                    res?;
                    info!("Shutting down");
                    engine.shutdown("Server shutting down");
                    break;
                }
            }
        }
        // Let writer tasks flush their ERROR lines.
        tokio::time::sleep(Duration::from_millis(250)).await;
        Ok::<(), anyhow::Error>(())
    }
    .instrument(spans::engine(&server_name))
    .await
}

fn rehash(engine: &mut SpanningTree, path: &Path) {
    info!(path = %path.display(), "Rehashing");
    match Config::load(path) {
        Ok(config) => {
            if let Err(errors) = engine.rehash(config) {
                for e in errors {
                    error!(error = %e, "Rehash rejected");
                }
            }
        }
        Err(e) => error!(path = %path.display(), error = %e, "Failed to reload config"),
    }
}

/// Accept server connections until the engine goes away.
pub async fn accept_loop(listener: TcpListener, ids: LinkIdAllocator, events: UnboundedSender<LinkEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let link = ids.next();
                let addr = peer.to_string();
                let (tx, rx) = unbounded_channel();
                let accepted = LinkEvent::Accepted {
                    link,
                    addr: addr.clone(),
                    outbox: tx,
                };
                if events.send(accepted).is_err() {
                    break;
                }
                let span = spans::link(link.0, &addr);
                tokio::spawn(connection(link, stream, rx, events.clone()).instrument(span));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept server connection");
                // Out of descriptors and similar errors repeat immediately.
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Open outbound connections as the engine asks for them.
pub async fn dial_loop(
    mut requests: UnboundedReceiver<DialRequest>,
    events: UnboundedSender<LinkEvent>,
    connect_timeout: Duration,
) {
    while let Some(req) = requests.recv().await {
        let events = events.clone();
        tokio::spawn(async move {
            let DialRequest {
                link,
                name,
                address,
                port,
                outbox,
            } = req;
            let target = format!("{address}:{port}");
            match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
                Ok(Ok(stream)) => {
                    if events.send(LinkEvent::Connected { link }).is_ok() {
                        connection(link, stream, outbox, events)
                            .instrument(spans::peer(&name, link.0))
                            .await;
                    }
                }
                Ok(Err(e)) => {
                    let _ = events.send(LinkEvent::ConnectFailed {
                        link,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    let _ = events.send(LinkEvent::ConnectFailed {
                        link,
                        reason: "Connection timed out".to_string(),
                    });
                }
            }
        });
    }
}

/// Pump one socket: inbound lines to the engine, outbox items to the wire.
async fn connection(
    link: LinkId,
    stream: TcpStream,
    mut outbox: UnboundedReceiver<Outbound>,
    events: UnboundedSender<LinkEvent>,
) {
    let _ = stream.set_nodelay(true);
    let (mut sink, mut lines) = Framed::new(stream, LineCodec::new()).split();

    let reason = loop {
        tokio::select! {
            out = outbox.recv() => match out {
                Some(Outbound::Line(line)) => {
                    if let Err(e) = sink.send(line).await {
                        break e.to_string();
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    break "Closed by server".to_string();
                }
            },
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    if events.send(LinkEvent::Line { link, line }).is_err() {
                        break "Engine stopped".to_string();
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "Connection closed".to_string(),
            },
        }
    };
    debug!(link_id = %link, reason = %reason, "Connection finished");
    let _ = events.send(LinkEvent::Closed { link, reason });
}

#[cfg(unix)]
struct Hangup(tokio::signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self(signal(SignalKind::hangup())?))
    }

    async fn recv(&mut self) {
        self.0.recv().await;
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
