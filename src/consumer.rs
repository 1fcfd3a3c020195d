//! Subscribes a handler to one topic on every nsqd that carries it.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::error::{Error, Result};
use crate::lookupd::LookupdClient;
use crate::protocol::{
    CLOSE_WAIT, Command, Frame, IdentifyBody, MAGIC_V2, Message, expect_response, read_frame,
    write_command,
};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const BACKOFF_JITTER_MS: u64 = 250;

pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(&self, message: &Message);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// We asked to close and nsqd let us go.
    Shutdown,
    /// nsqd hung up on its own.
    Closed,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub topic: String,
    pub channel: String,
    pub identify: IdentifyBody,
}

impl SubscribeOptions {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        SubscribeOptions {
            topic: topic.into(),
            channel: channel.into(),
            identify: IdentifyBody::default(),
        }
    }

    // two missed heartbeats and the connection is considered dead
    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.identify.heartbeat_interval.max(1_000) as u64 * 2)
    }
}

/// Runs the V2 handshake on `stream` and feeds every delivered message to
/// `handler` until nsqd hangs up or `shutdown` flips. Every new value on `rdy`
/// is forwarded to nsqd as a fresh `RDY`.
pub async fn consume<S, H>(
    stream: S,
    opts: &SubscribeOptions,
    mut rdy: watch::Receiver<u32>,
    handler: &H,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Exit>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: MessageHandler + ?Sized,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    writer.write_all(MAGIC_V2).await?;
    write_command(&mut writer, &Command::identify(&opts.identify)?).await?;
    expect_response(&mut reader, "OK").await?;
    write_command(
        &mut writer,
        &Command::Sub {
            topic: opts.topic.clone(),
            channel: opts.channel.clone(),
        },
    )
    .await?;
    expect_response(&mut reader, "OK").await?;
    let initial_rdy = *rdy.borrow_and_update();
    write_command(&mut writer, &Command::Rdy(initial_rdy)).await?;

    // A dedicated reader keeps partially read frames intact when the select
    // below picks the shutdown branch.
    let (tx, mut rx) = mpsc::channel(initial_rdy as usize + 1);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader).await;
            let failed = frame.is_err();
            if tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });

    let read_timeout = opts.read_timeout();
    let mut closing = false;
    let mut rdy_open = true;
    let result: Result<Exit> = loop {
        tokio::select! {
            next = timeout(read_timeout, rx.recv()) => {
                let frame = match next {
                    Err(_) => {
                        let msg = "nsqd stopped sending heartbeats";
                        break Err(io::Error::new(io::ErrorKind::TimedOut, msg).into());
                    }
                    Ok(None) => break Ok(if closing { Exit::Shutdown } else { Exit::Closed }),
                    Ok(Some(Err(_))) if closing => break Ok(Exit::Shutdown),
                    Ok(Some(Err(Error::Io(e)))) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        break Ok(Exit::Closed);
                    }
                    Ok(Some(Err(e))) => break Err(e),
                    Ok(Some(Ok(frame))) => frame,
                };
                match frame {
                    f if f.is_heartbeat() => {
                        debug!("{} heartbeat", opts.topic);
                        if let Err(e) = write_command(&mut writer, &Command::Nop).await {
                            break Err(e);
                        }
                    }
                    Frame::Response(data) if data == CLOSE_WAIT => {
                        debug!("{} close acknowledged", opts.topic);
                        closing = true;
                    }
                    Frame::Response(data) => {
                        debug!("{} response {}", opts.topic, String::from_utf8_lossy(&data));
                    }
                    Frame::Error(data) => {
                        // E_FIN_FAILED and friends don't end the session
                        warn!("{} nsqd error: {}", opts.topic, String::from_utf8_lossy(&data));
                    }
                    Frame::Message(msg) => {
                        handler.handle_message(&msg);
                        if let Err(e) = write_command(&mut writer, &Command::Fin(msg.id)).await {
                            break Err(e);
                        }
                    }
                }
            }
            changed = rdy.changed(), if rdy_open && !closing => {
                if changed.is_err() {
                    rdy_open = false;
                    continue;
                }
                let count = *rdy.borrow_and_update();
                debug!("{} RDY {count}", opts.topic);
                if let Err(e) = write_command(&mut writer, &Command::Rdy(count)).await {
                    break Err(e);
                }
            }
            _ = shutdown.changed(), if !closing => {
                closing = true;
                if let Err(e) = write_command(&mut writer, &Command::Cls).await {
                    debug!("{} CLS failed: {e}", opts.topic);
                    break Ok(Exit::Shutdown);
                }
            }
        }
    };

    reader_task.abort();
    result
}

/// Keeps one nsqd connection alive. Connections found through lookupd give
/// up after the first disconnect and are re-added by the next poll.
pub async fn run_connection<H: MessageHandler>(
    addr: String,
    opts: Arc<SubscribeOptions>,
    rdy: watch::Receiver<u32>,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
    reconnect: bool,
) {
    let mut attempt = 0u32;
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        let connected = tokio::select! {
            res = TcpStream::connect(&addr) => res,
            _ = shutdown.changed() => return,
        };
        let result = match connected {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay on {addr}: {e}");
                }
                info!("{} connected to {addr} (RDY {})", opts.topic, *rdy.borrow());
                attempt = 0;
                consume(stream, &opts, rdy.clone(), handler.as_ref(), shutdown.clone()).await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(Exit::Shutdown) => {
                info!("{} connection to {addr} closed", opts.topic);
                return;
            }
            Ok(Exit::Closed) => warn!("{} nsqd {addr} closed the connection", opts.topic),
            Err(e) => warn!("{} connection to {addr} failed: {e}", opts.topic),
        }
        if !reconnect {
            return;
        }

        attempt = attempt.saturating_add(1);
        let delay = backoff(attempt);
        info!("{} reconnecting to {addr} in {delay:?}", opts.topic);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

pub fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    let base = (BACKOFF_BASE * 2u32.pow(exp)).min(BACKOFF_MAX);
    let jitter = rand::rng().random_range(0..=BACKOFF_JITTER_MS);
    base + Duration::from_millis(jitter)
}

/// Spreads `max_in_flight` over `connections`, never below 1 each.
pub fn split_in_flight(max_in_flight: u32, connections: usize) -> u32 {
    let n = u32::try_from(connections.max(1)).unwrap_or(u32::MAX);
    (max_in_flight / n).max(1)
}

struct Connection {
    task: JoinHandle<()>,
    rdy: watch::Sender<u32>,
}

pub struct Consumer<H> {
    opts: Arc<SubscribeOptions>,
    handler: Arc<H>,
    max_in_flight: u32,
    shutdown: watch::Receiver<bool>,
}

impl<H: MessageHandler> Consumer<H> {
    pub fn new(
        opts: SubscribeOptions,
        max_in_flight: u32,
        handler: H,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Consumer {
            opts: Arc::new(opts),
            handler: Arc::new(handler),
            max_in_flight,
            shutdown,
        }
    }

    fn spawn_connection(
        &self,
        addr: String,
        rdy: watch::Receiver<u32>,
        reconnect: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(run_connection(
            addr,
            self.opts.clone(),
            rdy,
            self.handler.clone(),
            self.shutdown.clone(),
            reconnect,
        ))
    }

    /// Connects straight to the given nsqd TCP addresses, reconnecting on loss.
    pub async fn connect_to_nsqds(self, addrs: Vec<String>) {
        // the set never changes, so one fixed share serves every connection
        let share = split_in_flight(self.max_in_flight, addrs.len());
        let (_rdy_tx, rdy_rx) = watch::channel(share);
        let tasks: Vec<_> = addrs
            .into_iter()
            .map(|addr| self.spawn_connection(addr, rdy_rx.clone(), true))
            .collect();
        join_all(tasks).await;
    }

    /// Polls lookupd for producers of the topic and keeps a connection to each.
    /// Whenever the set of live connections changes, `max_in_flight` is
    /// re-split across all of them.
    pub async fn connect_to_lookupds(self, lookupd: Arc<LookupdClient>, poll_interval: Duration) {
        let mut conns: HashMap<String, Connection> = HashMap::new();
        let mut ticker = tokio::time::interval(poll_interval);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            conns.retain(|_, conn| !conn.task.is_finished());

            let fresh: Vec<String> = match lookupd.producers(&self.opts.topic).await {
                Ok(addrs) => {
                    if addrs.is_empty() {
                        debug!("{} has no producers yet", self.opts.topic);
                    }
                    addrs.into_iter().filter(|a| !conns.contains_key(a)).collect()
                }
                Err(e) => {
                    warn!("{} producer lookup failed: {e}", self.opts.topic);
                    Vec::new()
                }
            };

            // shrink existing shares before the new connections take theirs
            let rdy = split_in_flight(self.max_in_flight, conns.len() + fresh.len());
            for conn in conns.values() {
                conn.rdy.send_if_modified(|current| {
                    let changed = *current != rdy;
                    *current = rdy;
                    changed
                });
            }
            for addr in fresh {
                info!("{} found producer {addr}", self.opts.topic);
                let (rdy_tx, rdy_rx) = watch::channel(rdy);
                let task = self.spawn_connection(addr.clone(), rdy_rx, false);
                conns.insert(addr, Connection { task, rdy: rdy_tx });
            }
        }

        join_all(conns.into_values().map(|conn| conn.task)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FRAME_TYPE_RESPONSE, HEARTBEAT, OK, encode_frame, encode_message};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl MessageHandler for Counter {
        fn handle_message(&self, _message: &Message) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_split_in_flight() {
        assert_eq!(split_in_flight(10, 0), 10);
        assert_eq!(split_in_flight(10, 1), 10);
        assert_eq!(split_in_flight(10, 3), 3);
        assert_eq!(split_in_flight(2, 5), 1);
    }

    #[test]
    fn test_backoff_bounds() {
        let first = backoff(1);
        assert!(first >= BACKOFF_BASE);
        assert!(first <= BACKOFF_BASE + Duration::from_millis(BACKOFF_JITTER_MS));
        let late = backoff(50);
        assert!(late >= BACKOFF_MAX);
        assert!(late <= BACKOFF_MAX + Duration::from_millis(BACKOFF_JITTER_MS));
    }

    #[tokio::test]
    async fn test_consume_session() {
        let (client, server) = tokio::io::duplex(4096);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = Arc::new(Counter::default());
        let opts = SubscribeOptions::new("clicks", "rate_estimator#ephemeral");

        let (rdy_tx, rdy_rx) = watch::channel(5);

        let h = handler.clone();
        let session = tokio::spawn(async move {
            consume(client, &opts, rdy_rx, h.as_ref(), shutdown_rx).await
        });

        let mut server = BufReader::new(server);
        let mut magic = [0u8; 4];
        server.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, MAGIC_V2);

        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "IDENTIFY\n");
        let len = server.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        server.read_exact(&mut body).await.unwrap();
        server
            .write_all(&encode_frame(FRAME_TYPE_RESPONSE, OK))
            .await
            .unwrap();

        line.clear();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "SUB clicks rate_estimator#ephemeral\n");
        server
            .write_all(&encode_frame(FRAME_TYPE_RESPONSE, OK))
            .await
            .unwrap();

        line.clear();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "RDY 5\n");

        server
            .write_all(&encode_frame(FRAME_TYPE_RESPONSE, HEARTBEAT))
            .await
            .unwrap();
        line.clear();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "NOP\n");

        // a new share is pushed to nsqd mid-session
        rdy_tx.send(2).unwrap();
        line.clear();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "RDY 2\n");

        for i in 0..3u8 {
            let mut id = *b"000000000000000a";
            id[15] = b'a' + i;
            server
                .write_all(&encode_message(&id, 0, 1, b"{}"))
                .await
                .unwrap();
            line.clear();
            server.read_line(&mut line).await.unwrap();
            assert_eq!(line, format!("FIN 000000000000000{}\n", (b'a' + i) as char));
        }
        assert_eq!(handler.0.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        line.clear();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "CLS\n");
        server
            .write_all(&encode_frame(FRAME_TYPE_RESPONSE, CLOSE_WAIT))
            .await
            .unwrap();
        drop(server);

        assert_eq!(session.await.unwrap().unwrap(), Exit::Shutdown);
    }

    #[tokio::test]
    async fn test_consume_rejected_subscription() {
        let (client, server) = tokio::io::duplex(4096);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let opts = SubscribeOptions::new("clicks", "rate_estimator#ephemeral");
        let (_rdy_tx, rdy_rx) = watch::channel(1);
        let session = tokio::spawn(async move {
            consume(client, &opts, rdy_rx, &Counter::default(), shutdown_rx).await
        });

        let mut server = BufReader::new(server);
        let mut magic = [0u8; 4];
        server.read_exact(&mut magic).await.unwrap();
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        let len = server.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        server.read_exact(&mut body).await.unwrap();
        server
            .write_all(&encode_frame(crate::protocol::FRAME_TYPE_ERROR, b"E_BAD_BODY"))
            .await
            .unwrap();

        assert!(session.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_remote_hangup_is_closed() {
        let (client, server) = tokio::io::duplex(4096);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let opts = SubscribeOptions::new("clicks", "rate_estimator#ephemeral");
        let (_rdy_tx, rdy_rx) = watch::channel(1);
        let session = tokio::spawn(async move {
            consume(client, &opts, rdy_rx, &Counter::default(), shutdown_rx).await
        });

        let mut server = BufReader::new(server);
        let mut magic = [0u8; 4];
        server.read_exact(&mut magic).await.unwrap();
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        let len = server.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        server.read_exact(&mut body).await.unwrap();
        server.write_all(&encode_frame(FRAME_TYPE_RESPONSE, OK)).await.unwrap();
        line.clear();
        server.read_line(&mut line).await.unwrap();
        server.write_all(&encode_frame(FRAME_TYPE_RESPONSE, OK)).await.unwrap();
        line.clear();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "RDY 1\n");
        drop(server);

        assert_eq!(session.await.unwrap().unwrap(), Exit::Closed);
    }
}
