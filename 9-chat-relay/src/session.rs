//! Per-connection session: identity, lifecycle, and the reader and writer
//! tasks that move lines between one client stream and the broadcaster.
//!
//! A session starts by queueing its greeting, hands its
//! [`Outbound`](crate::outbound::Outbound) to the broadcaster with a join,
//! spawns its writer, and then reads lines until the stream ends. Teardown
//! always goes through the broadcaster: the reader sends a leave, the
//! broadcaster closes the outbound queue, and the writer drains it and
//! exits. If the writer exits first (write failure, or the broadcaster
//! dropped the session) the reader stops as well.

use std::{fmt, io, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::oneshot,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    broadcaster::BroadcasterHandle,
    config::RelayConfig,
    message::{BroadcastMessage, LineReader, write_line},
    outbound::{Inbox, outbound_channel},
};

/// Identity of a connected client.
///
/// Displays as the remote address. The connection sequence number keeps two
/// connections that reuse an address distinct while both are in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    seq: u64,
    addr: Arc<str>,
}

impl SessionId {
    pub fn new(seq: u64, addr: impl Into<Arc<str>>) -> Self {
        Self {
            seq,
            addr: addr.into(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.addr())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, join not yet handed to the broadcaster.
    Joining,
    Active,
    /// Stream ended; leave sent or about to be.
    Leaving,
    /// Outbound queue closed and drained.
    Closed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Joining, Active) | (Joining, Leaving) | (Active, Leaving) | (Leaving, Closed)
        )
    }
}

/// Lifecycle bookkeeping for one connection, owned by its reader.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Joining,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        debug!(session = %self.id, from = ?self.state, to = ?next, "session state changed");
        self.state = next;
        true
    }
}

/// Why a reader stopped reading.
#[derive(Debug)]
enum ReaderExit {
    Eof,
    IdleTimeout,
    Failed(io::Error),
    WriterGone,
    BroadcasterGone,
}

/// Runs one client session to completion over an already split stream.
///
/// Returns once the session has left and its writer has flushed everything
/// queued for it.
pub async fn run_session<R, W>(
    id: SessionId,
    reader: R,
    writer: W,
    broadcaster: BroadcasterHandle,
    config: RelayConfig,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut session = Session::new(id.clone());
    let (outbound, inbox) = outbound_channel(config.outbound_capacity);
    outbound
        .deliver(BroadcastMessage::greeting(&id))
        .context("failed to queue greeting")?;

    broadcaster.join(id.clone(), outbound).await?;
    session.advance(SessionState::Active);

    // Started only once the join is queued: a client that has read its
    // greeting knows everyone connecting after it will be announced to it.
    let (writer_done_tx, mut writer_done) = oneshot::channel();
    let writer_task = tokio::spawn(run_writer(id.clone(), writer, inbox, writer_done_tx));
    info!(session = %id, "client connected");

    let mut lines = LineReader::new(BufReader::new(reader));
    let exit = run_reader(
        &id,
        &mut lines,
        &broadcaster,
        config.idle_timeout,
        &mut writer_done,
    )
    .await;
    session.advance(SessionState::Leaving);
    match &exit {
        ReaderExit::Failed(err) => warn!(session = %id, error = ?err, "client stream failed"),
        ReaderExit::IdleTimeout => info!(session = %id, "client idle for too long"),
        other => debug!(session = %id, reason = ?other, "reader finished"),
    }

    if let Err(err) = broadcaster.leave(id.clone()).await {
        debug!(session = %id, error = ?err, "leave not delivered");
    }
    drop(lines);

    writer_task.await.context("writer task panicked")?;
    session.advance(SessionState::Closed);
    info!(session = %id, "client disconnected");

    Ok(())
}

async fn run_reader<R>(
    id: &SessionId,
    lines: &mut LineReader<R>,
    broadcaster: &BroadcasterHandle,
    idle_timeout: Option<Duration>,
    writer_done: &mut oneshot::Receiver<()>,
) -> ReaderExit
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = select! {
            biased;
            _ = &mut *writer_done => return ReaderExit::WriterGone,
            line = next_line(lines, idle_timeout) => line,
        };

        match line {
            Ok(Some(line)) => {
                let message = BroadcastMessage::chat(id, &line);
                if broadcaster.broadcast(id.clone(), message).await.is_err() {
                    return ReaderExit::BroadcasterGone;
                }
            }
            Ok(None) => return ReaderExit::Eof,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return ReaderExit::IdleTimeout,
            Err(err) => return ReaderExit::Failed(err),
        }
    }
}

async fn next_line<R>(
    lines: &mut LineReader<R>,
    idle_timeout: Option<Duration>,
) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match idle_timeout {
        Some(limit) => timeout(limit, lines.next_line())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout elapsed"))?,
        None => lines.next_line().await,
    }
}

/// Drains `inbox` to `writer` until the broadcaster closes the queue.
///
/// Signals `done` on exit, whether the queue closed or a write failed.
async fn run_writer<W>(
    id: SessionId,
    mut writer: W,
    mut inbox: Inbox,
    done: oneshot::Sender<()>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = inbox.next().await {
        if let Err(err) = write_line(&mut writer, message.text()).await {
            warn!(session = %id, error = ?err, "failed to deliver message to client");
            break;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(session = %id, error = ?err, "failed to shut down client writer");
    }
    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{self, Poll},
    };

    use tokio::io::{DuplexStream, ReadHalf};

    use super::*;
    use crate::broadcaster;

    const STEP: Duration = Duration::from_secs(2);

    #[test]
    fn lifecycle_only_moves_forward() {
        let mut session = Session::new(SessionId::new(1, "127.0.0.1:9000"));
        assert_eq!(session.state(), SessionState::Joining);
        assert!(!session.advance(SessionState::Closed));
        assert!(session.advance(SessionState::Active));
        assert!(!session.advance(SessionState::Joining));
        assert!(session.advance(SessionState::Leaving));
        assert!(!session.advance(SessionState::Active));
        assert!(session.advance(SessionState::Closed));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn session_id_displays_address_only() {
        let id = SessionId::new(7, "10.0.0.1:5555");
        assert_eq!(id.to_string(), "10.0.0.1:5555");
        assert_ne!(id, SessionId::new(8, "10.0.0.1:5555"));
    }

    async fn next(lines: &mut LineReader<BufReader<ReadHalf<DuplexStream>>>) -> Option<String> {
        timeout(STEP, lines.next_line())
            .await
            .expect("line within timeout")
            .expect("read line")
    }

    #[tokio::test]
    async fn session_greets_echoes_and_closes_after_eof() {
        let config = RelayConfig::default();
        let (coordinator, handle) = broadcaster::channel(&config);
        let coordinator = tokio::spawn(coordinator.run());

        let (client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let session = tokio::spawn(run_session(
            SessionId::new(1, "127.0.0.1:4000"),
            server_read,
            server_write,
            handle.clone(),
            config,
        ));

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = LineReader::new(BufReader::new(client_read));

        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("Connected new client: 127.0.0.1:4000")
        );

        client_write.write_all(b"hello\n").await.expect("send line");
        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("127.0.0.1:4000: hello")
        );

        client_write
            .write_all(b"caf\xe9 au lait\n")
            .await
            .expect("send latin-1 line");
        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("127.0.0.1:4000: caf\u{FFFD} au lait")
        );

        client_write.shutdown().await.expect("half close");
        assert_eq!(next(&mut lines).await, None);

        timeout(STEP, session)
            .await
            .expect("session ends")
            .expect("session task")
            .expect("session result");
        handle.shutdown().await.expect("shutdown");
        coordinator.await.expect("broadcaster task");
    }

    #[tokio::test]
    async fn idle_session_is_disconnected() {
        let config = RelayConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..RelayConfig::default()
        };
        let (coordinator, handle) = broadcaster::channel(&config);
        let coordinator = tokio::spawn(coordinator.run());

        let (client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let session = tokio::spawn(run_session(
            SessionId::new(1, "127.0.0.1:4001"),
            server_read,
            server_write,
            handle.clone(),
            config,
        ));

        let (client_read, _client_write) = tokio::io::split(client);
        let mut lines = LineReader::new(BufReader::new(client_read));
        assert!(next(&mut lines).await.is_some(), "greeting");

        // Send nothing; the relay should close our side once the timeout passes.
        assert_eq!(next(&mut lines).await, None);

        timeout(STEP, session)
            .await
            .expect("session ends")
            .expect("session task")
            .expect("session result");
        handle.shutdown().await.expect("shutdown");
        coordinator.await.expect("broadcaster task");
    }

    /// Fails every write as if the peer had reset the connection.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut task::Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut task::Context<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_failure_leaves_through_the_broadcaster() {
        let config = RelayConfig::default();
        let (coordinator, handle) = broadcaster::channel(&config);
        let coordinator = tokio::spawn(coordinator.run());

        let (observer_out, mut observer) = outbound_channel(8);
        handle
            .join(SessionId::new(1, "observer"), observer_out)
            .await
            .expect("join observer");

        // The client end stays open, so only the writer can end the session.
        let (_client, server) = tokio::io::duplex(1024);
        timeout(
            STEP,
            run_session(
                SessionId::new(2, "broken"),
                server,
                BrokenPipe,
                handle.clone(),
                config,
            ),
        )
        .await
        .expect("session ends")
        .expect("session result");

        handle.shutdown().await.expect("shutdown");
        coordinator.await.expect("broadcaster task");

        let seen: Vec<String> = std::iter::from_fn(|| observer.try_next())
            .map(|message| message.text().to_string())
            .collect();
        assert_eq!(seen, ["broken has joined conversation", "broken has left"]);
    }
}
