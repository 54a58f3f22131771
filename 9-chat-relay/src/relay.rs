use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    broadcaster::{self, BroadcasterHandle},
    config::RelayConfig,
    session::{self, SessionId},
};

/// How long shutdown waits for sessions to flush their queues.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts TCP clients and hands each one to the relay core.
pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self { listener, config }
    }

    pub async fn bind<A>(addr: A, config: RelayConfig) -> Result<Self>
    where
        A: ToSocketAddrs + std::fmt::Debug,
    {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to listen on {addr:?}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then stops the
    /// broadcaster and waits for every session to drain its queue to the
    /// client and close the connection.
    ///
    /// Sessions still running after a short grace period are aborted.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, config } = self;
        let (coordinator, handle) = broadcaster::channel(&config);
        let coordinator = tokio::spawn(coordinator.run());
        let mut sessions = JoinSet::new();
        let mut next_seq = 0;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    next_seq += 1;
                    handle_accept_result(accept_result, next_seq, &mut sessions, &handle, config);
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_exit(finished);
                }
            }
        }

        info!(sessions = sessions.len(), "relay shutting down");
        drop(listener);
        if let Err(err) = handle.shutdown().await {
            warn!(error = ?err, "broadcaster already stopped");
        }
        coordinator.await.context("broadcaster task panicked")?;

        let drained = timeout(SESSION_DRAIN_TIMEOUT, async {
            while let Some(finished) = sessions.join_next().await {
                log_session_exit(finished);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                sessions = sessions.len(),
                "sessions still flushing after shutdown, aborting them"
            );
            sessions.shutdown().await;
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    seq: u64,
    sessions: &mut JoinSet<()>,
    handle: &BroadcasterHandle,
    config: RelayConfig,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, seq, sessions, handle, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    seq: u64,
    sessions: &mut JoinSet<()>,
    handle: &BroadcasterHandle,
    config: RelayConfig,
) {
    let broadcaster = handle.clone();
    sessions.spawn(async move {
        let id = SessionId::new(seq, peer.to_string());
        let (reader, writer) = stream.into_split();
        if let Err(err) = session::run_session(id, reader, writer, broadcaster, config).await {
            warn!(peer = %peer, error = ?err, "client session ended with error");
        }
    });
}

fn log_session_exit(result: Result<(), JoinError>) {
    match result {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => debug!("session task cancelled"),
        Err(err) => warn!(error = ?err, "session task panicked"),
    }
}
