use log::{debug, info, warn};
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::common::log_sink::LogChannel;
use crate::proxy::session::{ClientSession, SessionOptions, SessionReport, UpstreamTarget};

/// Immutable settings of one `start` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub listen_port: u16,
    pub upstream: UpstreamTarget,
}

struct ActiveListener {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    supervisor: JoinHandle<()>,
}

/// Owns the listening socket and, through its supervisor task, every live session.
pub struct GatewayListener {
    active: Option<ActiveListener>,
    options: Arc<SessionOptions>,
    sessions: Arc<AtomicUsize>,
    log: LogChannel,
}

impl GatewayListener {
    pub fn new(options: SessionOptions, sessions: Arc<AtomicUsize>, log: LogChannel) -> Self {
        GatewayListener {
            active: None,
            options: Arc::new(options),
            sessions,
            log,
        }
    }

    /// Binds `127.0.0.1:<listen_port>` and starts accepting. A listener that is
    /// already running is stopped first, together with its sessions.
    pub async fn listen(&mut self, config: &GatewayConfig) -> io::Result<SocketAddr> {
        self.stop().await;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.listen_port)).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Listening on {}, upstream SOCKS5 {}",
            local_addr, config.upstream
        );

        let (shutdown, shutdown_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            listener,
            Arc::new(config.upstream.clone()),
            self.options.clone(),
            self.sessions.clone(),
            self.log.clone(),
            shutdown_rx,
        ));

        self.active = Some(ActiveListener {
            local_addr,
            shutdown,
            supervisor,
        });
        Ok(local_addr)
    }

    /// Closes the listening socket and every tracked session. Returns once all of
    /// their sockets are closed.
    pub async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.shutdown.send(());
            if let Err(e) = active.supervisor.await {
                warn!("Listener task for {} ended abnormally: {}", active.local_addr, e);
            }
            info!("Stopped listening on {}", active.local_addr);
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|active| active.local_addr)
    }
}

async fn supervise(
    listener: TcpListener,
    upstream: Arc<UpstreamTarget>,
    options: Arc<SessionOptions>,
    live: Arc<AtomicUsize>,
    log: LogChannel,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut sessions: JoinSet<SessionReport> = JoinSet::new();
    let mut peers: HashSet<SocketAddr> = HashSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let session = ClientSession::new(
                            stream,
                            peer,
                            upstream.clone(),
                            options.clone(),
                            log.clone(),
                        );
                        sessions.spawn(session.run());
                        peers.insert(peer);
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            Some(finished) = sessions.join_next() => {
                match finished {
                    Ok(report) => {
                        peers.remove(&report.peer);
                        log_report(&log, report);
                    }
                    Err(e) if e.is_panic() => warn!("Session task panicked: {}", e),
                    Err(_) => {}
                }
            }
            _ = &mut shutdown => break,
        }
        live.store(sessions.len(), Ordering::SeqCst);
    }

    // Aborting drops each session, which closes both of its sockets.
    sessions.shutdown().await;
    for peer in peers {
        log.line(format!("{} closed by stop", peer));
    }
    live.store(0, Ordering::SeqCst);
    drop(listener);
}

fn log_report(log: &LogChannel, report: SessionReport) {
    let destination = report.destination.as_deref().unwrap_or("-");
    match report.outcome {
        Ok(stats) => log.line(format!(
            "{} closed {} ({} bytes sent, {} bytes received)",
            report.peer, destination, stats.client_to_upstream, stats.upstream_to_client
        )),
        Err(e) => log.line(format!(
            "{} {} failed in {:?}: {}",
            report.peer, destination, report.final_state, e
        )),
    }
}
