use log::{error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tokio::runtime::Builder;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::common::log_sink::{LogChannel, LogSink};
use crate::proxy::listener::{GatewayConfig, GatewayListener};
use crate::proxy::session::{SessionOptions, UpstreamTarget};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to start gateway worker: {0}")]
    WorkerSpawn(#[source] io::Error),
    #[error("Gateway worker is no longer running")]
    WorkerGone,
    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Started { port: u16 },
    Stopped,
    Error(String),
}

enum Command {
    Listen {
        config: GatewayConfig,
        reply: oneshot::Sender<io::Result<SocketAddr>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Dedicated thread running the listener and every session on its own runtime.
struct Worker {
    commands: Option<mpsc::UnboundedSender<Command>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(options: SessionOptions, live: Arc<AtomicUsize>, log: LogChannel) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (commands, mut rx) = mpsc::unbounded_channel::<Command>();

        let thread = thread::Builder::new()
            .name("gateway-worker".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut listener = GatewayListener::new(options, live, log);
                    while let Some(command) = rx.recv().await {
                        match command {
                            Command::Listen { config, reply } => {
                                let _ = reply.send(listener.listen(&config).await);
                            }
                            Command::Stop { reply } => {
                                listener.stop().await;
                                let _ = reply.send(());
                            }
                        }
                    }
                    listener.stop().await;
                });
            })?;

        Ok(Worker {
            commands: Some(commands),
            thread: Some(thread),
        })
    }

    /// Hands `build(reply)` to the worker and blocks until it answers.
    fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, GatewayError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .as_ref()
            .ok_or(GatewayError::WorkerGone)?
            .send(build(reply))
            .map_err(|_| GatewayError::WorkerGone)?;
        response.blocking_recv().map_err(|_| GatewayError::WorkerGone)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the command channel lets the worker stop its listener and exit.
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Gateway worker thread panicked");
            }
        }
    }
}

/// HTTP/HTTPS-to-SOCKS5 gateway.
///
/// `start`/`stop` block only until the worker thread acknowledges the command.
/// They must not be called from inside an async runtime.
pub struct GatewayService {
    worker: Option<Worker>,
    log: Option<LogChannel>,
    log_thread: Option<thread::JoinHandle<()>>,
    sink: Arc<dyn LogSink>,
    options: SessionOptions,
    events: broadcast::Sender<GatewayEvent>,
    live_sessions: Arc<AtomicUsize>,
    config: Option<GatewayConfig>,
    running: bool,
    listen_port: u16,
}

impl GatewayService {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self::with_options(sink, SessionOptions::default())
    }

    pub fn with_options(sink: Arc<dyn LogSink>, options: SessionOptions) -> Self {
        let (events, _) = broadcast::channel(16);
        GatewayService {
            worker: None,
            log: None,
            log_thread: None,
            sink,
            options,
            events,
            live_sessions: Arc::new(AtomicUsize::new(0)),
            config: None,
            running: false,
            listen_port: 0,
        }
    }

    /// Starts serving on `127.0.0.1:<listen_port>` (0 picks a free port), relaying
    /// through the SOCKS5 server at `upstream_host:upstream_port`. A running
    /// gateway is stopped first. Returns false when the port cannot be bound.
    pub fn start(&mut self, listen_port: u16, upstream_host: &str, upstream_port: u16) -> bool {
        if self.running {
            self.stop();
        }

        let config = GatewayConfig {
            listen_port,
            upstream: UpstreamTarget {
                host: upstream_host.to_string(),
                port: upstream_port,
            },
        };
        self.listen_port = listen_port;

        match self.listen(config.clone()) {
            Ok(addr) => {
                self.running = true;
                self.listen_port = addr.port();
                self.emit_line(format!(
                    "Started HTTP proxy on {}, forwarding to SOCKS5 {}",
                    addr, config.upstream
                ));
                self.config = Some(config);
                self.notify(GatewayEvent::Started { port: addr.port() });
                true
            }
            Err(e) => {
                warn!("{}", e);
                self.emit_line(format!("Failed to start on port {}: {}", listen_port, e));
                self.notify(GatewayEvent::Error(format!("HTTP proxy failed to start: {}", e)));
                false
            }
        }
    }

    /// Stops the listener and closes every session. No-op when not running.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Some(worker) = &self.worker {
            if let Err(e) = worker.call(|reply| Command::Stop { reply }) {
                warn!("Stopping gateway: {}", e);
            }
        }
        self.running = false;
        self.emit_line("Stopped".to_string());
        self.notify(GatewayEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Port of the most recent `start`; the bound port once it succeeded.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn config(&self) -> Option<&GatewayConfig> {
        self.config.as_ref()
    }

    /// Sessions currently tracked by the listener.
    pub fn active_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    fn listen(&mut self, config: GatewayConfig) -> Result<SocketAddr, GatewayError> {
        let port = config.listen_port;
        let worker = self.worker()?;
        worker
            .call(|reply| Command::Listen { config, reply })?
            .map_err(|source| GatewayError::Bind { port, source })
    }

    /// Starts the log consumer and worker threads on first use.
    fn worker(&mut self) -> Result<&Worker, GatewayError> {
        let log = self.log_channel()?;
        if self.worker.is_none() {
            let worker = Worker::spawn(self.options.clone(), self.live_sessions.clone(), log)
                .map_err(GatewayError::WorkerSpawn)?;
            info!("Gateway worker started");
            self.worker = Some(worker);
        }
        self.worker.as_ref().ok_or(GatewayError::WorkerGone)
    }

    fn log_channel(&mut self) -> Result<LogChannel, GatewayError> {
        if let Some(log) = &self.log {
            return Ok(log.clone());
        }
        let (log, consumer) =
            LogChannel::spawn(self.sink.clone()).map_err(GatewayError::WorkerSpawn)?;
        self.log_thread = Some(consumer);
        self.log = Some(log.clone());
        Ok(log)
    }

    /// Queues a status line for the log consumer thread.
    fn emit_line(&mut self, line: String) {
        match self.log_channel() {
            Ok(log) => log.line(line),
            Err(e) => error!("Dropping status line {:?}: {}", line, e),
        }
    }

    fn notify(&self, event: GatewayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for GatewayService {
    fn drop(&mut self) {
        self.stop();
        // Worker first: it holds LogChannel clones the log thread waits on.
        self.worker.take();
        self.log.take();
        if let Some(consumer) = self.log_thread.take() {
            if consumer.join().is_err() {
                error!("Gateway log thread panicked");
            }
        }
    }
}
