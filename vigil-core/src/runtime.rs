use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::clock::now_millis;
use crate::config::ClusterConfig;
use crate::connection::ConnectionManager;
use crate::error::ClusterError;
use crate::gossip::{GossipEngine, GossipMessage};
use crate::identity::Identity;
use crate::transport::{Transport, UdpTransport};

/// Background runtime driving heartbeats, gossip rounds, connection sweeps and inbound
/// message handling for one [`ConnectionManager`].
pub struct ClusterRuntime {
    manager: Arc<ConnectionManager>,
    engine: GossipEngine,
    transport: Arc<dyn Transport>,
}

impl ClusterRuntime {
    /// Binds a UDP transport from `config`, builds the manager and launches the runtime.
    ///
    /// The local epoch is the start-up wall-clock time, so a restarted node supersedes its
    /// previous incarnation.
    pub async fn start(config: ClusterConfig) -> Result<ClusterHandle, ClusterError> {
        config.validate()?;
        let seeds = config.resolve_seeds()?;
        let transport =
            UdpTransport::bind(config.bind_addr()?, config.gossip.max_message_size).await?;
        let local_addr = match config.advertise_addr {
            Some(addr) => addr,
            None => transport.local_addr()?,
        };
        let epoch = u64::try_from(now_millis()).unwrap_or_default();
        let local = Identity::new(config.magic, config.node_id, epoch);
        info!(node = %local, %local_addr, seeds = seeds.len(), "starting cluster membership");

        let manager = Arc::new(ConnectionManager::new(local, local_addr, seeds, config)?);
        Ok(Self::spawn(manager, Arc::new(transport)))
    }

    /// Launches the background tasks for an already constructed manager.
    pub fn spawn(manager: Arc<ConnectionManager>, transport: Arc<dyn Transport>) -> ClusterHandle {
        let runtime = Arc::new(Self {
            engine: GossipEngine::new(Arc::clone(&manager)),
            manager: Arc::clone(&manager),
            transport: Arc::clone(&transport),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Self::heartbeat_loop(Arc::clone(&runtime), shutdown_rx.clone())),
            tokio::spawn(Self::gossip_loop(Arc::clone(&runtime), shutdown_rx.clone())),
            tokio::spawn(Self::sweep_loop(Arc::clone(&runtime), shutdown_rx.clone())),
            tokio::spawn(Self::recv_loop(runtime, shutdown_rx)),
        ];

        ClusterHandle {
            shutdown_tx,
            tasks,
            manager,
            transport,
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.manager.config().heartbeat.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let record = self.manager.heartbeat(now_millis());
                    trace!(time = record.heartbeat_time, version = record.view_version, "local heartbeat");
                }
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.manager.config().gossip.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if self.manager.is_terminated() {
                        break;
                    }
                    let report = self.engine.run_round(self.transport.as_ref(), now_millis()).await;
                    if report.failed > 0 {
                        debug!(sent = report.sent, failed = report.failed, "gossip round incomplete");
                    }
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.manager.config().heartbeat.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let report = self.manager.sweep(now_millis());
                    for (identity, addr) in report.removed {
                        debug!(peer = %identity, %addr, "released quiesced connection");
                        self.transport.release(addr);
                    }
                }
            }
        }
    }

    async fn recv_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.transport.recv() => {
                    match received {
                        Ok((message, from)) => {
                            if let Err(err) = self.handle_message(&message, from).await {
                                if matches!(err, ClusterError::Shutdown) {
                                    break;
                                }
                                warn!(%from, "failed to handle gossip message: {err}");
                            }
                        }
                        Err(err) => warn!("gossip recv error: {err}"),
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        message: &GossipMessage,
        from: SocketAddr,
    ) -> Result<(), ClusterError> {
        if let Some((reply, to)) = self.engine.handle_message(message, from, now_millis())? {
            self.transport.send(&reply, to).await?;
        }
        Ok(())
    }
}

/// Handle used to control the background membership tasks.
pub struct ClusterHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    manager: Arc<ConnectionManager>,
    transport: Arc<dyn Transport>,
}

impl ClusterHandle {
    /// Manager driven by this runtime.
    #[must_use]
    pub const fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ClusterError> {
        self.transport.local_addr()
    }

    /// Signals every task to exit.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for all tasks to terminate.
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Stops the tasks, terminates the manager and releases every peer's transport resources.
    pub async fn shutdown(self) {
        self.request_shutdown();
        let manager = Arc::clone(&self.manager);
        let transport = Arc::clone(&self.transport);
        self.wait().await;
        for addr in manager.terminate() {
            transport.release(addr);
        }
        info!(node = %manager.local(), "cluster membership stopped");
    }
}
