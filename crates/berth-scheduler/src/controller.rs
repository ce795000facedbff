use crate::provision::Provisioner;
use crate::{Result, SchedulerError};
use berth_core::{is_awaiting_provisioning, CoreError, Namespace, Pod, Resource};
use berth_state::{ChangeSubscriber, ClusterState, Ipam, Observed, SubscriberConfig};
use berth_storage::Registry;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the pod controller
#[derive(Debug, Clone)]
pub struct PodControllerConfig {
    /// Bound of the placement queue
    pub queue_capacity: usize,
    /// Start provisioning right away instead of waiting in standby
    pub start_active: bool,
    /// Retry behaviour of the pod watch
    pub watch: SubscriberConfig,
}

impl Default for PodControllerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            start_active: true,
            watch: SubscriberConfig::default(),
        }
    }
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Stopped,
    Standby,
    Active,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Stopped => write!(f, "stopped"),
            ControllerState::Standby => write!(f, "standby"),
            ControllerState::Active => write!(f, "active"),
        }
    }
}

/// Places pods awaiting provisioning onto nodes.
///
/// Pods arrive from the pod watch and from `resume()`, and are placed one at
/// a time. While paused the controller keeps watching but drops what it
/// dequeues; `resume()` walks every namespace to pick those pods up again.
pub struct PodController {
    state: ClusterState,
    registry: Registry,
    provisioner: Arc<dyn Provisioner>,
    config: PodControllerConfig,
    active: AtomicBool,
    running: AtomicBool,
    queue_tx: mpsc::Sender<Pod>,
    queue_rx: Mutex<Option<mpsc::Receiver<Pod>>>,
}

impl PodController {
    pub fn new(
        state: ClusterState,
        registry: Registry,
        provisioner: Arc<dyn Provisioner>,
        config: PodControllerConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let active = AtomicBool::new(config.start_active);
        Self {
            state,
            registry,
            provisioner,
            config,
            active,
            running: AtomicBool::new(false),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    pub fn state(&self) -> ControllerState {
        if !self.running.load(Ordering::SeqCst) {
            ControllerState::Stopped
        } else if self.active.load(Ordering::SeqCst) {
            ControllerState::Active
        } else {
            ControllerState::Standby
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Watch pods and place them until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let Some(mut queue) = self.queue_rx.lock().await.take() else {
            return Err(SchedulerError::internal_error("pod controller is already running"));
        };

        self.running.store(true, Ordering::SeqCst);
        info!("Starting pod controller ({})", self.state());

        let (events_tx, mut events) = mpsc::channel(self.config.queue_capacity.max(1));
        let (watcher, _status) = ChangeSubscriber::<Pod>::new(
            self.registry.clone(),
            events_tx,
            self.config.watch.clone(),
        );

        let forward = async {
            while let Some(observed) = events.recv().await {
                let pods = match observed {
                    Observed::Upsert(pod) => vec![pod],
                    Observed::Resync { items, .. } => items,
                    Observed::Remove { .. } => continue,
                };

                for pod in pods.into_iter().filter(is_awaiting_provisioning) {
                    debug!("Queueing pod {} for placement", pod.display_name());
                    if self.queue_tx.send(pod).await.is_err() {
                        return;
                    }
                }
            }
        };

        let place = async {
            loop {
                let pod = tokio::select! {
                    _ = token.cancelled() => break,
                    pod = queue.recv() => match pod {
                        Some(pod) => pod,
                        None => break,
                    },
                };

                if !self.is_active() {
                    debug!("Controller in standby, dropping pod {}", pod.display_name());
                    continue;
                }

                let name = pod.display_name().to_string();
                match self.provision(pod).await {
                    Ok(Some(node)) => info!("Pod {} placed on node {}", name, node),
                    Ok(None) => {}
                    Err(e) => error!("Failed to place pod {}: {}", name, e),
                }
            }
        };

        tokio::select! {
            _ = watcher.run(token.clone()) => {}
            _ = forward => {}
            _ = place => {}
        }

        self.running.store(false, Ordering::SeqCst);
        *self.queue_rx.lock().await = Some(queue);
        info!("Pod controller stopped");
        Ok(())
    }

    /// Stop placing pods. A placement already in progress finishes.
    pub fn pause(&self) {
        self.active.store(false, Ordering::SeqCst);
        info!("Pod controller paused");
    }

    /// Start placing pods again and queue every pod that is still waiting.
    /// Returns the number of pods queued.
    pub async fn resume(&self) -> usize {
        self.active.store(true, Ordering::SeqCst);
        info!("Pod controller resumed");

        let namespaces = match self.registry.list::<Namespace>() {
            Ok((namespaces, _)) => namespaces,
            Err(e) => {
                error!("Failed to list namespaces: {}", e);
                return 0;
            }
        };

        let mut queued = 0;
        for namespace in namespaces {
            let ns = namespace.display_name();
            let pods = match self.registry.list_namespaced::<Pod>(ns) {
                Ok((pods, _)) => pods,
                Err(e) => {
                    warn!("Failed to list pods in namespace {}: {}", ns, e);
                    continue;
                }
            };

            for pod in pods.into_iter().filter(is_awaiting_provisioning) {
                if self.queue_tx.send(pod).await.is_err() {
                    return queued;
                }
                queued += 1;
            }
        }

        debug!("Resume queued {} pods", queued);
        queued
    }

    /// Place one pod. Returns the node it landed on, or `None` when the pod
    /// no longer needs placing.
    pub async fn provision(&self, pod: Pod) -> Result<Option<String>> {
        let key = pod.resource_key().map_err(CoreError::from)?;

        // Act on what is stored, not on what was queued
        let Some(current) = self.registry.get::<Pod>(&key)? else {
            debug!("Pod {} is gone, skipping", key);
            return Ok(None);
        };
        if !is_awaiting_provisioning(&current) {
            debug!("Pod {} no longer awaits provisioning", key);
            return Ok(None);
        }

        let node = self.state.pod_lease(&current).await?;
        let node_name = node.name().to_string();
        let owner = format!("{}/{}", key.namespace, key.name);

        // Awaiting pods always have a spec
        let mut bound = current;
        if let Some(spec) = bound.spec.as_mut() {
            spec.node_name = Some(node_name.clone());
        }

        let placed = async {
            let address = self.state.ipam().allocate(&owner)?;
            self.provisioner.provision(&bound, &node).await?;

            let status = bound.status.get_or_insert_with(Default::default);
            status.phase = Some("Pending".to_string());
            status.pod_ip = Some(address.ip_address.to_string());
            self.registry.put(bound.clone())?;
            Ok::<_, SchedulerError>(())
        }
        .await;

        if let Err(e) = placed {
            warn!(
                "Placing pod {} on node {} failed, releasing its lease: {}",
                key, node_name, e
            );
            self.compensate(&bound, &owner).await;
            return Err(e);
        }

        Ok(Some(node_name))
    }

    async fn compensate(&self, bound: &Pod, owner: &str) {
        if let Err(e) = self.state.ipam().release(owner) {
            error!("Failed to release address of {}: {}", owner, e);
        }
        if let Err(e) = self.state.pod_release(bound).await {
            error!("Failed to release lease of {}: {}", owner, e);
        }
    }
}
