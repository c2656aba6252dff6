use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use warden_core::{
    DestroyReason, InstanceId, InstanceState, InstanceStatus, PoolError, PoolEvent, PoolStats,
    TenantId, TenantSpec,
};

use crate::credential;
use crate::events::EventNotifier;
use crate::port_alloc::PortAllocator;
use crate::probe::HealthProber;
use crate::settings::PoolConfig;
use crate::supervisor::{self, WorkerHandle};

const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn encode_state(s: InstanceState) -> u8 {
    match s {
        InstanceState::Starting => 0,
        InstanceState::Running => 1,
        InstanceState::Stopping => 2,
        InstanceState::Stopped => 3,
        InstanceState::Failed => 4,
    }
}

fn decode_state(v: u8) -> InstanceState {
    match v {
        0 => InstanceState::Starting,
        1 => InstanceState::Running,
        2 => InstanceState::Stopping,
        3 => InstanceState::Stopped,
        _ => InstanceState::Failed,
    }
}

/// One tenant's worker: the in-memory record plus the handle to its OS
/// process. Owned by the pool's map for its lifetime; tasks hold `Arc`
/// references and mutate only the atomic state/activity fields.
pub struct Instance {
    id: InstanceId,
    tenant: TenantId,
    port: u16,
    credential: String,
    handle: WorkerHandle,
    created_at: chrono::DateTime<chrono::Utc>,
    epoch: Instant,
    state: AtomicU8,
    // Milliseconds since `epoch` at the last successful proxied request.
    last_activity_ms: AtomicU64,
}

impl std::fmt::Debug for Instance {
    // The credential stays out of debug output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("port", &self.port)
            .field("state", &self.state())
            .field("pid", &self.handle.pid())
            .finish()
    }
}

impl Instance {
    fn new(tenant: TenantId, port: u16, credential: String, handle: WorkerHandle) -> Self {
        Self {
            id: InstanceId::new(),
            tenant,
            port,
            credential,
            handle,
            created_at: chrono::Utc::now(),
            epoch: Instant::now(),
            state: AtomicU8::new(encode_state(InstanceState::Starting)),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn state(&self) -> InstanceState {
        decode_state(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, s: InstanceState) {
        self.state.store(encode_state(s), Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        self.epoch.elapsed()
    }

    pub fn idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn credential(&self) -> &str {
        &self.credential
    }

    pub(crate) fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Sanitized snapshot; the credential never leaves this struct.
    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id.clone(),
            tenant: self.tenant.clone(),
            port: self.port,
            state: self.state(),
            pid: self.handle.pid(),
            created_at: self.created_at,
            idle_ms: self.idle().as_millis() as u64,
        }
    }
}

/// The authoritative tenant → instance map and the lifecycle orchestration
/// around it.
///
/// The map mutex is held only for map mutations, never across spawn or
/// probe. Same-tenant creations serialize on a per-tenant guard; a second
/// caller awaits the first's in-flight creation instead of starting its
/// own, so no tenant ever has two spawned processes.
pub struct InstancePool {
    cfg: PoolConfig,
    ports: PortAllocator,
    prober: HealthProber,
    notifier: EventNotifier,
    instances: Mutex<HashMap<TenantId, Arc<Instance>>>,
    creation_locks: Mutex<HashMap<TenantId, Arc<Mutex<()>>>>,
}

impl InstancePool {
    pub fn new(cfg: PoolConfig) -> Arc<Self> {
        let ports = PortAllocator::new(cfg.port_start, cfg.port_end);
        let prober = HealthProber::new(cfg.probe_timeout);
        Arc::new(Self {
            cfg,
            ports,
            prober,
            notifier: EventNotifier::new(),
            instances: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    async fn tenant_guard(&self, tenant: &TenantId) -> Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        locks
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub(crate) async fn current(&self, tenant: &TenantId) -> Option<Arc<Instance>> {
        self.instances.lock().await.get(tenant).cloned()
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<Instance>> {
        self.instances.lock().await.values().cloned().collect()
    }

    /// Removes `inst` from the map if it is still the tenant's current
    /// instance. The ptr identity check makes destroy races harmless: the
    /// loser finds a different (or no) instance and backs off.
    async fn remove_if_current(&self, inst: &Arc<Instance>) -> bool {
        let mut map = self.instances.lock().await;
        if map
            .get(&inst.tenant)
            .is_some_and(|cur| Arc::ptr_eq(cur, inst))
        {
            map.remove(&inst.tenant);
            true
        } else {
            false
        }
    }

    /// Returns the tenant's healthy instance, creating one if needed.
    ///
    /// An existing instance that fails its health check is destroyed
    /// synchronously before the replacement is spawned; callers never see
    /// a half-dead instance. Creation failures release the partially
    /// acquired port and leave the tenant slot empty.
    pub async fn get_or_create(
        self: &Arc<Self>,
        tenant: &TenantId,
        spec: &TenantSpec,
    ) -> Result<Arc<Instance>, PoolError> {
        let guard = self.tenant_guard(tenant).await;
        let _g = guard.lock().await;

        if let Some(existing) = self.current(tenant).await {
            let live = existing.state() == InstanceState::Running
                && existing.handle.exit_status().is_none();
            if live
                && self
                    .prober
                    .check(existing.port, existing.credential())
                    .await
            {
                existing.touch();
                return Ok(existing);
            }

            tracing::info!(tenant = %tenant, port = existing.port, "replacing unhealthy instance");
            self.destroy_instance(&existing, DestroyReason::Replaced)
                .await;
        }

        self.create(tenant, spec).await
    }

    async fn create(
        self: &Arc<Self>,
        tenant: &TenantId,
        spec: &TenantSpec,
    ) -> Result<Arc<Instance>, PoolError> {
        let port = self.ports.allocate()?;
        let secret = credential::generate();

        let handle = match supervisor::spawn(tenant, port, &secret, spec, &self.cfg).await {
            Ok(h) => h,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };

        let inst = Arc::new(Instance::new(tenant.clone(), port, secret, handle));
        // Visible to list() while starting; same-tenant callers are held
        // off by the creation guard.
        self.instances
            .lock()
            .await
            .insert(tenant.clone(), inst.clone());

        let started = Instant::now();
        let deadline = started + self.cfg.start_timeout;
        loop {
            // An early exit fails the attempt immediately instead of
            // waiting out the whole startup window.
            if let Some(exit) = inst.handle.exit_status() {
                inst.set_state(InstanceState::Failed);
                // A racing destroy that already removed the entry also
                // released the port; releasing again here could drop a
                // lease the allocator has since handed to another tenant.
                if self.remove_if_current(&inst).await {
                    self.ports.release(port);
                }
                self.notifier.emit(PoolEvent::Error {
                    tenant: tenant.clone(),
                    instance: inst.id.clone(),
                    message: format!("worker exited during startup with code {:?}", exit.code),
                });
                return Err(PoolError::WorkerExited { code: exit.code });
            }

            if self.prober.check(port, inst.credential()).await {
                break;
            }

            if Instant::now() >= deadline {
                inst.set_state(InstanceState::Failed);
                supervisor::terminate(tenant, &inst.handle, self.cfg.term_grace).await;
                if self.remove_if_current(&inst).await {
                    self.ports.release(port);
                }
                let waited_ms = started.elapsed().as_millis() as u64;
                self.notifier.emit(PoolEvent::Error {
                    tenant: tenant.clone(),
                    instance: inst.id.clone(),
                    message: format!("no successful health probe within {waited_ms}ms"),
                });
                return Err(PoolError::HealthTimeout { waited_ms });
            }

            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }

        inst.set_state(InstanceState::Running);
        inst.touch();
        self.spawn_exit_watcher(inst.clone());
        self.notifier.emit(PoolEvent::Created {
            tenant: tenant.clone(),
            instance: inst.id.clone(),
            port,
        });
        tracing::info!(tenant = %tenant, port, instance = %inst.id, "instance running");
        Ok(inst)
    }

    /// Marks exits observed after startup. A crash is reported as an
    /// error event and destroyed as unhealthy; a voluntary zero exit is
    /// destroyed as plain exited. Destroys of an already-replaced
    /// instance no-op via the identity check.
    fn spawn_exit_watcher(self: &Arc<Self>, inst: Arc<Instance>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut rx = inst.handle.exit_watch();
            if rx.wait_for(|e| e.is_some()).await.is_err() {
                return;
            }
            let exit = match inst.handle.exit_status() {
                Some(e) => e,
                None => return,
            };

            match inst.state() {
                // Destroy in progress owns the cleanup.
                InstanceState::Stopping | InstanceState::Stopped => {}
                // The creation loop observes startup exits itself.
                InstanceState::Starting => {}
                _ => {
                    let reason = if exit.success {
                        inst.set_state(InstanceState::Stopped);
                        DestroyReason::Exited
                    } else {
                        inst.set_state(InstanceState::Failed);
                        pool.notifier.emit(PoolEvent::Error {
                            tenant: inst.tenant.clone(),
                            instance: inst.id.clone(),
                            message: format!("worker exited with code {:?}", exit.code),
                        });
                        DestroyReason::Unhealthy
                    };
                    pool.destroy_instance(&inst, reason).await;
                }
            }
        });
    }

    /// Tears down `inst`: remove from the map, two-phase terminate,
    /// release the port exactly once, emit `destroyed`. Best-effort and
    /// idempotent; the second of two racing destroys is a no-op.
    pub(crate) async fn destroy_instance(&self, inst: &Arc<Instance>, reason: DestroyReason) {
        if !self.remove_if_current(inst).await {
            return;
        }

        inst.set_state(InstanceState::Stopping);
        supervisor::terminate(&inst.tenant, &inst.handle, self.cfg.term_grace).await;
        inst.set_state(InstanceState::Stopped);
        self.ports.release(inst.port);

        self.notifier.emit(PoolEvent::Destroyed {
            tenant: inst.tenant.clone(),
            instance: inst.id.clone(),
            reason,
        });
        tracing::info!(tenant = %inst.tenant, port = inst.port, ?reason, "instance destroyed");
    }

    /// Administrative destroy. No-op for tenants without an instance.
    pub async fn destroy(&self, tenant: &TenantId) {
        let Some(inst) = self.current(tenant).await else {
            return;
        };
        self.destroy_instance(&inst, DestroyReason::Requested).await;
    }

    /// Sanitized instance snapshots for administrative display.
    pub async fn list(&self) -> Vec<InstanceStatus> {
        let mut out: Vec<InstanceStatus> =
            self.snapshot().await.iter().map(|i| i.status()).collect();
        out.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        out
    }

    pub async fn stats(&self) -> PoolStats {
        let snap = self.snapshot().await;
        let running = snap
            .iter()
            .filter(|i| i.state() == InstanceState::Running)
            .count();
        let leased = self.ports.leased_count();
        PoolStats {
            instances: snap.len(),
            running,
            ports_leased: leased,
            ports_free: self.ports.capacity() - leased,
        }
    }
}
