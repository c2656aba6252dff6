use std::sync::Arc;

use futures_util::future::join_all;

use warden_core::{DestroyReason, InstanceState};

use crate::registry::InstancePool;

/// Periodic sweep that evicts unhealthy or inactive instances.
#[derive(Clone)]
pub struct Reaper {
    pool: Arc<InstancePool>,
}

impl Reaper {
    pub fn new(pool: Arc<InstancePool>) -> Self {
        Self { pool }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let interval = self.pool.config().reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    /// One pass over all live instances. Probes run concurrently, each
    /// with its own timeout, so one hung worker cannot stall the sweep of
    /// the others; a failed destroy is logged and does not abort the rest.
    pub async fn sweep(&self) {
        let idle_timeout = self.pool.config().idle_timeout;
        let start_timeout = self.pool.config().start_timeout;
        let snapshot = self.pool.snapshot().await;

        let sweeps = snapshot.into_iter().map(|inst| {
            let pool = self.pool.clone();
            async move {
                match inst.state() {
                    // In-flight creations own their instance and are
                    // bounded by the start timeout. An entry stuck in
                    // Starting far past that window means its creating
                    // caller was cancelled; reclaim it.
                    InstanceState::Starting => {
                        if inst.age() > start_timeout * 2 {
                            tracing::warn!(
                                tenant = %inst.tenant(),
                                port = inst.port(),
                                "reaping instance stranded in startup"
                            );
                            pool.destroy_instance(&inst, DestroyReason::Unhealthy).await;
                        }
                        return;
                    }
                    // Already on the way out; no double-destroy.
                    InstanceState::Stopping | InstanceState::Stopped => return,
                    InstanceState::Running | InstanceState::Failed => {}
                }

                let healthy = inst.state() == InstanceState::Running
                    && inst.handle().exit_status().is_none()
                    && pool.prober().check(inst.port(), inst.credential()).await;

                if !healthy {
                    tracing::info!(tenant = %inst.tenant(), port = inst.port(), "reaping unhealthy instance");
                    pool.destroy_instance(&inst, DestroyReason::Unhealthy).await;
                    return;
                }

                if inst.idle() > idle_timeout {
                    tracing::info!(
                        tenant = %inst.tenant(),
                        port = inst.port(),
                        idle_ms = inst.idle().as_millis() as u64,
                        "reaping idle instance"
                    );
                    pool.destroy_instance(&inst, DestroyReason::Idle).await;
                }
            }
        });

        join_all(sweeps).await;
    }
}
