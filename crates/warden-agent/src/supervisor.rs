use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use warden_core::{PoolError, TenantId, TenantSpec};

use crate::settings::PoolConfig;

/// Exit observed by the wait task.
#[derive(Debug, Clone, Copy)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub success: bool,
}

/// Handle to a spawned worker. The `Child` itself is owned by the wait
/// task; everyone else observes the exit through the watch channel and
/// signals the process group.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Option<u32>,
    pgid: Option<i32>,
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `Some` once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<WorkerExit> {
        *self.exit.borrow()
    }

    pub(crate) fn exit_watch(&self) -> watch::Receiver<Option<WorkerExit>> {
        self.exit.clone()
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, the worker must not outlive it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: i32, sig: libc::c_int) {
    unsafe {
        libc::kill(-pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _sig: i32) {}

fn working_dir(tenant: &TenantId, spec: &TenantSpec, cfg: &PoolConfig) -> PathBuf {
    spec.working_dir
        .clone()
        .unwrap_or_else(|| cfg.data_root.join(&tenant.0))
}

/// Launches the worker bound to `127.0.0.1:port`. Credential and tenant
/// identity travel via environment, never argv, so they do not leak
/// through process listings.
pub async fn spawn(
    tenant: &TenantId,
    port: u16,
    credential: &str,
    spec: &TenantSpec,
    cfg: &PoolConfig,
) -> Result<WorkerHandle, PoolError> {
    let Some((program, args)) = cfg.worker_command.split_first() else {
        return Err(PoolError::SpawnFailure(std::io::Error::other(
            "worker command is empty",
        )));
    };

    let dir = working_dir(tenant, spec, cfg);
    tokio::fs::create_dir_all(&dir).await?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&dir)
        .env("WARDEN_WORKER_PORT", port.to_string())
        .env("WARDEN_WORKER_TENANT", &tenant.0)
        .env("WARDEN_WORKER_CREDENTIAL", credential)
        .env("WARDEN_WORKER_DATA_DIR", &dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(mb) = spec.memory_limit_mb {
        cmd.env("WARDEN_WORKER_MEMORY_LIMIT_MB", mb.to_string());
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let pgid = pid.map(|p| p as i32);

    tracing::info!(tenant = %tenant, port, pid, "worker spawned");

    if let Some(out) = child.stdout.take() {
        let tenant = tenant.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(tenant = %tenant, "[stdout] {line}");
            }
        });
    }
    if let Some(err) = child.stderr.take() {
        let tenant = tenant.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(tenant = %tenant, "[stderr] {line}");
            }
        });
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    {
        let tenant = tenant.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => WorkerExit {
                    code: status.code(),
                    success: status.success(),
                },
                Err(err) => {
                    tracing::warn!(tenant = %tenant, "worker wait failed: {err}");
                    WorkerExit {
                        code: None,
                        success: false,
                    }
                }
            };
            tracing::info!(
                tenant = %tenant,
                code = ?exit.code,
                success = exit.success,
                "worker exited"
            );
            let _ = exit_tx.send(Some(exit));
        });
    }

    Ok(WorkerHandle {
        pid,
        pgid,
        exit: exit_rx,
    })
}

/// Two-phase termination: graceful signal, then a forceful kill once the
/// grace window runs out. Workers may hold open connections that need a
/// chance to drain. Never fails; destroy is best-effort.
pub async fn terminate(tenant: &TenantId, handle: &WorkerHandle, grace: Duration) {
    if handle.exit_status().is_some() {
        return;
    }
    let Some(pgid) = handle.pgid else {
        return;
    };

    #[cfg(unix)]
    signal_group(pgid, libc::SIGTERM);
    #[cfg(not(unix))]
    signal_group(pgid, 15);

    let mut rx = handle.exit_watch();
    if tokio::time::timeout(grace, rx.wait_for(|e| e.is_some()))
        .await
        .is_ok()
    {
        return;
    }

    tracing::warn!(
        tenant = %tenant,
        grace_ms = grace.as_millis() as u64,
        "worker ignored graceful termination, killing"
    );

    #[cfg(unix)]
    signal_group(pgid, libc::SIGKILL);
    #[cfg(not(unix))]
    signal_group(pgid, 9);

    let _ = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|e| e.is_some())).await;
}
