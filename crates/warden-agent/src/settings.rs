use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT_RANGE: (u16, u16) = (41000, 41999);
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_START_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TERM_GRACE_SEC: u64 = 5;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;
const DEFAULT_REAPER_INTERVAL_MS: u64 = 30_000;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn probe_timeout() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_PROBE_TIMEOUT_MS")
            .map(|v| v.clamp(250, 30_000))
            .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
    )
}

pub(crate) fn start_timeout() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_START_TIMEOUT_MS")
            .map(|v| v.clamp(1_000, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_START_TIMEOUT_MS),
    )
}

pub(crate) fn term_grace() -> Duration {
    Duration::from_secs(
        env_u64("WARDEN_TERM_GRACE_SEC")
            .map(|v| v.clamp(1, 60))
            .unwrap_or(DEFAULT_TERM_GRACE_SEC),
    )
}

pub(crate) fn idle_timeout() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_IDLE_TIMEOUT_MS")
            .map(|v| v.clamp(1_000, 24 * 60 * 60 * 1000))
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
    )
}

pub(crate) fn reaper_interval() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_REAPER_INTERVAL_MS")
            .map(|v| v.clamp(1_000, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_REAPER_INTERVAL_MS),
    )
}

fn parse_port_range(raw: &str) -> Option<(u16, u16)> {
    let (a, b) = raw.split_once('-')?;
    let start: u16 = a.trim().parse().ok()?;
    let end: u16 = b.trim().parse().ok()?;
    if start == 0 || end < start {
        return None;
    }
    Some((start, end))
}

fn port_range() -> (u16, u16) {
    std::env::var("WARDEN_PORT_RANGE")
        .ok()
        .and_then(|raw| parse_port_range(&raw))
        .unwrap_or(DEFAULT_PORT_RANGE)
}

fn data_root() -> PathBuf {
    std::env::var("WARDEN_DATA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/warden"))
}

fn worker_command() -> Vec<String> {
    std::env::var("WARDEN_WORKER_CMD")
        .unwrap_or_default()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

/// Pool tunables. Built from `WARDEN_*` env vars by the daemon; tests
/// construct it directly.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub port_start: u16,
    pub port_end: u16,
    /// Worker executable plus fixed leading arguments.
    pub worker_command: Vec<String>,
    /// Root under which per-tenant working directories are created.
    pub data_root: PathBuf,
    pub probe_timeout: Duration,
    pub start_timeout: Duration,
    pub term_grace: Duration,
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
}

impl PoolConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let (port_start, port_end) = port_range();
        let worker_command = worker_command();
        if worker_command.is_empty() {
            anyhow::bail!("WARDEN_WORKER_CMD is required");
        }

        Ok(Self {
            port_start,
            port_end,
            worker_command,
            data_root: data_root(),
            probe_timeout: probe_timeout(),
            start_timeout: start_timeout(),
            term_grace: term_grace(),
            idle_timeout: idle_timeout(),
            reaper_interval: reaper_interval(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::parse_port_range;

    #[test]
    fn parse_port_range_accepts_dashed_pair() {
        assert_eq!(parse_port_range("41000-41999"), Some((41000, 41999)));
        assert_eq!(parse_port_range(" 7000 - 7004 "), Some((7000, 7004)));
    }

    #[test]
    fn parse_port_range_rejects_garbage() {
        assert_eq!(parse_port_range("41000"), None);
        assert_eq!(parse_port_range("4200-100"), None);
        assert_eq!(parse_port_range("0-10"), None);
        assert_eq!(parse_port_range("a-b"), None);
    }
}
