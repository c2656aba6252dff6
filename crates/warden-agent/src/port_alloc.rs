use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::Mutex;

use warden_core::PoolError;

/// Hands out exclusive TCP ports from a bounded range.
///
/// The leased set alone cannot detect ports held by unrelated processes,
/// so every candidate is additionally verified bindable at the OS level
/// before it is returned. The cursor rotates round-robin so a released
/// port is not handed out again immediately, reducing collisions with
/// sockets the OS has not fully torn down yet.
pub struct PortAllocator {
    start: u16,
    end: u16,
    inner: Mutex<AllocState>,
}

struct AllocState {
    leased: HashSet<u16>,
    cursor: u16,
}

fn port_is_bindable(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(l) => {
            l.set_nonblocking(true).ok();
            true
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(_) => false,
    }
}

impl PortAllocator {
    // Lease bookkeeping stays valid even if a holder panicked mid-mutation;
    // a poisoned guard is recovered rather than propagated.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, AllocState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn new(start: u16, end: u16) -> Self {
        assert!(start > 0 && start <= end, "invalid port range");
        Self {
            start,
            end,
            inner: Mutex::new(AllocState {
                leased: HashSet::new(),
                cursor: start,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn leased_count(&self) -> usize {
        self.lock_state().leased.len()
    }

    /// Leases one port, or fails after cycling the full range once.
    pub fn allocate(&self) -> Result<u16, PoolError> {
        let mut state = self.lock_state();

        let mut candidate = state.cursor;
        for _ in 0..self.capacity() {
            let port = candidate;
            candidate = if port >= self.end { self.start } else { port + 1 };

            if state.leased.contains(&port) {
                continue;
            }
            if !port_is_bindable(port) {
                continue;
            }

            state.leased.insert(port);
            state.cursor = candidate;
            return Ok(port);
        }

        Err(PoolError::NoPortsAvailable {
            start: self.start,
            end: self.end,
        })
    }

    /// Idempotent: releasing a never-leased or already-released port is a no-op.
    pub fn release(&self, port: u16) {
        let mut state = self.lock_state();
        state.leased.remove(&port);
    }
}
