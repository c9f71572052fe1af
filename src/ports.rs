//! Listen port allocation for supervised agents.
//!
//! `PortsRegistry` hands out ports from a bounded range. Every candidate is
//! verified with a real bind on loopback, so ports taken by processes outside
//! of the supervisor are skipped as well.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

/// Errors returned by [`PortsRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PortsError {
    /// Every port in the range is reserved or bound by someone else.
    #[error("no free port")]
    NoFreePort,
    /// The port was never reserved through this registry.
    #[error("port {0} is not reserved")]
    PortNotReserved(u16),
    /// The port is still bound by some process and stays reserved.
    #[error("port {0} is busy")]
    PortBusy(u16),
}

/// Allocates listen ports from `[min, max]` in round-robin order.
#[derive(Debug)]
pub struct PortsRegistry {
    min: u16,
    max: u16,
    state: Mutex<PortsState>,
}

#[derive(Debug)]
struct PortsState {
    // Last assigned port; the next scan starts right after it.
    last: Option<u16>,
    reserved: BTreeSet<u16>,
}

impl PortsRegistry {
    /// Creates a registry for the inclusive range `[min, max]`.
    ///
    /// `reserved` ports inside the range are treated as already taken; ports
    /// outside of it are ignored.
    pub fn new(min: u16, max: u16, reserved: impl IntoIterator<Item = u16>) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let reserved = reserved
            .into_iter()
            .filter(|port| (min..=max).contains(port))
            .collect();
        Self {
            min,
            max,
            state: Mutex::new(PortsState {
                last: None,
                reserved,
            }),
        }
    }

    /// Reserves the next free port after the last assigned one.
    pub fn reserve(&self) -> Result<u16, PortsError> {
        let mut state = self.lock();
        let size = u32::from(self.max) - u32::from(self.min) + 1;
        let offset = match state.last {
            Some(last) => u32::from(last) - u32::from(self.min),
            None => size - 1,
        };
        for step in 1..=size {
            let port = (u32::from(self.min) + (offset + step) % size) as u16;
            if state.reserved.contains(&port) {
                continue;
            }
            if is_bindable(port) {
                state.reserved.insert(port);
                state.last = Some(port);
                return Ok(port);
            }
        }
        Err(PortsError::NoFreePort)
    }

    /// Returns a reserved port to the pool once nothing listens on it anymore.
    pub fn release(&self, port: u16) -> Result<(), PortsError> {
        let mut state = self.lock();
        if !state.reserved.contains(&port) {
            return Err(PortsError::PortNotReserved(port));
        }
        if !is_bindable(port) {
            return Err(PortsError::PortBusy(port));
        }
        state.reserved.remove(&port);
        Ok(())
    }

    /// Returns whether `port` is currently reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().reserved.contains(&port)
    }

    /// Returns the number of reserved ports.
    pub fn reserved_count(&self) -> usize {
        self.lock().reserved.len()
    }

    fn lock(&self) -> MutexGuard<'_, PortsState> {
        // The state is always left consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

// Finds a small range of currently bindable ports so tests do not depend
// on a fixed range being free on the host.
#[cfg(test)]
pub(crate) fn free_port_range(len: u16) -> (u16, u16) {
    let start = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let start = start.min(u16::MAX - 200);
    for min in start..(u16::MAX - len) {
        if (min..min + len).all(is_bindable) {
            return (min, min + len - 1);
        }
    }
    panic!("no free port range found");
}
