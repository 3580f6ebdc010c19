//! Local TCP port allocation
//!
//! Ports are probed by binding and immediately releasing a listener. The
//! probe is advisory: another process may grab the port before the caller
//! binds it. Ports handed out by this allocator are remembered until
//! released so that two allocations inside this process never collide.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Finds free local ports in a bounded range
#[derive(Debug)]
pub struct PortAllocator {
    range_end: u16,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator whose scans stop at `range_end` (inclusive)
    pub fn new(range_end: u16) -> Self {
        Self {
            range_end,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Return the first bindable port in `range_start..=range_end`
    pub fn allocate(&self, range_start: u16) -> Result<u16> {
        let mut reserved = self.reserved.lock();
        for port in range_start..=self.range_end {
            if port == 0 || reserved.contains(&port) {
                continue;
            }
            if is_bindable(port) {
                reserved.insert(port);
                debug!(port, "Allocated port");
                return Ok(port);
            }
        }
        Err(Error::NoFreePort {
            start: range_start,
            end: self.range_end,
        })
    }

    /// Give a port back so later scans may return it again
    pub fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            debug!(port, "Released port");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
