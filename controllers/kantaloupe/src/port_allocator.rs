//! Gateway listener port allocator.
//!
//! A bitmap over `[base, base + count)` shared by the flow and gateway
//! section controllers of one member. It is rehydrated on startup from the
//! TCPRoutes owned by flows and from the listeners of the hub gateway.

use crds::well_known::{FLOW_NAME_LABEL, GATEWAY_NAME};
use crds::{Gateway, TCPRoute, split_section_name};
use kube::Api;
use kube::api::ListParams;
use rand::Rng;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{ControllerError, is_not_found};

/// Allocation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortAllocatorError {
    /// Every port in the range is taken
    #[error("range is full")]
    Full,

    /// The port is already allocated
    #[error("port {0} is already allocated")]
    Allocated(i32),

    /// The port is outside the range
    #[error("port {port} is not in the range {range}")]
    NotInRange {
        /// Requested port
        port: i32,
        /// Range rendered as `base-last`
        range: String,
    },

    /// The configured range is empty or overflows
    #[error("invalid port range {base}+{count}")]
    InvalidRange {
        /// First port
        base: i32,
        /// Number of ports
        count: i32,
    },
}

/// Bitmap allocator over a contiguous port range.
#[derive(Debug)]
pub struct PortAllocator {
    base: i32,
    count: usize,
    bits: Mutex<Vec<bool>>,
}

impl PortAllocator {
    /// Creates an allocator over `[base, base + count)`.
    pub fn new(base: i32, count: i32) -> Result<Self, PortAllocatorError> {
        if count <= 0 || base <= 0 || base.checked_add(count).is_none_or(|end| end > 65536) {
            return Err(PortAllocatorError::InvalidRange { base, count });
        }
        let count = usize::try_from(count).map_err(|_| PortAllocatorError::InvalidRange { base, count })?;
        Ok(Self {
            base,
            count,
            bits: Mutex::new(vec![false; count]),
        })
    }

    fn range(&self) -> String {
        format!("{}-{}", self.base, self.base + self.count as i32 - 1)
    }

    fn offset(&self, port: i32) -> Option<usize> {
        let offset = usize::try_from(port.checked_sub(self.base)?).ok()?;
        (offset < self.count).then_some(offset)
    }

    fn bits(&self) -> std::sync::MutexGuard<'_, Vec<bool>> {
        match self.bits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocates a free port, scanning from a random offset.
    pub fn allocate_next(&self) -> Result<i32, PortAllocatorError> {
        let mut bits = self.bits();
        let start = rand::thread_rng().gen_range(0..self.count);
        for i in 0..self.count {
            let offset = (start + i) % self.count;
            if !bits[offset] {
                bits[offset] = true;
                return Ok(self.base + offset as i32);
            }
        }
        Err(PortAllocatorError::Full)
    }

    /// Allocates a specific port.
    pub fn allocate(&self, port: i32) -> Result<(), PortAllocatorError> {
        let offset = self.offset(port).ok_or_else(|| PortAllocatorError::NotInRange {
            port,
            range: self.range(),
        })?;
        let mut bits = self.bits();
        if bits[offset] {
            return Err(PortAllocatorError::Allocated(port));
        }
        bits[offset] = true;
        Ok(())
    }

    /// Releases a port. Releasing a free or out-of-range port is a no-op.
    pub fn release(&self, port: i32) {
        if let Some(offset) = self.offset(port) {
            self.bits()[offset] = false;
        }
    }

    /// Whether `port` is allocated.
    pub fn has(&self, port: i32) -> bool {
        self.offset(port).is_some_and(|offset| self.bits()[offset])
    }

    /// Number of allocated ports.
    pub fn used(&self) -> usize {
        self.bits().iter().filter(|b| **b).count()
    }

    /// Number of free ports.
    pub fn free(&self) -> usize {
        self.count - self.used()
    }

    /// Calls `f` for every allocated port in ascending order.
    pub fn for_each(&self, mut f: impl FnMut(i32)) {
        let allocated: Vec<i32> = self
            .bits()
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .map(|(i, _)| self.base + i as i32)
            .collect();
        for port in allocated {
            f(port);
        }
    }

    /// Marks ports already in use on the member.
    ///
    /// Route sections are authoritative and a conflict among them fails
    /// startup. Gateway listeners may duplicate route ports or sit outside
    /// the range, so their errors are ignored.
    pub async fn start(
        &self,
        tcp_routes: &Api<TCPRoute>,
        gateways: &Api<Gateway>,
    ) -> Result<(), ControllerError> {
        let routes = tcp_routes.list(&ListParams::default().labels(FLOW_NAME_LABEL)).await?;
        for route in routes.items {
            for parent in &route.spec.parent_refs {
                let Some(section) = parent.section_name.as_deref() else {
                    continue;
                };
                let (_, port) = split_section_name(section)?;
                debug!("Restoring port {} from route section {}", port, section);
                self.allocate(port)?;
            }
        }

        match gateways.get(GATEWAY_NAME).await {
            Ok(gateway) => {
                for listener in &gateway.spec.listeners {
                    if let Err(e) = self.allocate(listener.port) {
                        debug!("Ignoring listener {}: {}", listener.name, e);
                    }
                }
            }
            Err(e) if is_not_found(&e) => debug!("Gateway {} not found, skipping listener restore", GATEWAY_NAME),
            Err(e) => return Err(e.into()),
        }

        info!("Port allocator restored with {} ports in use, {} free", self.used(), self.free());
        Ok(())
    }
}
