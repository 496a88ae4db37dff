//! The broker transport boundary.
//!
//! The engine never implements a wire format. It consumes a connected
//! [`BrokerLink`] (read/write opaque packets), obtains links through
//! [`Transport`] implementations registered per handler kind at startup,
//! and owns only the selection logic: which address to try, in what
//! order, and how failures aggregate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::core::address::{AddressList, BrokerAddress, HandlerKind, SelectionPolicy};
use crate::core::error::{ConnectAttempt, WireError};
use crate::core::packet::Packet;

/// Transport tuning applied to a fresh link before use.
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub tcp_no_delay: bool,
}

/// A connected raw packet transport. Implementations (TCP, SSL, HTTP
/// tunnel, ...) live outside this crate.
pub trait BrokerLink: Send {
    fn read_packet(&mut self) -> Result<Packet, WireError>;
    fn write_packet(&mut self, packet: &Packet) -> Result<(), WireError>;
    fn configure(&mut self, options: &LinkOptions) -> Result<(), WireError>;
    fn close(&mut self);
}

impl std::fmt::Debug for dyn BrokerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn BrokerLink")
    }
}

/// Opens links for one handler kind.
pub trait Transport: Send + Sync {
    fn connect(&self, address: &BrokerAddress) -> Result<Box<dyn BrokerLink>, WireError>;
}

/// Parse and order the configured broker address list.
pub fn configured_address_list(cfg: &ConnectionConfig) -> Result<AddressList, WireError> {
    let mut list = AddressList::parse(&cfg.address_list)?;
    let policy: SelectionPolicy = cfg.address_list_behavior.parse()?;
    list.select(policy);
    Ok(list)
}

/// Static handler-kind → transport table, populated once at startup.
#[derive(Default)]
pub struct TransportRegistry {
    handlers: HashMap<HandlerKind, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: HandlerKind, transport: Arc<dyn Transport>) {
        self.handlers.insert(kind, transport);
    }

    pub fn get(&self, kind: HandlerKind) -> Option<Arc<dyn Transport>> {
        self.handlers.get(&kind).cloned()
    }
}

/// Connection establishment and failover sweeps over an address list.
///
/// One sweep tries every address in the list's fixed order, starting
/// from the rotation point left by the previous successful connect, so
/// failover moves on from the broker that just died instead of hammering
/// it first. Only once every address in every configured iteration has
/// failed does the sweep raise a hard failure, carrying the complete
/// per-address cause list.
pub struct Connector {
    registry: Arc<TransportRegistry>,
    options: LinkOptions,
    reconnect_delay: Duration,
    list_iterations: u32,
    next_start: AtomicUsize,
}

impl Connector {
    pub fn new(
        registry: Arc<TransportRegistry>,
        options: LinkOptions,
        reconnect_delay: Duration,
        list_iterations: u32,
    ) -> Self {
        Self {
            registry,
            options,
            reconnect_delay,
            list_iterations,
            next_start: AtomicUsize::new(0),
        }
    }

    pub fn from_config(
        registry: Arc<TransportRegistry>,
        options: LinkOptions,
        cfg: &ConnectionConfig,
    ) -> Self {
        Self::new(
            registry,
            options,
            Duration::from_millis(cfg.reconnect_delay_ms),
            cfg.address_list_iterations,
        )
    }

    /// Try addresses in list order until one connects. Returns the link
    /// and the address it is bound to.
    pub fn connect_any(
        &self,
        list: &AddressList,
    ) -> Result<(Box<dyn BrokerLink>, BrokerAddress), WireError> {
        if list.is_empty() {
            return Err(WireError::ConnectFailed(Vec::new()));
        }

        let len = list.len();
        let iterations = self.list_iterations.max(1);
        // last failure per address, in list order
        let mut failures: Vec<Option<ConnectAttempt>> = vec![None; len];

        for round in 0..iterations {
            for j in 0..len {
                let idx = (self.next_start.load(Ordering::Relaxed) + j) % len;
                let addr = list.get(idx).expect("index within list");

                match self.try_address(addr) {
                    Ok(link) => {
                        self.next_start.store((idx + 1) % len, Ordering::Relaxed);
                        info!(address = %addr, "connected to broker");
                        return Ok((link, addr.clone()));
                    }
                    Err(e) => {
                        warn!(address = %addr, error = %e, "connect attempt failed");
                        failures[idx] = Some(ConnectAttempt {
                            address: addr.to_string(),
                            cause: e.to_string(),
                        });
                    }
                }

                if j != len - 1 && !self.reconnect_delay.is_zero() {
                    std::thread::sleep(self.reconnect_delay);
                }
            }

            if round != iterations - 1 && !self.reconnect_delay.is_zero() {
                std::thread::sleep(self.reconnect_delay);
            }
        }

        Err(WireError::ConnectFailed(
            failures.into_iter().flatten().collect(),
        ))
    }

    fn try_address(&self, addr: &BrokerAddress) -> Result<Box<dyn BrokerLink>, WireError> {
        debug!(address = %addr, "attempting broker connect");
        let transport = self.registry.get(addr.handler).ok_or_else(|| {
            WireError::Internal(format!("no transport registered for {:?}", addr.handler))
        })?;
        let mut link = transport.connect(addr)?;
        link.configure(&self.options)?;
        Ok(link)
    }
}
