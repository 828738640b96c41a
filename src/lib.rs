//! Control-plane QoS logic for switches that expose flow tables and meters.
//!
//! For every connected switch, fairmeter learns which port each source MAC
//! arrives on, gives every ingress port a default meter, gives provisioned
//! subscribers a dedicated meter, and splits a per-port capacity cap among the
//! subscribers on that port. A periodic monitor reads meter counters back and
//! re-runs the allocation so idle subscribers yield capacity to busy ones.
//!
//! The wire protocol itself is not handled here: a [`gateway::Gateway`]
//! implementation turns [`gateway::Command`]s into protocol messages, and
//! delivers parsed [`gateway::Event`]s to the runtime started by
//! [`RunBuilder`].

pub mod algs;
pub mod config;
pub mod gateway;
pub mod ledger;
pub mod pool;
pub mod rate;
pub mod registry;
pub mod types;

mod admission;
mod monitor;
mod run;

pub use config::{QosConfig, SubscriberTable};
pub use registry::Registry;
pub use run::{ControllerHandle, RunBuilder};
pub use types::{BufferId, Kbps, MacAddr, MeterId, PortNo, SwitchId};

use std::sync::Arc;

use gateway::Gateway;
use pool::Spawner;

/// fairmeter custom error type.
#[derive(Clone, Debug)]
pub struct Error(pub String);

impl<T: std::error::Error + std::fmt::Display> From<T> for Error {
    fn from(e: T) -> Error {
        Error(format!("fairmeter err: {}", e))
    }
}

/// fairmeter custom `Result` type, using `Error` as the `Err` type.
pub type Result<T> = std::result::Result<T, Error>;

/// The QoS engine: the shared state every event handler and background job
/// works against.
///
/// Cloning is cheap; clones share the registry, configuration and gateway, so
/// a clone can be moved into a job on the worker pool.
pub struct Qos<G: Gateway> {
    cfg: Arc<QosConfig>,
    subscribers: Arc<SubscriberTable>,
    registry: Registry,
    gateway: G,
    spawner: Spawner,
}

impl<G: Gateway> Clone for Qos<G> {
    fn clone(&self) -> Self {
        Qos {
            cfg: self.cfg.clone(),
            subscribers: self.subscribers.clone(),
            registry: self.registry.clone(),
            gateway: self.gateway.clone(),
            spawner: self.spawner.clone(),
        }
    }
}

impl<G: Gateway> Qos<G> {
    pub fn new(cfg: QosConfig, subscribers: SubscriberTable, gateway: G, spawner: Spawner) -> Self {
        Qos {
            cfg: Arc::new(cfg),
            subscribers: Arc::new(subscribers),
            registry: Registry::default(),
            gateway,
            spawner,
        }
    }

    pub fn config(&self) -> &QosConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Dispatch one gateway event to the matching handler.
    pub fn on_event(&self, ev: gateway::Event) {
        use gateway::Event::*;
        match ev {
            SwitchConnected(sw) => self.on_connect(sw),
            SwitchDisconnected(sw) => self.on_disconnect(sw),
            PacketIn(pkt) => self.on_packet_in(pkt),
            MeterStats(reply) => self.on_meter_stats(reply),
        }
    }

    fn handle(&self, switch: SwitchId) -> gateway::SwitchHandle<'_, G> {
        gateway::SwitchHandle::new(&self.gateway, switch)
    }
}
