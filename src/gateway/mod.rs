//! The seam between the QoS core and the switch control protocol.
//!
//! A protocol gateway owns the switch connections. It delivers parsed
//! [`Event`]s to the runtime and turns [`Command`]s into protocol messages.
//! Every command is fire-and-forget: nothing in the core waits for an
//! acknowledgment, and effects are only observed through later stats replies.

use tracing::warn;

use crate::types::{BufferId, Kbps, MacAddr, MeterId, PortNo, SwitchId};
use crate::Result;

/// Channel-backed gateway
pub mod chan;

pub const ETH_TYPE_LLDP: u16 = 0x88cc;

/// Table holding the per-port and per-source meter rules.
pub const QOS_TABLE: u8 = 0;
/// Table holding learned forwarding rules and the controller miss rule.
pub const FORWARD_TABLE: u8 = 1;

pub const PRIORITY_MISS: u16 = 0;
pub const PRIORITY_PORT_METER: u16 = 1;
pub const PRIORITY_SOURCE_METER: u16 = 2;
pub const PRIORITY_FORWARD: u16 = 3;

/// Gateway implementations must implement this trait.
pub trait Gateway: 'static + Clone + Send + Sync {
    /// Returns the name of this gateway (e.g. "chan" for the channel gateway)
    fn name() -> String;
    /// Queue a command for a switch. Must not block on the switch.
    fn send(&self, switch: SwitchId, cmd: Command) -> Result<()>;
}

/// Asynchronous notifications from the gateway.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    SwitchConnected(SwitchId),
    SwitchDisconnected(SwitchId),
    PacketIn(PacketIn),
    MeterStats(MeterStatsReply),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PacketIn {
    pub switch: SwitchId,
    pub in_port: PortNo,
    pub src: MacAddr,
    pub dst: MacAddr,
    pub eth_type: u16,
    /// Set if the switch kept the packet in one of its buffers.
    pub buffer_id: Option<BufferId>,
    /// The (possibly truncated) frame.
    pub data: Vec<u8>,
    /// Length of the frame on the wire.
    pub total_len: usize,
}

impl PacketIn {
    pub fn is_discovery(&self) -> bool {
        self.eth_type == ETH_TYPE_LLDP
    }

    pub fn is_truncated(&self) -> bool {
        self.data.len() < self.total_len
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeterStatsReply {
    pub switch: SwitchId,
    pub stats: Vec<MeterStat>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeterStat {
    pub meter_id: MeterId,
    /// Cumulative bytes seen by the meter since it was created.
    pub byte_in_count: u64,
}

/// Commands sent to a switch.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    FlowMod(FlowMod),
    MeterMod(MeterMod),
    MeterStatsRequest,
    PacketOut(PacketOut),
}

/// Flow match. `None` fields are wildcards.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Match {
    pub in_port: Option<PortNo>,
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
}

impl Match {
    pub fn all() -> Self {
        Match::default()
    }

    pub fn in_port(port: PortNo) -> Self {
        Match {
            in_port: Some(port),
            ..Match::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Output {
    Port(PortNo),
    Flood,
    /// Send to the controller without buffering the packet on the switch.
    Controller,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Instruction {
    Meter(MeterId),
    GotoTable(u8),
    Output(Output),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlowMod {
    pub table: u8,
    pub priority: u16,
    pub matches: Match,
    pub instructions: Vec<Instruction>,
    /// Seconds; 0 means the rule never idles out.
    pub idle_timeout: u16,
    pub buffer_id: Option<BufferId>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MeterCommand {
    Add,
    Modify,
}

/// A single drop band rate limit in kbps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeterMod {
    pub command: MeterCommand,
    pub meter_id: MeterId,
    pub rate: Kbps,
    pub burst: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Buffered(BufferId),
    Data(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PacketOut {
    pub in_port: PortNo,
    pub output: Output,
    pub payload: Payload,
}

/// A send-only view of one switch.
///
/// Failures are logged and swallowed: the next poll or packet-in drives the
/// switch back towards the ledger's state.
pub struct SwitchHandle<'a, G: Gateway> {
    gateway: &'a G,
    switch: SwitchId,
}

impl<'a, G: Gateway> SwitchHandle<'a, G> {
    pub fn new(gateway: &'a G, switch: SwitchId) -> Self {
        SwitchHandle { gateway, switch }
    }

    fn send(&self, cmd: Command) {
        if let Err(e) = self.gateway.send(self.switch, cmd) {
            warn!(switch = %self.switch, gateway = %G::name(), err = ?e, "command send failed");
        }
    }

    pub fn install_flow(&self, flow: FlowMod) {
        self.send(Command::FlowMod(flow))
    }

    pub fn create_meter(&self, meter_id: MeterId, rate: Kbps) {
        self.send(Command::MeterMod(MeterMod {
            command: MeterCommand::Add,
            meter_id,
            rate,
            burst: 0,
        }))
    }

    pub fn modify_meter(&self, meter_id: MeterId, rate: Kbps) {
        self.send(Command::MeterMod(MeterMod {
            command: MeterCommand::Modify,
            meter_id,
            rate,
            burst: 0,
        }))
    }

    /// Create a meter and a table-0 rule that sends `matches` through it on
    /// its way to the forwarding table.
    pub fn install_qos(&self, priority: u16, matches: Match, meter_id: MeterId, rate: Kbps) {
        self.create_meter(meter_id, rate);
        self.install_flow(FlowMod {
            table: QOS_TABLE,
            priority,
            matches,
            instructions: vec![Instruction::Meter(meter_id), Instruction::GotoTable(FORWARD_TABLE)],
            idle_timeout: 0,
            buffer_id: None,
        });
    }

    pub fn request_meter_stats(&self) {
        self.send(Command::MeterStatsRequest)
    }

    pub fn packet_out(&self, out: PacketOut) {
        self.send(Command::PacketOut(out))
    }
}
