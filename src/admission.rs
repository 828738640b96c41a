//! Packet-in handling: source learning, default port meters, subscriber
//! admission, and the L2 forwarding decision.

use tracing::{debug, info};

use crate::gateway::{
    FlowMod, Gateway, Instruction, Match, Output, PacketIn, PacketOut, Payload, FORWARD_TABLE,
    PRIORITY_FORWARD, PRIORITY_PORT_METER, PRIORITY_SOURCE_METER,
};
use crate::registry::{with_live, SwitchRef};
use crate::types::{Kbps, MacAddr, MeterId, PortNo, SwitchId};
use crate::Qos;

impl<G: Gateway> Qos<G> {
    pub fn on_packet_in(&self, pkt: PacketIn) {
        if pkt.is_discovery() {
            return;
        }

        if pkt.is_truncated() {
            debug!(
                switch = %pkt.switch,
                captured = pkt.data.len(),
                total = pkt.total_len,
                "packet truncated"
            );
        }

        let weak = match self.registry.weak(pkt.switch) {
            Some(w) => w,
            None => {
                debug!(switch = %pkt.switch, "packet-in from unknown switch, ignoring");
                return;
            }
        };

        debug!(
            switch = %pkt.switch,
            src = %pkt.src,
            dst = %pkt.dst,
            in_port = pkt.in_port,
            "packet in"
        );

        let baseline = self.cfg.baseline;
        let contracted = self.subscribers.rate(&pkt.src);
        let decision = with_live(&weak, |ledger| {
            let new_port_meter = ledger.ensure_port_meter(pkt.in_port, baseline);
            let needs_admission = contracted.filter(|_| ledger.meter_of(&pkt.src).is_none());
            ledger.learn(pkt.src, pkt.in_port);
            let out_port = ledger.port_of(&pkt.dst);
            (new_port_meter, needs_admission, out_port)
        });

        let (new_port_meter, needs_admission, out_port) = match decision {
            Some(d) => d,
            None => {
                debug!(switch = %pkt.switch, "switch went away, dropping packet-in");
                return;
            }
        };

        // jobs stay bound to this connection's record, never to a later one
        if let Some(meter_id) = new_port_meter {
            let qos = self.clone();
            let rec = weak.clone();
            let (switch, port) = (pkt.switch, pkt.in_port);
            self.spawner
                .spawn(move || qos.install_port_meter(&rec, switch, port, meter_id));
        }

        if let Some(rate) = needs_admission {
            let qos = self.clone();
            let rec = weak.clone();
            let (switch, src, port) = (pkt.switch, pkt.src, pkt.in_port);
            self.spawner
                .spawn(move || qos.admit_on(&rec, switch, src, port, rate));
        }

        self.forward(pkt, out_port);
    }

    /// Meter all traffic entering `port` at the baseline rate. Rules matching
    /// individual subscribers take precedence.
    fn install_port_meter(&self, rec: &SwitchRef, switch: SwitchId, port: PortNo, meter_id: MeterId) {
        let baseline = self.cfg.baseline;
        let installed = with_live(rec, |_| {
            self.handle(switch)
                .install_qos(PRIORITY_PORT_METER, Match::in_port(port), meter_id, baseline);
        });

        if installed.is_some() {
            debug!(switch = %switch, port, meter_id, rate = baseline, "added port meter");
        }
    }

    /// Give subscriber `src` its own meter on `port` of the currently
    /// registered `switch`.
    pub fn admit(&self, switch: SwitchId, src: MacAddr, port: PortNo, contracted: Kbps) {
        match self.registry.weak(switch) {
            Some(rec) => self.admit_on(&rec, switch, src, port, contracted),
            None => debug!(switch = %switch, src = %src, "admission for unknown switch, ignoring"),
        }
    }

    /// Admit `src` on the connection `rec`, and push the new rates of the
    /// other subscribers on the port whose share moved. A no-op once that
    /// connection is gone, even if `switch` has reconnected since.
    fn admit_on(&self, rec: &SwitchRef, switch: SwitchId, src: MacAddr, port: PortNo, contracted: Kbps) {
        let capacity = self.cfg.capacity;
        let params = self.cfg.rate_params();
        let admitted = with_live(rec, |ledger| {
            let a = ledger.admit(src, port, contracted, capacity, &params)?;
            let sw = self.handle(switch);
            sw.install_qos(
                PRIORITY_SOURCE_METER,
                Match {
                    in_port: Some(port),
                    eth_src: Some(src),
                    eth_dst: None,
                },
                a.meter_id,
                a.rate,
            );

            for c in &a.changed {
                debug!(switch = %switch, src = %c.src, meter_id = c.meter_id, rate = c.rate, "modifying subscriber meter");
                sw.modify_meter(c.meter_id, c.rate);
            }

            Some(a)
        });

        match admitted {
            Some(Some(a)) => info!(
                switch = %switch,
                src = %src,
                port,
                meter_id = a.meter_id,
                contracted,
                rate = a.rate,
                modified = a.changed.len(),
                "admitted subscriber"
            ),
            Some(None) => debug!(switch = %switch, src = %src, "subscriber already metered"),
            None => debug!(switch = %switch, src = %src, "switch went away, dropping admission"),
        }
    }

    fn forward(&self, pkt: PacketIn, out_port: Option<PortNo>) {
        let sw = self.handle(pkt.switch);
        let out_port = match out_port {
            Some(p) => p,
            None => {
                let payload = match pkt.buffer_id {
                    Some(b) => Payload::Buffered(b),
                    None => Payload::Data(pkt.data),
                };
                sw.packet_out(PacketOut {
                    in_port: pkt.in_port,
                    output: Output::Flood,
                    payload,
                });
                return;
            }
        };

        sw.install_flow(FlowMod {
            table: FORWARD_TABLE,
            priority: PRIORITY_FORWARD,
            matches: Match {
                in_port: Some(pkt.in_port),
                eth_src: None,
                eth_dst: Some(pkt.dst),
            },
            instructions: vec![Instruction::Output(Output::Port(out_port))],
            idle_timeout: self.cfg.idle_timeout,
            buffer_id: pkt.buffer_id,
        });

        // a buffered packet is released by the flow-mod itself
        if pkt.buffer_id.is_none() {
            sw.packet_out(PacketOut {
                in_port: pkt.in_port,
                output: Output::Port(out_port),
                payload: Payload::Data(pkt.data),
            });
        }
    }
}
