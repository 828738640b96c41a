//! Meter statistics polling and the usage feedback loop.

use std::collections::BTreeSet;

use crossbeam::channel::Receiver;
use tracing::{debug, info, trace};

use crate::gateway::{Gateway, MeterStatsReply};
use crate::ledger::Sample;
use crate::registry::{with_live, SwitchRef};
use crate::types::{PortNo, SwitchId};
use crate::Qos;

impl<G: Gateway> Qos<G> {
    /// Ask every registered switch for the counters of all its meters.
    pub fn poll(&self) {
        for switch in self.registry.switches() {
            trace!(switch = %switch, "send meter stats request");
            self.handle(switch).request_meter_stats();
        }
    }

    /// Fold a stats reply into the ledger. Subscribers that are capped below
    /// their request and close to their share get their usage amplified and
    /// their port reallocated.
    pub fn on_meter_stats(&self, reply: MeterStatsReply) {
        let switch = reply.switch;
        let weak = match self.registry.weak(switch) {
            Some(w) => w,
            None => {
                debug!(switch = %switch, "meter stats from unknown switch, ignoring");
                return;
            }
        };

        let mut stats = reply.stats;
        stats.sort_by_key(|s| s.meter_id);

        let interval = self.cfg.poll_interval;
        let saturation = self.cfg.saturation;
        let amplification = self.cfg.amplification;
        let saturated_ports = with_live(&weak, |ledger| {
            let mut ports = BTreeSet::<PortNo>::new();
            for stat in &stats {
                match ledger.record_sample(stat.meter_id, stat.byte_in_count, interval, saturation, amplification) {
                    Sample::UnknownMeter => {
                        trace!(switch = %switch, meter_id = stat.meter_id, "stats for unknown meter");
                    }
                    Sample::Port { port, speed } => {
                        debug!(switch = %switch, meter_id = stat.meter_id, port, kbps = speed, "port meter");
                    }
                    Sample::Source {
                        port,
                        src,
                        speed,
                        saturated,
                    } => {
                        debug!(
                            switch = %switch,
                            meter_id = stat.meter_id,
                            port,
                            src = %src,
                            kbps = speed,
                            saturated,
                            "subscriber meter"
                        );
                        if saturated {
                            ports.insert(port);
                        }
                    }
                }
            }

            ports
        });

        let ports = match saturated_ports {
            Some(p) => p,
            None => {
                debug!(switch = %switch, "switch went away, dropping meter stats");
                return;
            }
        };

        for port in ports {
            let qos = self.clone();
            let rec = weak.clone();
            self.spawner
                .spawn(move || qos.reallocate_on(&rec, switch, port));
        }
    }

    /// Recompute a port's allocation on the currently registered `switch`.
    pub fn reallocate(&self, switch: SwitchId, port: PortNo) {
        if let Some(rec) = self.registry.weak(switch) {
            self.reallocate_on(&rec, switch, port);
        }
    }

    /// Recompute a port's allocation from requests and adjusted usage, and
    /// push the rates that changed. A no-op once the connection `rec` is gone.
    fn reallocate_on(&self, rec: &SwitchRef, switch: SwitchId, port: PortNo) {
        let capacity = self.cfg.capacity;
        let params = self.cfg.rate_params();
        let changed = with_live(rec, |ledger| {
            let changed = ledger.reallocate(port, capacity, &params);
            let sw = self.handle(switch);
            for c in &changed {
                sw.modify_meter(c.meter_id, c.rate);
            }
            changed.len()
        });

        match changed {
            Some(n) => debug!(switch = %switch, port, modified = n, "reallocated port"),
            None => debug!(switch = %switch, port, "switch went away, dropping reallocation"),
        }
    }
}

/// Poll all switches every `poll_interval` until `stop` is closed.
pub(crate) fn monitor_loop<G: Gateway>(qos: Qos<G>, stop: Receiver<()>) {
    let interval = qos.config().poll_interval;
    info!(interval = ?interval, "starting meter monitor");
    let ticker = crossbeam::channel::tick(interval);
    loop {
        qos.poll();
        crossbeam::channel::select! {
            recv(ticker) -> _ => {}
            recv(stop) -> _ => break,
        }
    }

    info!("meter monitor shutting down");
}
