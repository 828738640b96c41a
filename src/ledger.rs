//! Per-switch meter and rate bookkeeping.
//!
//! A [`SwitchLedger`] is plain data: it never talks to the switch. Callers
//! hold the switch lock while they read it, update it, and emit the commands
//! the update implies, so that every check-then-set is atomic.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::rate::{self, RateMap, RateParams};
use crate::types::{Kbps, MacAddr, MeterId, PortNo, SwitchId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Registered, baseline rules not yet sent.
    Connecting,
    Active,
    /// Disconnected. Jobs still holding the record must not touch it.
    Gone,
}

/// What a meter limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeterOwner {
    /// Default meter for all unclassified traffic entering a port.
    Port(PortNo),
    /// Dedicated meter of a subscriber, bound to the port it was admitted on.
    Source { port: PortNo, src: MacAddr },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Meter {
    pub owner: MeterOwner,
    pub rate: Kbps,
    /// Cumulative byte count at the previous sample.
    pub prev_bytes: u64,
    /// Last measured throughput in kbps.
    pub speed: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PortLedger {
    pub default_meter: Option<MeterId>,
    pub requested: RateMap,
    pub allocated: RateMap,
    pub used: RateMap,
    pub used_adjusted: RateMap,
}

/// A subscriber meter whose rate must be pushed to the switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateChange {
    pub src: MacAddr,
    pub meter_id: MeterId,
    pub rate: Kbps,
}

/// Result of admitting a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct Admission {
    pub meter_id: MeterId,
    pub rate: Kbps,
    /// Other subscribers on the port whose allocation moved.
    pub changed: Vec<RateChange>,
}

/// What a meter stats sample said about a subscriber.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sample {
    UnknownMeter,
    Port { port: PortNo, speed: f64 },
    Source {
        port: PortNo,
        src: MacAddr,
        speed: f64,
        /// The subscriber is near its share and capped below its request.
        saturated: bool,
    },
}

#[derive(Clone, Debug)]
pub struct SwitchLedger {
    id: SwitchId,
    state: Lifecycle,
    last_meter: MeterId,
    mac_to_port: HashMap<MacAddr, PortNo>,
    ports: BTreeMap<PortNo, PortLedger>,
    src_to_meter: HashMap<MacAddr, MeterId>,
    meters: BTreeMap<MeterId, Meter>,
}

impl SwitchLedger {
    pub fn new(id: SwitchId) -> Self {
        SwitchLedger {
            id,
            state: Lifecycle::Connecting,
            last_meter: 0,
            mac_to_port: HashMap::new(),
            ports: BTreeMap::new(),
            src_to_meter: HashMap::new(),
            meters: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> SwitchId {
        self.id
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state != Lifecycle::Gone
    }

    pub fn activate(&mut self) {
        if self.state == Lifecycle::Connecting {
            self.state = Lifecycle::Active;
        }
    }

    pub fn retire(&mut self) {
        self.state = Lifecycle::Gone;
    }

    /// Record the port `src` was last seen on. Returns the previous port.
    pub fn learn(&mut self, src: MacAddr, port: PortNo) -> Option<PortNo> {
        self.mac_to_port.insert(src, port)
    }

    pub fn port_of(&self, mac: &MacAddr) -> Option<PortNo> {
        self.mac_to_port.get(mac).copied()
    }

    pub fn port(&self, port: PortNo) -> Option<&PortLedger> {
        self.ports.get(&port)
    }

    pub fn ports(&self) -> impl Iterator<Item = (&PortNo, &PortLedger)> {
        self.ports.iter()
    }

    pub fn meter(&self, id: MeterId) -> Option<&Meter> {
        self.meters.get(&id)
    }

    pub fn meters(&self) -> impl Iterator<Item = (&MeterId, &Meter)> {
        self.meters.iter()
    }

    pub fn meter_of(&self, src: &MacAddr) -> Option<MeterId> {
        self.src_to_meter.get(src).copied()
    }

    fn next_meter_id(&mut self) -> MeterId {
        self.last_meter += 1;
        self.last_meter
    }

    /// Give `port` its default meter if it has none yet. Returns the new
    /// meter's id when one was created.
    pub fn ensure_port_meter(&mut self, port: PortNo, rate: Kbps) -> Option<MeterId> {
        if self.ports.get(&port).and_then(|p| p.default_meter).is_some() {
            return None;
        }

        let id = self.next_meter_id();
        self.meters.insert(
            id,
            Meter {
                owner: MeterOwner::Port(port),
                rate,
                prev_bytes: 0,
                speed: 0.0,
            },
        );
        self.ports.entry(port).or_default().default_meter = Some(id);
        Some(id)
    }

    /// Admit subscriber `src` on `port` with its contracted rate.
    ///
    /// Returns `None` if the source already has a meter on this switch.
    pub fn admit(
        &mut self,
        src: MacAddr,
        port: PortNo,
        contracted: Kbps,
        capacity: Kbps,
        params: &RateParams,
    ) -> Option<Admission> {
        if self.src_to_meter.contains_key(&src) {
            return None;
        }

        self.ports
            .entry(port)
            .or_default()
            .requested
            .insert(src, contracted);
        let changed = self.reallocate(port, capacity, params);

        let rate = self
            .ports
            .get(&port)
            .and_then(|p| p.allocated.get(&src))
            .copied()
            .unwrap_or(contracted);
        let meter_id = self.next_meter_id();
        self.meters.insert(
            meter_id,
            Meter {
                owner: MeterOwner::Source { port, src },
                rate,
                prev_bytes: 0,
                speed: 0.0,
            },
        );
        self.src_to_meter.insert(src, meter_id);

        Some(Admission {
            meter_id,
            rate,
            changed,
        })
    }

    /// Recompute `port`'s allocation from its requests and adjusted usage,
    /// commit it, and return the metered sources whose rate changed.
    pub fn reallocate(&mut self, port: PortNo, capacity: Kbps, params: &RateParams) -> Vec<RateChange> {
        let p = match self.ports.get_mut(&port) {
            Some(p) => p,
            None => return vec![],
        };

        let next = rate::allocate(capacity, &p.requested, &p.used_adjusted, params);
        let prev = std::mem::replace(&mut p.allocated, next);

        let mut changed = vec![];
        for (src, &rate) in &p.allocated {
            if prev.get(src).copied().unwrap_or(0) == rate {
                continue;
            }

            if let Some(&meter_id) = self.src_to_meter.get(src) {
                if let Some(m) = self.meters.get_mut(&meter_id) {
                    m.rate = rate;
                }
                changed.push(RateChange {
                    src: *src,
                    meter_id,
                    rate,
                });
            }
        }

        changed
    }

    /// Fold one cumulative byte counter into the meter's speed estimate and,
    /// for subscriber meters, into the port's usage maps.
    pub fn record_sample(
        &mut self,
        meter_id: MeterId,
        byte_in_count: u64,
        interval: Duration,
        saturation: f64,
        amplification: f64,
    ) -> Sample {
        let meter = match self.meters.get_mut(&meter_id) {
            Some(m) => m,
            None => return Sample::UnknownMeter,
        };

        let delta = byte_in_count.saturating_sub(meter.prev_bytes);
        meter.speed = speed_kbps(delta, interval);
        meter.prev_bytes = byte_in_count;
        let speed = meter.speed;

        let (port, src) = match meter.owner {
            MeterOwner::Port(port) => return Sample::Port { port, speed },
            MeterOwner::Source { port, src } => (port, src),
        };

        let p = self.ports.entry(port).or_default();
        let used = speed as Kbps;
        p.used.insert(src, used);

        let allocated = p.allocated.get(&src).copied();
        let requested = p.requested.get(&src).copied();
        let saturated = match (allocated, requested) {
            (Some(a), Some(r)) => used >= (a as f64 * saturation) as Kbps && a != r,
            _ => false,
        };

        let adjusted = if saturated {
            (used as f64 * amplification) as Kbps
        } else {
            used
        };
        p.used_adjusted.insert(src, adjusted);

        Sample::Source {
            port,
            src,
            speed,
            saturated,
        }
    }
}

/// Throughput in kbps of `bytes` observed over `interval`.
pub fn speed_kbps(bytes: u64, interval: Duration) -> f64 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }

    8.0 * bytes as f64 / (secs * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::{speed_kbps, Lifecycle, MeterOwner, RateChange, Sample, SwitchLedger};
    use crate::rate::RateParams;
    use crate::types::{MacAddr, SwitchId};
    use std::time::Duration;

    const CAP: u64 = 40_000;
    const SECS: Duration = Duration::from_secs(5);

    fn mac(last: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, last])
    }

    #[test]
    fn lifecycle() {
        let mut l = SwitchLedger::new(SwitchId(1));
        assert_eq!(l.state(), Lifecycle::Connecting);
        assert!(l.is_live());
        l.activate();
        assert_eq!(l.state(), Lifecycle::Active);
        l.retire();
        assert!(!l.is_live());
        l.activate();
        assert_eq!(l.state(), Lifecycle::Gone);
    }

    #[test]
    fn port_meter_once() {
        let mut l = SwitchLedger::new(SwitchId(1));
        assert_eq!(l.ensure_port_meter(3, 5000), Some(1));
        assert_eq!(l.ensure_port_meter(3, 5000), None);
        assert_eq!(l.ensure_port_meter(4, 5000), Some(2));
        assert_eq!(l.port(3).unwrap().default_meter, Some(1));
        assert_eq!(l.meter(2).unwrap().owner, MeterOwner::Port(4));
    }

    #[test]
    fn admit_assigns_fresh_meters() {
        let p = RateParams::default();
        let mut l = SwitchLedger::new(SwitchId(1));
        l.ensure_port_meter(1, 5000);

        let a = l.admit(mac(1), 1, 10_000, CAP, &p).unwrap();
        assert_eq!(a.meter_id, 2);
        assert_eq!(a.rate, 10_000);
        assert!(a.changed.is_empty());
        assert_eq!(l.meter_of(&mac(1)), Some(2));

        assert!(l.admit(mac(1), 1, 10_000, CAP, &p).is_none());
        assert_eq!(l.meters().count(), 2);
    }

    #[test]
    fn admit_reports_changed_neighbours() {
        let p = RateParams::default();
        let mut l = SwitchLedger::new(SwitchId(1));
        l.admit(mac(1), 1, 30_000, CAP, &p).unwrap();
        l.admit(mac(2), 1, 5_000, CAP, &p).unwrap();

        // 30000 + 5000 + 30000 >= 40000: the port becomes congested.
        let a = l.admit(mac(3), 1, 30_000, CAP, &p).unwrap();
        let port = l.port(1).unwrap();
        assert_eq!(port.allocated.keys().collect::<Vec<_>>(), port.requested.keys().collect::<Vec<_>>());
        assert_eq!(port.allocated.values().sum::<u64>(), CAP);
        assert_eq!(a.rate, port.allocated[&mac(3)]);

        // source 2 was granted 5000 and still is; only source 1 moved.
        assert_eq!(
            a.changed,
            vec![RateChange {
                src: mac(1),
                meter_id: 1,
                rate: port.allocated[&mac(1)],
            }]
        );
        assert_eq!(l.meter(1).unwrap().rate, port.allocated[&mac(1)]);
    }

    #[test]
    fn samples_feed_usage() {
        let p = RateParams::default();
        let mut l = SwitchLedger::new(SwitchId(1));
        l.ensure_port_meter(1, 5000);
        l.admit(mac(1), 1, 30_000, CAP, &p).unwrap();
        l.admit(mac(2), 1, 30_000, CAP, &p).unwrap();
        // both capped at 20000 each
        assert_eq!(l.port(1).unwrap().allocated[&mac(1)], 20_000);

        // 15000 kbps over 5s = 9_375_000 bytes: 0.75 of the share
        match l.record_sample(2, 9_375_000, SECS, 0.7, 1.5) {
            Sample::Source { saturated, speed, .. } => {
                assert!(saturated);
                assert!((speed - 15_000.0).abs() < 1e-6);
            }
            s => panic!("unexpected sample {:?}", s),
        }
        let port = l.port(1).unwrap();
        assert_eq!(port.used[&mac(1)], 15_000);
        assert_eq!(port.used_adjusted[&mac(1)], 22_500);

        // same counter again: no traffic in the interval
        match l.record_sample(2, 9_375_000, SECS, 0.7, 1.5) {
            Sample::Source { saturated, .. } => assert!(!saturated),
            s => panic!("unexpected sample {:?}", s),
        }
        assert_eq!(l.port(1).unwrap().used_adjusted[&mac(1)], 0);

        assert_eq!(
            l.record_sample(1, 1_000, SECS, 0.7, 1.5),
            Sample::Port {
                port: 1,
                speed: speed_kbps(1_000, SECS)
            }
        );
        assert_eq!(l.record_sample(99, 1_000, SECS, 0.7, 1.5), Sample::UnknownMeter);
    }

    #[test]
    fn uncapped_source_never_saturates() {
        let p = RateParams::default();
        let mut l = SwitchLedger::new(SwitchId(1));
        l.admit(mac(1), 1, 10_000, CAP, &p).unwrap();
        // full use of an uncapped allocation does not trigger feedback
        match l.record_sample(1, 6_250_000, SECS, 0.7, 1.5) {
            Sample::Source { saturated, .. } => assert!(!saturated),
            s => panic!("unexpected sample {:?}", s),
        }
        assert_eq!(l.port(1).unwrap().used_adjusted[&mac(1)], 10_000);
    }

    #[test]
    fn reallocate_unknown_port() {
        let p = RateParams::default();
        let mut l = SwitchLedger::new(SwitchId(1));
        assert!(l.reallocate(9, CAP, &p).is_empty());
    }

    #[test]
    fn counter_reset_is_not_negative() {
        let p = RateParams::default();
        let mut l = SwitchLedger::new(SwitchId(1));
        l.admit(mac(1), 1, 10_000, CAP, &p).unwrap();
        l.record_sample(1, 5_000_000, SECS, 0.7, 1.5);
        l.record_sample(1, 10, SECS, 0.7, 1.5);
        assert_eq!(l.meter(1).unwrap().speed, 0.0);
        assert_eq!(l.meter(1).unwrap().prev_bytes, 10);
    }
}
