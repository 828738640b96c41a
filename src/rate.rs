//! Fair-share rate control for the subscribers of one ingress port.
//!
//! [`allocate`] is a pure function of its inputs. All maps are ordered by
//! source address, so the walk order (and therefore every tie-break) is fixed.

use std::collections::BTreeMap;

use crate::types::{Kbps, MacAddr};

/// Source address to rate.
pub type RateMap = BTreeMap<MacAddr, Kbps>;

/// Parameters of the demand estimate used when a port is congested.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateParams {
    /// Demand floor; also the rate of a port's default meter.
    pub baseline: Kbps,
    /// Factor applied to a usage sample to project near-future demand.
    pub amplification: f64,
}

impl Default for RateParams {
    fn default() -> Self {
        RateParams {
            baseline: 5000,
            amplification: 1.5,
        }
    }
}

/// Split `capacity` among the sources in `requested`.
///
/// If the port is uncongested (`sum(requested) < capacity`) everybody gets
/// exactly what they asked for. Otherwise each source is given an equal share
/// capped by its demand estimate, and the unused part of the equal shares is
/// water-filled, one kbps at a time, into sources still below their original
/// request. Surplus that no source can absorb stays unassigned.
pub fn allocate(capacity: Kbps, requested: &RateMap, usage: &RateMap, params: &RateParams) -> RateMap {
    if requested.is_empty() {
        return RateMap::new();
    }

    let total = requested.values().fold(0 as Kbps, |acc, &r| acc.saturating_add(r));
    if total < capacity {
        return requested.clone();
    }

    let demand = estimate_demand(requested, usage, params);

    let n = requested.len() as Kbps;
    let share = capacity / n;
    let mut surplus = capacity % n;

    let mut allocated = RateMap::new();
    for (src, &d) in &demand {
        if share > d {
            allocated.insert(*src, d);
            surplus = surplus.saturating_add(share - d);
        } else {
            allocated.insert(*src, share);
        }
    }

    water_fill(requested, &mut allocated, surplus);
    allocated
}

/// `min(requested, usage * amplification)`, floored at the baseline. A source
/// with no usage sample is assumed to be using half of its request.
fn estimate_demand(requested: &RateMap, usage: &RateMap, params: &RateParams) -> RateMap {
    requested
        .iter()
        .map(|(src, &req)| {
            let used = usage
                .get(src)
                .map(|&u| u as f64)
                .unwrap_or(req as f64 * 0.5);
            let projected = (used * params.amplification) as Kbps;
            (*src, projected.min(req).max(params.baseline))
        })
        .collect()
}

fn gap(requested: &RateMap, allocated: &RateMap, src: &MacAddr) -> Kbps {
    let req = requested.get(src).copied().unwrap_or(0);
    let alloc = allocated.get(src).copied().unwrap_or(0);
    req.saturating_sub(alloc)
}

// Needy sources are the ones below their original request. While there are
// fewer needy sources than surplus units, every needy source gets one unit per
// round; several rounds are applied at once as long as no source reaches its
// request in between. Once the surplus no longer covers a full round, units go
// one by one to the largest gap, lowest address first on ties.
fn water_fill(requested: &RateMap, allocated: &mut RateMap, mut surplus: Kbps) {
    while surplus > 0 {
        let needy: Vec<(MacAddr, Kbps)> = allocated
            .keys()
            .map(|src| (*src, gap(requested, allocated, src)))
            .filter(|&(_, g)| g > 0)
            .collect();

        if needy.is_empty() {
            break;
        }

        let count = needy.len() as Kbps;
        if count < surplus {
            let min_gap = needy.iter().map(|&(_, g)| g).min().unwrap_or(0);
            let rounds = min_gap.min((surplus - 1) / count);
            for (src, _) in &needy {
                if let Some(a) = allocated.get_mut(src) {
                    *a += rounds;
                }
            }
            surplus -= rounds * count;
        } else {
            let mut best: Option<(MacAddr, Kbps)> = None;
            for &(src, g) in &needy {
                match best {
                    Some((_, best_gap)) if best_gap >= g => {}
                    _ => best = Some((src, g)),
                }
            }

            if let Some((src, _)) = best {
                if let Some(a) = allocated.get_mut(&src) {
                    *a += 1;
                }
            }
            surplus -= 1;
        }
    }
}
