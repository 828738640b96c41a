//! Offline allocation calculator.
//!
//! Treats every subscriber in the table as sharing one port and prints what
//! each would be allocated, given optional usage measurements.

use fairmeter::rate::{allocate, RateMap};
use fairmeter::SubscriberTable;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> fairmeter::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (cfg, inputs) = fairmeter::algs::make_args("fairmeter-alloc")?;
    let subscribers = SubscriberTable::load(&inputs.subscribers)?;
    let requested: RateMap = subscribers.iter().map(|(m, r)| (*m, *r)).collect();
    let usage: RateMap = match inputs.usage {
        Some(ref path) => SubscriberTable::load(path)?
            .iter()
            .map(|(m, r)| (*m, *r))
            .collect(),
        None => RateMap::new(),
    };

    info!(
        subscribers = requested.len(),
        measured = usage.len(),
        capacity = cfg.capacity,
        "computing allocation"
    );

    let allocated = allocate(cfg.capacity, &requested, &usage, &cfg.rate_params());
    println!(
        "{:<17} {:>10} {:>10} {:>10}",
        "subscriber", "requested", "usage", "allocated"
    );
    for (src, req) in &requested {
        let used = usage
            .get(src)
            .map(|u| u.to_string())
            .unwrap_or_else(|| String::from("-"));
        println!(
            "{:<17} {:>10} {:>10} {:>10}",
            src.to_string(),
            req,
            used,
            allocated.get(src).copied().unwrap_or(0)
        );
    }

    println!(
        "{:<17} {:>10} {:>10} {:>10}",
        "total",
        requested.values().fold(0u64, |acc, &r| acc.saturating_add(r)),
        "",
        allocated.values().fold(0u64, |acc, &r| acc.saturating_add(r))
    );
    Ok(())
}
