//! Helper methods for making controller binaries.

use std::path::PathBuf;

use clap::{App, Arg, ArgMatches};

use crate::config::QosConfig;
use crate::types::Kbps;
use crate::{Error, Result};

// Must take a String so that clap::Args::validator will be happy
#[allow(clippy::needless_pass_by_value)]
/// Validator for arguments that must be a positive integer.
pub fn positive_int_valid(v: String) -> std::result::Result<(), String> {
    match v.parse::<u64>() {
        Ok(n) if n > 0 => Ok(()),
        _ => Err(format!("must be a positive integer: {:?}", v)),
    }
}

#[allow(clippy::needless_pass_by_value)]
/// Validator for the amplification factor, a number no smaller than 1.
pub fn factor_valid(v: String) -> std::result::Result<(), String> {
    match v.parse::<f64>() {
        Ok(f) if f >= 1.0 && f.is_finite() => Ok(()),
        _ => Err(format!("must be a number >= 1: {:?}", v)),
    }
}

/// Arguments of the offline allocation calculator: the inputs plus the
/// tunables `allocate` reads.
///
/// Defaults match [`QosConfig::default`].
pub fn make_app<'a, 'b>(name: &'a str) -> App<'a, 'b> {
    App::new(name)
        .version(env!("CARGO_PKG_VERSION"))
        .about("Per-port fair-share metering of provisioned subscribers")
        .arg(Arg::with_name("subscribers")
             .long("subscribers")
             .short("s")
             .help("JSON file mapping subscriber MAC addresses to contracted rates, in kbps")
             .takes_value(true)
             .required(true))
        .arg(Arg::with_name("usage")
             .long("usage")
             .short("u")
             .help("JSON file mapping MAC addresses to measured usage, in kbps")
             .takes_value(true))
        .arg(Arg::with_name("capacity")
             .long("capacity")
             .help("Sets the per-port capacity, in kbps")
             .default_value("40000")
             .validator(positive_int_valid))
        .arg(Arg::with_name("baseline")
             .long("baseline")
             .help("Sets the default port meter rate and the demand floor, in kbps")
             .default_value("5000")
             .validator(positive_int_valid))
        .arg(Arg::with_name("amplification")
             .long("amplification")
             .help("Factor applied to the usage of saturated subscribers")
             .default_value("1.5")
             .validator(factor_valid))
}

fn parse<T: std::str::FromStr>(matches: &ArgMatches<'_>, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let v = matches
        .value_of(name)
        .ok_or_else(|| Error(format!("missing argument {}", name)))?;
    v.parse::<T>()
        .map_err(|e| Error(format!("invalid {} {:?}: {}", name, v, e)))
}

/// Build a [`QosConfig`] from parsed arguments. Tunables without an
/// argument keep their defaults.
pub fn config_from_matches(matches: &ArgMatches<'_>) -> Result<QosConfig> {
    let cfg = QosConfig {
        capacity: parse::<Kbps>(matches, "capacity")?,
        baseline: parse::<Kbps>(matches, "baseline")?,
        amplification: parse(matches, "amplification")?,
        ..QosConfig::default()
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Paths named on the command line.
#[derive(Clone, Debug, PartialEq)]
pub struct Inputs {
    pub subscribers: PathBuf,
    pub usage: Option<PathBuf>,
}

pub fn inputs_from_matches(matches: &ArgMatches<'_>) -> Result<Inputs> {
    let subscribers = matches
        .value_of("subscribers")
        .map(PathBuf::from)
        .ok_or_else(|| Error(String::from("missing argument subscribers")))?;
    Ok(Inputs {
        subscribers,
        usage: matches.value_of("usage").map(PathBuf::from),
    })
}

/// Parse the process arguments.
pub fn make_args(name: &str) -> Result<(QosConfig, Inputs)> {
    let matches = make_app(name).get_matches();
    Ok((config_from_matches(&matches)?, inputs_from_matches(&matches)?))
}
