//! Isolated-CPU discovery for the realtime substrate.
//!
//! On realtime kernels the worker CPUs are carved out of the general
//! scheduler with `isolcpus=` and published by sysfs as a cpulist: a single
//! line of comma-separated tokens, each a decimal CPU index or an inclusive
//! `start-end` range (`1-3,5,7`). The list is read once per process and the
//! pool maps logical worker slots onto it in order.

use std::fs;
use std::io;
use thiserror::Error;

const ISOLATED_CPUS_PATH: &str = "/sys/devices/system/cpu/isolated";

lazy_static::lazy_static! {
    static ref ISOLATED_CPUS: Option<Vec<usize>> = match read_isolated_cpus() {
        Ok(cpus) => {
            log::debug!("isolated cpus: {cpus:?}");
            Some(cpus)
        }
        Err(err) => {
            log::debug!("no isolated cpu list: {err}");
            None
        }
    };
}

/// The CPUs the kernel has isolated for realtime use, in ascending sysfs
/// order. `None` when the list is absent or empty.
pub fn isolated_cpus() -> Option<&'static [usize]> {
    match ISOLATED_CPUS.as_deref() {
        Some([]) | None => None,
        Some(cpus) => Some(cpus),
    }
}

fn read_isolated_cpus() -> io::Result<Vec<usize>> {
    let text = fs::read_to_string(ISOLATED_CPUS_PATH)?;
    parse_cpu_list(text.trim()).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Parsing failure for a cpulist string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CpuListError {
    #[error("invalid cpulist token '{0}'")]
    InvalidToken(String),
    #[error("descending cpulist range '{0}'")]
    DescendingRange(String),
}

/// Parses a cpulist (`1-3,5,7`). An empty string parses to an empty list;
/// anything but bare decimals and inclusive ranges is rejected.
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>, CpuListError> {
    if list.is_empty() {
        return Ok(Vec::new());
    }
    let mut cpus = Vec::new();
    for token in list.split(',') {
        match token.split_once('-') {
            None => cpus.push(parse_index(token)?),
            Some((start, end)) => {
                let start = parse_index(start)?;
                let end = parse_index(end)?;
                if start > end {
                    return Err(CpuListError::DescendingRange(token.to_string()));
                }
                cpus.extend(start..=end);
            }
        }
    }
    Ok(cpus)
}

fn parse_index(token: &str) -> Result<usize, CpuListError> {
    // `usize::parse` would accept a leading '+', which no kernel emits.
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CpuListError::InvalidToken(token.to_string()));
    }
    token
        .parse()
        .map_err(|_| CpuListError::InvalidToken(token.to_string()))
}
