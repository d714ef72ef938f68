//! Subnet scan: probe every candidate host and collect the identities

use crate::fanout;
use crate::probe::{probe, ProbeError, ProbeOptions, ProbeOutcome};
use crate::registry::{DeviceRecord, Registry};
use crate::transport::DeviceTransport;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Instant;
use tracing::{error, info, warn};

/// Inclusive range of host suffixes to probe inside the subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRange {
    pub first: u32,
    pub last: u32,
}

impl Default for HostRange {
    fn default() -> Self {
        Self { first: 2, last: 63 }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub prefix_len: u8,
    pub range: HostRange,
    /// Ceiling on probes in flight at once
    pub concurrency: usize,
    pub probe: ProbeOptions,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            prefix_len: 24,
            range: HostRange::default(),
            concurrency: 64,
            probe: ProbeOptions::default(),
        }
    }
}

fn netmask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len if len >= 32 => u32::MAX,
        len => u32::MAX << (32 - u32::from(len)),
    }
}

/// Network address of `address` for the given prefix
pub fn subnet_of(address: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address) & netmask(prefix_len))
}

/// One address per suffix of `range` inside the subnet of `local`.
///
/// Suffix 0 (the network address) and suffixes at or past the broadcast
/// address are skipped.
pub fn candidate_addresses(local: Ipv4Addr, prefix_len: u8, range: HostRange) -> Vec<Ipv4Addr> {
    let mask = netmask(prefix_len);
    let network = u32::from(local) & mask;
    let broadcast_suffix = !mask;

    let mut candidates = Vec::new();
    for suffix in range.first..=range.last {
        if suffix == 0 || suffix >= broadcast_suffix {
            warn!(suffix, prefix_len, "host suffix outside the subnet, skipped");
            continue;
        }
        candidates.push(Ipv4Addr::from(network | suffix));
    }
    candidates
}

async fn probe_candidate<T: DeviceTransport>(
    transport: &T,
    address: Ipv4Addr,
    options: &ProbeOptions,
) -> (Ipv4Addr, Result<ProbeOutcome, ProbeError>) {
    (address, probe(transport, address, options).await)
}

/// Probes the subnet of `local` and returns a fresh registry.
///
/// An empty registry is a normal result. A probe that fails unexpectedly
/// is logged and left out; it never aborts the scan.
pub async fn scan<T: DeviceTransport>(transport: &T, local: Ipv4Addr, options: &ScanOptions) -> Registry {
    let started = Instant::now();
    let candidates = candidate_addresses(local, options.prefix_len, options.range);
    info!(
        subnet = %subnet_of(local, options.prefix_len),
        prefix_len = options.prefix_len,
        candidates = candidates.len(),
        concurrency = options.concurrency,
        "Scanning attached devices"
    );

    let outcomes = fanout::bounded(candidates, options.concurrency, |address| {
        probe_candidate(transport, address, &options.probe)
    })
    .await;

    let mut registry = Registry::new();
    for (address, outcome) in outcomes {
        match outcome {
            Ok(ProbeOutcome::Found { id, address }) => {
                if let Some(previous) = registry.insert(DeviceRecord::new(id.clone(), address)) {
                    warn!(
                        device_id = %id,
                        ip = %address,
                        previous_ip = %previous.ip,
                        "two addresses reported the same id, keeping the later one"
                    );
                }
            }
            Ok(ProbeOutcome::Absent { .. }) => {}
            Err(e) => {
                error!(ip = %address, phase = "scan", error = %e, "Error whilst pinging url");
            }
        }
    }

    if registry.is_empty() {
        warn!(elapsed_ms = started.elapsed().as_millis() as u64, "No device detected");
    } else {
        info!(
            count = registry.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            devices = ?registry.sorted_ids(),
            "DEVICE ID -> detected devices"
        );
    }
    registry
}
