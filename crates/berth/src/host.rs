//! Registering the local host as a node.

use berth_core::{Node, NodeResources};
use miette::miette;

/// How much of the host to hold back for system daemons
#[derive(Debug, Clone, Copy, Default)]
pub struct Reservation {
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    pub storage_bytes: i64,
}

/// Detect the host's CPU count, memory and disk size.
///
/// Uses the `sys_info` crate, which supports illumos, Linux and macOS.
pub fn detect_capacity() -> miette::Result<NodeResources> {
    let cpu_count =
        sys_info::cpu_num().map_err(|e| miette!("failed to detect CPU count: {e}"))?;
    let mem = sys_info::mem_info().map_err(|e| miette!("failed to detect memory: {e}"))?;
    let disk = sys_info::disk_info().map_err(|e| miette!("failed to detect disk size: {e}"))?;

    // mem_info and disk_info report KiB
    Ok(NodeResources::new(
        cpu_count as i64 * 1000,
        (mem.total as i64).saturating_mul(1024),
        (disk.total as i64).saturating_mul(1024),
    ))
}

/// Capacity left after the reservation, never negative
pub fn apply_reservation(capacity: NodeResources, reservation: &Reservation) -> NodeResources {
    capacity.saturating_sub(&NodeResources::new(
        reservation.cpu_millicores,
        reservation.memory_bytes,
        reservation.storage_bytes,
    ))
}

/// Build the node record for this host. Labels are `key=value` strings.
pub fn host_node(name: &str, reservation: &Reservation, labels: &[String]) -> miette::Result<Node> {
    let capacity = apply_reservation(detect_capacity()?, reservation);

    let labels = labels
        .iter()
        .map(|label| {
            label
                .split_once('=')
                .ok_or_else(|| miette!("invalid node label '{label}', expected key=value"))
        })
        .collect::<miette::Result<Vec<_>>>()?;

    Ok(Node::new(name, capacity).with_labels(labels))
}
