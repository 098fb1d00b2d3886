//! Traffic-control state cleanup through the `tc` command.
//!
//! Removal is idempotent: a missing filter or qdisc counts as success, since
//! a previous run may have died halfway through setup.

use std::process::{Command, Stdio};

use tracing::debug;

use super::Direction;

/// Arguments deleting every filter on one clsact side.
pub fn filter_del_args(iface: &str, side: Direction) -> Vec<String> {
    vec![
        "filter".to_string(),
        "del".to_string(),
        "dev".to_string(),
        iface.to_string(),
        side.as_str().to_string(),
    ]
}

/// Arguments deleting the clsact qdisc.
pub fn qdisc_del_args(iface: &str) -> Vec<String> {
    vec![
        "qdisc".to_string(),
        "del".to_string(),
        "dev".to_string(),
        iface.to_string(),
        "clsact".to_string(),
    ]
}

/// Remove filters for `direction` and the clsact qdisc from `iface`.
pub fn cleanup(iface: &str, direction: Direction) {
    for side in direction.sides() {
        run_tc(iface, &filter_del_args(iface, *side));
    }
    run_tc(iface, &qdisc_del_args(iface));
}

fn run_tc(iface: &str, args: &[String]) {
    let result = Command::new("tc")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match result {
        Ok(status) if status.success() => {
            debug!(interface = %iface, args = ?args, "tc cleanup applied");
        }
        Ok(status) => {
            debug!(interface = %iface, args = ?args, %status, "tc cleanup: nothing to remove");
        }
        Err(e) => {
            debug!(interface = %iface, error = %e, "tc command unavailable");
        }
    }
}
