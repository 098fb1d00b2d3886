pub mod event;
pub mod iface;
pub mod tc;

#[cfg(all(feature = "bpf", target_os = "linux"))]
pub mod bpf;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::config::HookConfig;

use self::event::FlowRecord;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Kernel attachment point for the flow-counting program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Earliest receive point, ingress only.
    Xdp,
    /// clsact traffic-control hook, either direction.
    Tc,
}

impl HookKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Xdp => "xdp",
            Self::Tc => "tc",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic direction observed by the hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ingress,
    Egress,
    Both,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
            Self::Both => "both",
        }
    }

    /// Individual clsact sides covered by this direction.
    pub fn sides(self) -> &'static [Direction] {
        match self {
            Self::Ingress => &[Direction::Ingress],
            Self::Egress => &[Direction::Egress],
            Self::Both => &[Direction::Ingress, Direction::Egress],
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingress" => Ok(Self::Ingress),
            "egress" => Ok(Self::Egress),
            "both" => Ok(Self::Both),
            other => Err(format!("invalid direction: {other} (expected ingress, egress, both)")),
        }
    }
}

/// Hook attachment failures.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("network interface {0} does not exist")]
    InterfaceNotFound(String),

    #[error("loading hook object {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("program {0} not found in hook object")]
    ProgramNotFound(String),

    #[error("map {0} not found in hook object")]
    MapNotFound(String),

    #[error("attaching {kind} hook on {iface}: {source}")]
    Attach {
        iface: String,
        kind: HookKind,
        #[source]
        source: BoxError,
    },

    #[error("built without eBPF support")]
    Unsupported,
}

/// Table iteration failure. Records already yielded stay valid.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("iterating flow table on {iface}: {source}")]
    Iteration {
        iface: String,
        #[source]
        source: BoxError,
    },
}

/// Handle to an attached hook and its per-flow counter table.
pub trait FlowTable: Send {
    /// Interface the hook is attached to.
    fn interface(&self) -> &str;

    /// Append a snapshot of every table record to `out`.
    fn poll(&mut self, out: &mut Vec<FlowRecord>) -> Result<(), PollError>;

    /// Detach the hook and remove any traffic-control state. Safe to call twice.
    fn release(&mut self) -> anyhow::Result<()>;
}

/// Hook kind that can actually observe `direction`. XDP only sees ingress.
pub fn effective_hook(kind: HookKind, direction: Direction) -> HookKind {
    match (kind, direction) {
        (HookKind::Xdp, Direction::Egress | Direction::Both) => HookKind::Tc,
        (kind, _) => kind,
    }
}

/// Attach the configured hook to `iface` and return its table handle.
pub fn attach(
    iface: &str,
    kind: HookKind,
    direction: Direction,
    hook: &HookConfig,
) -> Result<Box<dyn FlowTable>, AttachError> {
    if !iface::interface_exists(iface) {
        return Err(AttachError::InterfaceNotFound(iface.to_string()));
    }

    let kind = effective_hook(kind, direction);

    #[cfg(all(feature = "bpf", target_os = "linux"))]
    {
        let table = bpf::BpfFlowTable::attach(iface, kind, direction, hook)?;
        Ok(Box::new(table))
    }

    #[cfg(not(all(feature = "bpf", target_os = "linux")))]
    {
        let _ = (kind, direction, hook);
        Err(AttachError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parse() {
        assert_eq!("ingress".parse::<Direction>(), Ok(Direction::Ingress));
        assert_eq!(" Egress ".parse::<Direction>(), Ok(Direction::Egress));
        assert_eq!("both".parse::<Direction>(), Ok(Direction::Both));
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_xdp_egress_uses_tc() {
        assert_eq!(effective_hook(HookKind::Xdp, Direction::Ingress), HookKind::Xdp);
        assert_eq!(effective_hook(HookKind::Xdp, Direction::Egress), HookKind::Tc);
        assert_eq!(effective_hook(HookKind::Xdp, Direction::Both), HookKind::Tc);
        assert_eq!(effective_hook(HookKind::Tc, Direction::Ingress), HookKind::Tc);
    }

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Ingress.sides(), &[Direction::Ingress]);
        assert_eq!(
            Direction::Both.sides(),
            &[Direction::Ingress, Direction::Egress]
        );
    }

    #[test]
    fn test_attach_missing_interface() {
        let err = attach(
            "xtrace-test-missing0",
            HookKind::Xdp,
            Direction::Ingress,
            &HookConfig::default(),
        )
        .err()
        .expect("attach must fail");
        assert!(matches!(err, AttachError::InterfaceNotFound(_)));
        assert!(err.to_string().contains("xtrace-test-missing0"));
    }
}
