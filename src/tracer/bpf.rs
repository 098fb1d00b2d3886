//! Hook loading, attachment and flow table polling.
//!
//! Implements [`FlowTable`] on top of aya. The hook object is loaded from a
//! file path at runtime; the kernel program itself is maintained out of tree.
//! All code is gated behind `#[cfg(feature = "bpf")]`.

use std::io;
use std::path::Path;

use anyhow::Result;
use aya::maps::hash_map::HashMap as BpfHashMap;
use aya::maps::MapData;
use aya::programs::tc::{qdisc_add_clsact, SchedClassifierLinkId, TcAttachType};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{SchedClassifier, Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader};
use tracing::{debug, info, warn};

use crate::config::HookConfig;

use super::event::{FlowKey, FlowRecord, FlowStats};
use super::{tc, AttachError, Direction, FlowTable, HookKind, PollError};

enum LinkHandle {
    Xdp(XdpLinkId),
    Tc(SchedClassifierLinkId),
}

/// aya-backed flow table for one interface.
pub struct BpfFlowTable {
    iface: String,
    kind: HookKind,
    direction: Direction,
    program: String,
    ebpf: Option<Ebpf>,
    flows: BpfHashMap<MapData, FlowKey, FlowStats>,
    links: Vec<LinkHandle>,
}

impl BpfFlowTable {
    /// Load the hook object for `kind`, attach it to `iface` and open its table.
    pub fn attach(
        iface: &str,
        kind: HookKind,
        direction: Direction,
        hook: &HookConfig,
    ) -> Result<Self, AttachError> {
        let (object, program) = hook.program(kind);

        let mut ebpf = load_object(object)?;

        let links = match kind {
            HookKind::Xdp => vec![LinkHandle::Xdp(attach_xdp(&mut ebpf, iface, program)?)],
            HookKind::Tc => attach_tc(&mut ebpf, iface, program, direction)?
                .into_iter()
                .map(LinkHandle::Tc)
                .collect(),
        };

        let map = ebpf
            .take_map(&hook.map)
            .ok_or_else(|| AttachError::MapNotFound(hook.map.clone()))?;
        let flows = BpfHashMap::<MapData, FlowKey, FlowStats>::try_from(map).map_err(|e| {
            AttachError::Load {
                path: object.to_path_buf(),
                source: Box::new(e),
            }
        })?;

        info!(
            interface = %iface,
            hook = %kind,
            direction = %direction,
            object = %object.display(),
            "hook attached",
        );

        Ok(Self {
            iface: iface.to_string(),
            kind,
            direction,
            program: program.to_string(),
            ebpf: Some(ebpf),
            flows,
            links,
        })
    }

    fn detach_links(&mut self) {
        let Some(ebpf) = self.ebpf.as_mut() else {
            return;
        };

        for link in self.links.drain(..) {
            let result = match link {
                LinkHandle::Xdp(id) => ebpf
                    .program_mut(&self.program)
                    .and_then(|p| <&mut Xdp>::try_from(p).ok())
                    .map(|p| p.detach(id)),
                LinkHandle::Tc(id) => ebpf
                    .program_mut(&self.program)
                    .and_then(|p| <&mut SchedClassifier>::try_from(p).ok())
                    .map(|p| p.detach(id)),
            };

            match result {
                Some(Ok(())) => debug!(interface = %self.iface, "hook link detached"),
                Some(Err(e)) => {
                    debug!(interface = %self.iface, error = %e, "hook link already gone");
                }
                None => {
                    warn!(interface = %self.iface, program = %self.program, "program missing on detach");
                }
            }
        }
    }
}

impl FlowTable for BpfFlowTable {
    fn interface(&self) -> &str {
        &self.iface
    }

    fn poll(&mut self, out: &mut Vec<FlowRecord>) -> Result<(), PollError> {
        for item in self.flows.iter() {
            match item {
                Ok((key, stats)) => out.push(FlowRecord::new(key, stats)),
                Err(e) => {
                    return Err(PollError::Iteration {
                        iface: self.iface.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.ebpf.is_none() {
            return Ok(());
        }

        self.detach_links();

        if self.kind == HookKind::Tc {
            tc::cleanup(&self.iface, self.direction);
        }

        // Dropping the object closes the program and map descriptors.
        self.ebpf = None;

        info!(interface = %self.iface, hook = %self.kind, "hook released");
        Ok(())
    }
}

impl Drop for BpfFlowTable {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(interface = %self.iface, error = %e, "releasing hook on drop");
        }
    }
}

fn load_object(path: &Path) -> Result<Ebpf, AttachError> {
    EbpfLoader::new()
        .load_file(path)
        .map_err(|e| AttachError::Load {
            path: path.to_path_buf(),
            source: Box::new(e),
        })
}

fn attach_xdp(ebpf: &mut Ebpf, iface: &str, name: &str) -> Result<XdpLinkId, AttachError> {
    let attach_err = |e: aya::programs::ProgramError| AttachError::Attach {
        iface: iface.to_string(),
        kind: HookKind::Xdp,
        source: Box::new(e),
    };

    let program: &mut Xdp = ebpf
        .program_mut(name)
        .ok_or_else(|| AttachError::ProgramNotFound(name.to_string()))?
        .try_into()
        .map_err(attach_err)?;
    program.load().map_err(attach_err)?;

    match program.attach(iface, XdpFlags::default()) {
        Ok(id) => Ok(id),
        Err(e) => {
            warn!(interface = %iface, error = %e, "default XDP mode failed, trying SKB mode");
            program.attach(iface, XdpFlags::SKB_MODE).map_err(attach_err)
        }
    }
}

fn attach_tc(
    ebpf: &mut Ebpf,
    iface: &str,
    name: &str,
    direction: Direction,
) -> Result<Vec<SchedClassifierLinkId>, AttachError> {
    let attach_err = |e: Box<dyn std::error::Error + Send + Sync>| AttachError::Attach {
        iface: iface.to_string(),
        kind: HookKind::Tc,
        source: e,
    };

    // Leftovers from an earlier run would shadow the new filter.
    tc::cleanup(iface, direction);

    match qdisc_add_clsact(iface) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(interface = %iface, "clsact qdisc already present");
        }
        Err(e) => return Err(attach_err(Box::new(e))),
    }

    let program: &mut SchedClassifier = ebpf
        .program_mut(name)
        .ok_or_else(|| AttachError::ProgramNotFound(name.to_string()))?
        .try_into()
        .map_err(|e| attach_err(Box::new(e)))?;
    program.load().map_err(|e| attach_err(Box::new(e)))?;

    let mut links = Vec::with_capacity(2);
    for side in direction.sides() {
        let attach_type = match side {
            Direction::Egress => TcAttachType::Egress,
            _ => TcAttachType::Ingress,
        };
        let id = program
            .attach(iface, attach_type)
            .map_err(|e| attach_err(Box::new(e)))?;
        links.push(id);
    }

    Ok(links)
}
