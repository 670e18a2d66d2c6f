//! Mirror port collector and paired decoder.

use std::collections::{BTreeMap, BTreeSet};

use ovn_db::{RowId, Smap};
use ovn_inc_common::{EngineNode, EngineResult, NodeState};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::types::{
    sync_sb_type, MirrorCookie, PairedDecodeInput, PortBindingKind, PortCollectorInput,
    PortCookie, UnpairedPortBinding, UnpairedPortBindingMap,
};

/// `Mirror` type whose sink is another logical switch port.
pub const MIRROR_TYPE_LPORT: &str = "lport";

/// Returns the name of the mirror port of `sink` on `datapath`.
pub fn mirror_port_name(datapath: &str, sink: &str) -> String {
    format!("mp-{datapath}-{sink}")
}

/// Collects one mirror port per `lport` mirror rule whose sink exists.
#[derive(Debug)]
pub struct PortBindingMirror {
    map: UnpairedPortBindingMap,
}

impl Default for PortBindingMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl PortBindingMirror {
    pub fn new() -> Self {
        Self {
            map: UnpairedPortBindingMap::with_default_callbacks(PortBindingKind::Mirror),
        }
    }

    pub fn map(&self) -> &UnpairedPortBindingMap {
        &self.map
    }
}

impl EngineNode for PortBindingMirror {
    type Input<'a> = PortCollectorInput<'a>;

    fn name(&self) -> &'static str {
        "port_binding_mirror"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let PortCollectorInput { nb, switches, .. } = input;
        let mut map = UnpairedPortBindingMap::with_default_callbacks(PortBindingKind::Mirror);

        let mut all_switch_ports = BTreeSet::new();
        for switch in switches.iter() {
            let ls = nb.logical_switches.try_get(&switch.nb_uuid)?;
            all_switch_ports.extend(nb.switch_ports(ls).map(|(_, lsp)| lsp.name.as_str()));
        }

        for switch in switches.iter() {
            let ls = nb.logical_switches.try_get(&switch.nb_uuid)?;
            for (lsp_row, lsp) in nb.switch_ports(ls) {
                let lport_mirrors = lsp
                    .mirror_rules
                    .iter()
                    .filter_map(|id| nb.mirrors.get(id))
                    .filter(|m| m.mirror_type == MIRROR_TYPE_LPORT)
                    .filter(|m| all_switch_ports.contains(m.sink.as_str()));

                for mirror in lport_mirrors {
                    map.add_once(UnpairedPortBinding {
                        name: mirror_port_name(&switch.name, &mirror.sink),
                        kind: PortBindingKind::Mirror,
                        requested_tunnel_key: 0,
                        external_ids: Smap::new(),
                        cookie: PortCookie::Mirror(MirrorCookie {
                            lsp: lsp_row,
                            sink: mirror.sink.clone(),
                            switch: switch.nb_uuid,
                        }),
                        sb_datapath: switch.sb_row,
                        dp_tunnel_key: switch.tunnel_key,
                    });
                }
            }
        }

        debug!(ports = map.len(), "collected mirror ports");
        if map == self.map {
            return Ok(NodeState::Unchanged);
        }
        self.map = map;
        Ok(NodeState::Updated)
    }

    fn cleanup(&mut self) {
        self.map.clear();
    }
}

/// A mirror port bound to its southbound row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedMirrorPort {
    pub name: String,
    pub sink: String,
    /// The mirrored `Logical_Switch_Port` row.
    pub lsp: RowId,
    pub switch: Uuid,
    pub sb_row: RowId,
    pub tunnel_key: u32,
}

/// Paired mirror ports keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PairedMirrorPorts {
    pub ports: BTreeMap<String, PairedMirrorPort>,
}

impl PairedMirrorPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PairedMirrorPort> {
        self.ports.get(name)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl EngineNode for PairedMirrorPorts {
    type Input<'a> = PairedDecodeInput<'a>;

    fn name(&self) -> &'static str {
        "port_binding_paired_mirror"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let mut ports = BTreeMap::new();
        for ppb in input.paired.of_kind(PortBindingKind::Mirror) {
            let PortCookie::Mirror(cookie) = &ppb.cookie else {
                continue;
            };
            sync_sb_type(input.sb, ppb)?;
            ports.insert(
                ppb.name.clone(),
                PairedMirrorPort {
                    name: ppb.name.clone(),
                    sink: cookie.sink.clone(),
                    lsp: cookie.lsp,
                    switch: cookie.switch,
                    sb_row: ppb.sb_row,
                    tunnel_key: ppb.tunnel_key,
                },
            );
        }

        if ports == self.ports {
            return Ok(NodeState::Unchanged);
        }
        self.ports = ports;
        Ok(NodeState::Updated)
    }

    fn cleanup(&mut self) {
        self.ports.clear();
    }
}
