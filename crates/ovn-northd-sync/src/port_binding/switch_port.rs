//! Logical switch port collector and paired decoder.

use std::collections::BTreeMap;
use std::sync::Arc;

use ovn_db::sb::PortBinding;
use ovn_db::{RowId, SmapExt};
use ovn_inc_common::{warn_rl, EngineNode, EngineResult, NodeState, RateLimiter};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::types::{
    sync_sb_type, PairedDecodeInput, PortBindingKind, PortCollectorInput, PortCookie,
    SwitchPortCookie, UnpairedMapCallbacks, UnpairedPortBinding, UnpairedPortBindingMap,
};
use crate::tnlid::requested_tunnel_key;

/// Southbound `type` of a switch port of the given northbound type.
pub fn switch_port_sb_type(lsp_type: &str) -> &str {
    match lsp_type {
        "router" => "patch",
        other => other,
    }
}

/// Rejects a row whose type no longer matches the northbound port; such a
/// row is deleted and recreated.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchPortCallbacks;

impl UnpairedMapCallbacks for SwitchPortCallbacks {
    fn sb_is_valid(&self, sb: &PortBinding, upb: &UnpairedPortBinding) -> bool {
        match &upb.cookie {
            PortCookie::SwitchPort(cookie) => sb.port_type == cookie.sb_type,
            _ => true,
        }
    }
}

/// Collects one unpaired port per port of every synced switch.
#[derive(Debug)]
pub struct PortBindingSwitchPort {
    map: UnpairedPortBindingMap,
    duplicate_rl: RateLimiter,
}

impl Default for PortBindingSwitchPort {
    fn default() -> Self {
        Self::new()
    }
}

impl PortBindingSwitchPort {
    pub fn new() -> Self {
        Self {
            map: Self::empty_map(),
            duplicate_rl: RateLimiter::new(1, 5),
        }
    }

    fn empty_map() -> UnpairedPortBindingMap {
        UnpairedPortBindingMap::new(PortBindingKind::SwitchPort, Arc::new(SwitchPortCallbacks))
    }

    pub fn map(&self) -> &UnpairedPortBindingMap {
        &self.map
    }
}

impl EngineNode for PortBindingSwitchPort {
    type Input<'a> = PortCollectorInput<'a>;

    fn name(&self) -> &'static str {
        "port_binding_logical_switch_port"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let mut map = Self::empty_map();

        for switch in input.switches.iter() {
            let ls = input.nb.logical_switches.try_get(&switch.nb_uuid)?;
            for (lsp_row, lsp) in input.nb.switch_ports(ls) {
                let mut external_ids = lsp.external_ids.clone();
                if let Some(name) = lsp.external_ids.get_nonempty("neutron:port_name") {
                    external_ids.insert("name".to_string(), name.to_string());
                }

                let upb = UnpairedPortBinding {
                    name: lsp.name.clone(),
                    kind: PortBindingKind::SwitchPort,
                    requested_tunnel_key: requested_tunnel_key(&lsp.options),
                    external_ids,
                    cookie: PortCookie::SwitchPort(SwitchPortCookie {
                        lsp: lsp_row,
                        switch: switch.nb_uuid,
                        sb_type: switch_port_sb_type(&lsp.port_type).to_string(),
                    }),
                    sb_datapath: switch.sb_row,
                    dp_tunnel_key: switch.tunnel_key,
                };
                if !map.add_once(upb) {
                    warn_rl!(self.duplicate_rl, "duplicate logical port {}", lsp.name);
                }
            }
        }

        debug!(ports = map.len(), "collected logical switch ports");
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

/// A switch port bound to its southbound row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedLogicalSwitchPort {
    pub name: String,
    /// The `Logical_Switch_Port` row.
    pub lsp: RowId,
    /// Northbound UUID of the owning switch.
    pub switch: Uuid,
    /// The `Port_Binding` row.
    pub sb_row: RowId,
    pub tunnel_key: u32,
}

/// Paired switch ports keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PairedLogicalSwitchPorts {
    pub ports: BTreeMap<String, PairedLogicalSwitchPort>,
}

impl PairedLogicalSwitchPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PairedLogicalSwitchPort> {
        self.ports.get(name)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl EngineNode for PairedLogicalSwitchPorts {
    type Input<'a> = PairedDecodeInput<'a>;

    fn name(&self) -> &'static str {
        "port_binding_paired_logical_switch_port"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let PairedDecodeInput { paired, nb, sb } = input;
        let mut ports = BTreeMap::new();

        for ppb in paired.of_kind(PortBindingKind::SwitchPort) {
            let PortCookie::SwitchPort(cookie) = &ppb.cookie else {
                continue;
            };
            sync_sb_type(sb, ppb)?;

            // A port deleted and re-added between two reads keeps its
            // binding but loses `up`.
            let sb_up = sb.port_bindings.try_get(&ppb.sb_row)?.up;
            let nb_up = nb.logical_switch_ports.try_get(&cookie.lsp)?.up;
            if sb_up == Some(true) && nb_up.is_none() {
                nb.logical_switch_ports
                    .update(&cookie.lsp, |lsp| lsp.up = Some(true))?;
            }

            ports.insert(
                ppb.name.clone(),
                PairedLogicalSwitchPort {
                    name: ppb.name.clone(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::{SyncedEntity, SyncedLogicalRouterMap, SyncedLogicalSwitchMap};
    use crate::port_binding::types::{PairedPortBinding, PairedPortBindings};
    use ovn_db::nb::{LogicalSwitch, LogicalSwitchPort};
    use ovn_db::{smap, NbDb, SbDb};
    use pretty_assertions::assert_eq;

    fn synced_switch(nb: &mut NbDb, ports: Vec<LogicalSwitchPort>) -> SyncedLogicalSwitchMap {
        let port_rows = ports
            .into_iter()
            .map(|lsp| nb.logical_switch_ports.insert(lsp))
            .collect();
        let ls = nb.logical_switches.insert(LogicalSwitch {
            name: "sw0".into(),
            ports: port_rows,
            ..Default::default()
        });
        let mut switches = SyncedLogicalSwitchMap::new();
        switches.entities.insert(
            ls,
            SyncedEntity {
                nb_uuid: ls,
                name: "sw0".into(),
                sb_row: Uuid::new_v4(),
                tunnel_key: 3,
            },
        );
        switches
    }

    #[test]
    fn test_collects_ports_of_synced_switches() {
        let mut nb = NbDb::new();
        let switches = synced_switch(
            &mut nb,
            vec![
                LogicalSwitchPort {
                    name: "vif".into(),
                    options: smap([("requested-tnl-key", "12")]),
                    external_ids: smap([("neutron:port_name", "web"), ("owner", "x")]),
                    ..Default::default()
                },
                LogicalSwitchPort {
                    name: "to-lr".into(),
                    port_type: "router".into(),
                    ..Default::default()
                },
            ],
        );
        let routers = SyncedLogicalRouterMap::new();

        let mut node = PortBindingSwitchPort::new();
        let input = PortCollectorInput {
            nb: &nb,
            switches: &switches,
            routers: &routers,
        };
        assert_eq!(node.run(input).unwrap(), NodeState::Updated);
        assert_eq!(node.run(input).unwrap(), NodeState::Unchanged);

        let vif = node.map().get("vif").unwrap();
        assert_eq!(vif.requested_tunnel_key, 12);
        assert_eq!(vif.dp_tunnel_key, 3);
        assert_eq!(
            vif.external_ids,
            smap([("neutron:port_name", "web"), ("owner", "x"), ("name", "web")])
        );
        assert_eq!(node.map().get("to-lr").unwrap().cookie.sb_type(), "patch");
    }

    #[test]
    fn test_duplicate_name_keeps_first() {
        let mut nb = NbDb::new();
        let switches = synced_switch(
            &mut nb,
            vec![
                LogicalSwitchPort {
                    name: "p".into(),
                    ..Default::default()
                },
                LogicalSwitchPort {
                    name: "p".into(),
                    port_type: "localnet".into(),
                    ..Default::default()
                },
            ],
        );
        let routers = SyncedLogicalRouterMap::new();

        let mut node = PortBindingSwitchPort::new();
        node.run(PortCollectorInput {
            nb: &nb,
            switches: &switches,
            routers: &routers,
        })
        .unwrap();

        assert_eq!(node.map().len(), 1);
        assert_eq!(node.map().get("p").unwrap().cookie.sb_type(), "");
    }

    #[test]
    fn test_type_change_invalidates_row() {
        let upb = UnpairedPortBinding {
            name: "p".into(),
            kind: PortBindingKind::SwitchPort,
            requested_tunnel_key: 0,
            external_ids: Default::default(),
            cookie: PortCookie::SwitchPort(SwitchPortCookie {
                lsp: Uuid::new_v4(),
                switch: Uuid::new_v4(),
                sb_type: "localnet".into(),
            }),
            sb_datapath: Uuid::new_v4(),
            dp_tunnel_key: 1,
        };
        let mut sb = PortBinding {
            logical_port: "p".into(),
            port_type: "localnet".into(),
            ..Default::default()
        };
        assert!(SwitchPortCallbacks.sb_is_valid(&sb, &upb));
        sb.port_type = "patch".into();
        assert!(!SwitchPortCallbacks.sb_is_valid(&sb, &upb));
    }

    #[test]
    fn test_decoder_writes_type_and_copies_up() {
        let mut nb = NbDb::new();
        let lsp = nb.logical_switch_ports.insert(LogicalSwitchPort {
            name: "p".into(),
            port_type: "router".into(),
            ..Default::default()
        });
        let mut sb = SbDb::new();
        let row = sb.port_bindings.insert(PortBinding {
            logical_port: "p".into(),
            tunnel_key: 1,
            up: Some(true),
            ..Default::default()
        });

        let mut paired = PairedPortBindings::default();
        paired.paired.insert(
            "p".into(),
            PairedPortBinding {
                name: "p".into(),
                kind: PortBindingKind::SwitchPort,
                cookie: PortCookie::SwitchPort(SwitchPortCookie {
                    lsp,
                    switch: Uuid::new_v4(),
                    sb_type: "patch".into(),
                }),
                sb_row: row,
                tunnel_key: 1,
                dp_tunnel_key: 1,
            },
        );

        let mut node = PairedLogicalSwitchPorts::new();
        let state = node
            .run(PairedDecodeInput {
                paired: &paired,
                nb: &mut nb,
                sb: &mut sb,
            })
            .unwrap();

        assert_eq!(state, NodeState::Updated);
        assert_eq!(node.get("p").unwrap().lsp, lsp);
        assert_eq!(sb.port_bindings.get(&row).unwrap().port_type, "patch");
        assert_eq!(nb.logical_switch_ports.get(&lsp).unwrap().up, Some(true));
    }
}
