//! Test fixtures for northbound topologies and southbound seed state
//!
//! Ports are built first and handed to the switch or router that owns
//! them, so building never fails.

use ovn_db::nb::{LogicalRouter, LogicalRouterPort, LogicalSwitch, LogicalSwitchPort, Mirror};
use ovn_db::sb::{DatapathBinding, DatapathType, Fdb, MacBinding, PortBinding};
use ovn_db::{smap, NbDb, RowId, SbDb, Smap};
use uuid::Uuid;

/// Row ids of a switch and its ports, in the order given.
#[derive(Debug, Clone)]
pub struct SwitchRows {
    pub row: RowId,
    pub ports: Vec<RowId>,
}

/// Row ids of a router and its ports, in the order given.
#[derive(Debug, Clone)]
pub struct RouterRows {
    pub row: RowId,
    pub ports: Vec<RowId>,
}

/// Builder for a northbound database.
#[derive(Debug, Default)]
pub struct NbFixture {
    pub nb: NbDb,
}

impl NbFixture {
    /// Create an empty northbound database
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a switch owning `ports`
    pub fn switch(
        &mut self,
        name: &str,
        other_config: Smap,
        ports: Vec<LogicalSwitchPort>,
    ) -> SwitchRows {
        let ports: Vec<RowId> = ports
            .into_iter()
            .map(|lsp| self.nb.logical_switch_ports.insert(lsp))
            .collect();
        let row = self.nb.logical_switches.insert(LogicalSwitch {
            name: name.to_string(),
            ports: ports.clone(),
            other_config,
        });
        SwitchRows { row, ports }
    }

    /// Add an enabled router owning `ports`
    pub fn router(&mut self, name: &str, options: Smap, ports: Vec<LogicalRouterPort>) -> RouterRows {
        let ports: Vec<RowId> = ports
            .into_iter()
            .map(|lrp| self.nb.logical_router_ports.insert(lrp))
            .collect();
        let row = self.nb.logical_routers.insert(LogicalRouter {
            name: name.to_string(),
            enabled: None,
            ports: ports.clone(),
            options,
        });
        RouterRows { row, ports }
    }

    /// Add a mirror rule
    pub fn mirror(&mut self, name: &str, mirror_type: &str, sink: &str) -> RowId {
        self.nb.mirrors.insert(Mirror {
            name: name.to_string(),
            mirror_type: mirror_type.to_string(),
            sink: sink.to_string(),
        })
    }

    /// Finish building
    pub fn build(self) -> NbDb {
        self.nb
    }
}

/// Common logical port fixtures
pub mod port_fixtures {
    use super::*;

    /// VIF switch port
    pub fn vif(name: &str) -> LogicalSwitchPort {
        LogicalSwitchPort {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// VIF switch port asking for a tunnel key
    pub fn vif_with_key(name: &str, key: u32) -> LogicalSwitchPort {
        LogicalSwitchPort {
            name: name.to_string(),
            options: smap([("requested-tnl-key", key.to_string())]),
            ..Default::default()
        }
    }

    /// Switch port of type `router` peered with `router_port`
    pub fn router_link(name: &str, router_port: &str) -> LogicalSwitchPort {
        LogicalSwitchPort {
            name: name.to_string(),
            port_type: "router".to_string(),
            options: smap([("router-port", router_port)]),
            ..Default::default()
        }
    }

    /// Localnet switch port
    pub fn localnet(name: &str) -> LogicalSwitchPort {
        LogicalSwitchPort {
            name: name.to_string(),
            port_type: "localnet".to_string(),
            ..Default::default()
        }
    }

    /// Switch port mirrored by `mirrors`
    pub fn mirrored(name: &str, mirrors: Vec<RowId>) -> LogicalSwitchPort {
        LogicalSwitchPort {
            name: name.to_string(),
            mirror_rules: mirrors,
            ..Default::default()
        }
    }

    /// Plain router port
    pub fn lrp(name: &str) -> LogicalRouterPort {
        LogicalRouterPort {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Router port asking for a tunnel key
    pub fn lrp_with_key(name: &str, key: u32) -> LogicalRouterPort {
        LogicalRouterPort {
            name: name.to_string(),
            options: smap([("requested-tnl-key", key.to_string())]),
            ..Default::default()
        }
    }

    /// Distributed gateway port
    pub fn gateway_port(name: &str, chassis: &str) -> LogicalRouterPort {
        LogicalRouterPort {
            name: name.to_string(),
            gateway_chassis: vec![chassis.to_string()],
            ..Default::default()
        }
    }
}

/// Southbound rows as an older or foreign writer would leave them
pub mod sb_fixtures {
    use super::*;

    /// Current-schema datapath binding
    pub fn datapath(sb: &mut SbDb, nb_uuid: Uuid, dp_type: DatapathType, key: u32) -> RowId {
        sb.datapath_bindings.insert(DatapathBinding {
            tunnel_key: key,
            nb_uuid: Some(nb_uuid),
            datapath_type: Some(dp_type),
            external_ids: Smap::new(),
        })
    }

    /// Datapath binding naming its northbound row only in `external_ids`
    pub fn legacy_datapath(sb: &mut SbDb, nb_uuid: Uuid, dp_type: DatapathType, key: u32) -> RowId {
        sb.datapath_bindings.insert(DatapathBinding {
            tunnel_key: key,
            nb_uuid: None,
            datapath_type: None,
            external_ids: smap([(dp_type.legacy_key(), nb_uuid.to_string())]),
        })
    }

    /// Port binding on `datapath`
    pub fn port_binding(
        sb: &mut SbDb,
        name: &str,
        datapath: RowId,
        key: u32,
        port_type: &str,
    ) -> RowId {
        sb.port_bindings.insert(PortBinding {
            logical_port: name.to_string(),
            datapath,
            tunnel_key: key,
            port_type: port_type.to_string(),
            ..Default::default()
        })
    }

    /// MAC binding on `datapath`
    pub fn mac_binding(sb: &mut SbDb, port: &str, datapath: RowId) -> RowId {
        sb.mac_bindings.insert(MacBinding {
            logical_port: port.to_string(),
            ip: "10.0.0.1".to_string(),
            mac: "00:00:00:00:00:01".to_string(),
            datapath,
        })
    }

    /// Learned FDB entry
    pub fn fdb(sb: &mut SbDb, mac: &str, dp_key: u32, port_key: u32) -> RowId {
        sb.fdbs.insert(Fdb {
            mac: mac.to_string(),
            dp_key,
            port_key,
        })
    }
}
