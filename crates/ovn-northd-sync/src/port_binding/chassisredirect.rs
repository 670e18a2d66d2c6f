//! Chassis-redirect port collector and paired decoder.
//!
//! A chassis-redirect port `cr-<port>` is derived from:
//!
//! - every distributed gateway port of a router without `options:chassis`;
//! - every `router` type switch port peered with the only distributed
//!   gateway port of its router, on a switch without `localnet` ports.

use std::collections::BTreeMap;

use ovn_db::{RowId, Smap, SmapExt};
use ovn_inc_common::{warn_rl, EngineNode, EngineResult, NodeState, RateLimiter};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::types::{
    sync_sb_type, ChassisRedirectCookie, ChassisRedirectPrimary, PairedDecodeInput,
    PortBindingKind, PortCollectorInput, PortCookie, UnpairedPortBinding, UnpairedPortBindingMap,
};
use crate::datapath::SyncedEntity;

/// Returns the name of the chassis-redirect port derived from `port`.
pub fn chassis_redirect_name(port: &str) -> String {
    format!("cr-{port}")
}

fn unpaired(
    port: &str,
    primary: ChassisRedirectPrimary,
    datapath: &SyncedEntity,
) -> UnpairedPortBinding {
    UnpairedPortBinding {
        name: chassis_redirect_name(port),
        kind: PortBindingKind::ChassisRedirect,
        requested_tunnel_key: 0,
        external_ids: Smap::new(),
        cookie: PortCookie::ChassisRedirect(ChassisRedirectCookie {
            primary,
            datapath: datapath.nb_uuid,
        }),
        sb_datapath: datapath.sb_row,
        dp_tunnel_key: datapath.tunnel_key,
    }
}

/// Collects chassis-redirect ports.
#[derive(Debug)]
pub struct PortBindingChassisRedirect {
    map: UnpairedPortBindingMap,
    duplicate_rl: RateLimiter,
}

impl Default for PortBindingChassisRedirect {
    fn default() -> Self {
        Self::new()
    }
}

impl PortBindingChassisRedirect {
    pub fn new() -> Self {
        Self {
            map: UnpairedPortBindingMap::with_default_callbacks(PortBindingKind::ChassisRedirect),
            duplicate_rl: RateLimiter::new(1, 5),
        }
    }

    pub fn map(&self) -> &UnpairedPortBindingMap {
        &self.map
    }

    fn add(&mut self, map: &mut UnpairedPortBindingMap, upb: UnpairedPortBinding) {
        let name = upb.name.clone();
        if !map.add_once(upb) {
            warn_rl!(self.duplicate_rl, "duplicate chassis-redirect port {}", name);
        }
    }
}

impl EngineNode for PortBindingChassisRedirect {
    type Input<'a> = PortCollectorInput<'a>;

    fn name(&self) -> &'static str {
        "port_binding_chassisredirect_port"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let PortCollectorInput {
            nb,
            switches,
            routers,
        } = input;
        let mut map = UnpairedPortBindingMap::with_default_callbacks(PortBindingKind::ChassisRedirect);

        // Gateway port name -> number of gateway ports on its router.
        let mut gateway_ports: BTreeMap<&str, usize> = BTreeMap::new();

        for router in routers.iter() {
            let lr = nb.logical_routers.try_get(&router.nb_uuid)?;
            if lr.options.get_str("chassis").is_some() {
                continue;
            }
            let dgps: Vec<_> = nb
                .router_ports(lr)
                .filter(|(_, lrp)| lrp.is_gateway_port())
                .collect();
            for &(lrp_row, lrp) in &dgps {
                gateway_ports.insert(lrp.name.as_str(), dgps.len());
                self.add(
                    &mut map,
                    unpaired(&lrp.name, ChassisRedirectPrimary::RouterPort(lrp_row), router),
                );
            }
        }

        for switch in switches.iter() {
            let ls = nb.logical_switches.try_get(&switch.nb_uuid)?;
            if nb.switch_ports(ls).any(|(_, lsp)| lsp.port_type == "localnet") {
                continue;
            }
            for (lsp_row, lsp) in nb.switch_ports(ls) {
                if lsp.port_type != "router" {
                    continue;
                }
                let Some(peer) = lsp.options.get_str("router-port") else {
                    continue;
                };
                if gateway_ports.get(peer) != Some(&1) {
                    continue;
                }
                self.add(
                    &mut map,
                    unpaired(&lsp.name, ChassisRedirectPrimary::SwitchPort(lsp_row), switch),
                );
            }
        }

        debug!(ports = map.len(), "collected chassis-redirect ports");
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

/// A chassis-redirect port bound to its southbound row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedChassisRedirectPort {
    pub name: String,
    pub primary: ChassisRedirectPrimary,
    /// Northbound UUID of the datapath.
    pub datapath: Uuid,
    pub sb_row: RowId,
    pub tunnel_key: u32,
}

/// Paired chassis-redirect ports keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PairedChassisRedirectPorts {
    pub ports: BTreeMap<String, PairedChassisRedirectPort>,
}

impl PairedChassisRedirectPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PairedChassisRedirectPort> {
        self.ports.get(name)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl EngineNode for PairedChassisRedirectPorts {
    type Input<'a> = PairedDecodeInput<'a>;

    fn name(&self) -> &'static str {
        "port_binding_paired_chassisredirect_port"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let mut ports = BTreeMap::new();
        for ppb in input.paired.of_kind(PortBindingKind::ChassisRedirect) {
            let PortCookie::ChassisRedirect(cookie) = &ppb.cookie else {
                continue;
            };
            sync_sb_type(input.sb, ppb)?;
            ports.insert(
                ppb.name.clone(),
                PairedChassisRedirectPort {
                    name: ppb.name.clone(),
                    primary: cookie.primary,
                    datapath: cookie.datapath,
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
    use crate::datapath::{SyncedLogicalRouterMap, SyncedLogicalSwitchMap};
    use ovn_db::nb::{LogicalRouter, LogicalRouterPort, LogicalSwitch, LogicalSwitchPort};
    use ovn_db::{smap, NbDb};

    struct Topology {
        nb: NbDb,
        switches: SyncedLogicalSwitchMap,
        routers: SyncedLogicalRouterMap,
    }

    impl Topology {
        fn new() -> Self {
            Self {
                nb: NbDb::new(),
                switches: SyncedLogicalSwitchMap::new(),
                routers: SyncedLogicalRouterMap::new(),
            }
        }

        fn entity(uuid: Uuid, name: &str, key: u32) -> SyncedEntity {
            SyncedEntity {
                nb_uuid: uuid,
                name: name.into(),
                sb_row: Uuid::new_v4(),
                tunnel_key: key,
            }
        }

        fn router(&mut self, name: &str, options: Smap, ports: Vec<LogicalRouterPort>) {
            let ports = ports
                .into_iter()
                .map(|lrp| self.nb.logical_router_ports.insert(lrp))
                .collect();
            let lr = self.nb.logical_routers.insert(LogicalRouter {
                name: name.into(),
                ports,
                options,
                ..Default::default()
            });
            let key = self.routers.len() as u32 + 100;
            self.routers.entities.insert(lr, Self::entity(lr, name, key));
        }

        fn switch(&mut self, name: &str, ports: Vec<LogicalSwitchPort>) {
            let ports = ports
                .into_iter()
                .map(|lsp| self.nb.logical_switch_ports.insert(lsp))
                .collect();
            let ls = self.nb.logical_switches.insert(LogicalSwitch {
                name: name.into(),
                ports,
                ..Default::default()
            });
            let key = self.switches.len() as u32 + 1;
            self.switches.entities.insert(ls, Self::entity(ls, name, key));
        }

        fn collect(&self) -> Vec<String> {
            let mut node = PortBindingChassisRedirect::new();
            node.run(PortCollectorInput {
                nb: &self.nb,
                switches: &self.switches,
                routers: &self.routers,
            })
            .unwrap();
            node.map().ports.keys().cloned().collect()
        }
    }

    fn dgp(name: &str) -> LogicalRouterPort {
        LogicalRouterPort {
            name: name.into(),
            gateway_chassis: vec!["hv1".into()],
            ..Default::default()
        }
    }

    fn router_type_port(name: &str, peer: &str) -> LogicalSwitchPort {
        LogicalSwitchPort {
            name: name.into(),
            port_type: "router".into(),
            options: smap([("router-port", peer)]),
            ..Default::default()
        }
    }

    #[test]
    fn test_gateway_ports_get_chassis_redirect_ports() {
        let mut topo = Topology::new();
        topo.router(
            "lr0",
            Smap::new(),
            vec![
                dgp("lr0-public"),
                LogicalRouterPort {
                    name: "lr0-private".into(),
                    ..Default::default()
                },
            ],
        );
        topo.router("gw", smap([("chassis", "hv2")]), vec![dgp("gw-public")]);

        assert_eq!(topo.collect(), vec!["cr-lr0-public".to_string()]);
    }

    #[test]
    fn test_switch_port_peered_with_sole_gateway_port() {
        let mut topo = Topology::new();
        topo.router("lr0", Smap::new(), vec![dgp("lr0-public")]);
        topo.switch("public", vec![router_type_port("public-lr0", "lr0-public")]);

        assert_eq!(
            topo.collect(),
            vec!["cr-lr0-public".to_string(), "cr-public-lr0".to_string()]
        );
    }

    #[test]
    fn test_switch_port_skipped_with_localnet_or_many_gateways() {
        let mut topo = Topology::new();
        topo.router("lr0", Smap::new(), vec![dgp("lr0-a"), dgp("lr0-b")]);
        topo.router("lr1", Smap::new(), vec![dgp("lr1-a")]);
        topo.switch("multi", vec![router_type_port("multi-lr0", "lr0-a")]);
        topo.switch(
            "provider",
            vec![
                router_type_port("provider-lr1", "lr1-a"),
                LogicalSwitchPort {
                    name: "ln".into(),
                    port_type: "localnet".into(),
                    ..Default::default()
                },
            ],
        );

        assert_eq!(
            topo.collect(),
            vec![
                "cr-lr0-a".to_string(),
                "cr-lr0-b".to_string(),
                "cr-lr1-a".to_string()
            ]
        );
    }
}
