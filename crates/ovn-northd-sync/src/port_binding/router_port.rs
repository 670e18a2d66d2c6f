//! Logical router port collector and paired decoder.

use std::collections::BTreeMap;

use ovn_db::{RowId, SmapExt};
use ovn_inc_common::{warn_rl, EngineNode, EngineResult, NodeState, RateLimiter};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::types::{
    sync_sb_type, PairedDecodeInput, PortBindingKind, PortCollectorInput, PortCookie,
    RouterPortCookie, UnpairedPortBinding, UnpairedPortBindingMap,
};
use crate::tnlid::requested_tunnel_key;

/// Collects one unpaired port per port of every synced router.
#[derive(Debug)]
pub struct PortBindingRouterPort {
    map: UnpairedPortBindingMap,
    duplicate_rl: RateLimiter,
}

impl Default for PortBindingRouterPort {
    fn default() -> Self {
        Self::new()
    }
}

impl PortBindingRouterPort {
    pub fn new() -> Self {
        Self {
            map: UnpairedPortBindingMap::with_default_callbacks(PortBindingKind::RouterPort),
            duplicate_rl: RateLimiter::new(1, 5),
        }
    }

    pub fn map(&self) -> &UnpairedPortBindingMap {
        &self.map
    }
}

impl EngineNode for PortBindingRouterPort {
    type Input<'a> = PortCollectorInput<'a>;

    fn name(&self) -> &'static str {
        "port_binding_logical_router_port"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let mut map = UnpairedPortBindingMap::with_default_callbacks(PortBindingKind::RouterPort);

        for router in input.routers.iter() {
            let lr = input.nb.logical_routers.try_get(&router.nb_uuid)?;
            let sb_type = if lr.options.get_str("chassis").is_some() {
                "l3gateway"
            } else {
                "patch"
            };

            for (lrp_row, lrp) in input.nb.router_ports(lr) {
                let upb = UnpairedPortBinding {
                    name: lrp.name.clone(),
                    kind: PortBindingKind::RouterPort,
                    requested_tunnel_key: requested_tunnel_key(&lrp.options),
                    external_ids: lrp.external_ids.clone(),
                    cookie: PortCookie::RouterPort(RouterPortCookie {
                        lrp: lrp_row,
                        router: router.nb_uuid,
                        sb_type: sb_type.to_string(),
                    }),
                    sb_datapath: router.sb_row,
                    dp_tunnel_key: router.tunnel_key,
                };
                if !map.add_once(upb) {
                    warn_rl!(self.duplicate_rl, "duplicate logical router port {}", lrp.name);
                }
            }
        }

        debug!(ports = map.len(), "collected logical router ports");
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

/// A router port bound to its southbound row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedLogicalRouterPort {
    pub name: String,
    /// The `Logical_Router_Port` row.
    pub lrp: RowId,
    /// Northbound UUID of the owning router.
    pub router: Uuid,
    pub sb_row: RowId,
    pub tunnel_key: u32,
}

/// Paired router ports keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PairedLogicalRouterPorts {
    pub ports: BTreeMap<String, PairedLogicalRouterPort>,
}

impl PairedLogicalRouterPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PairedLogicalRouterPort> {
        self.ports.get(name)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl EngineNode for PairedLogicalRouterPorts {
    type Input<'a> = PairedDecodeInput<'a>;

    fn name(&self) -> &'static str {
        "port_binding_paired_logical_router_port"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let mut ports = BTreeMap::new();
        for ppb in input.paired.of_kind(PortBindingKind::RouterPort) {
            let PortCookie::RouterPort(cookie) = &ppb.cookie else {
                continue;
            };
            sync_sb_type(input.sb, ppb)?;
            ports.insert(
                ppb.name.clone(),
                PairedLogicalRouterPort {
                    name: ppb.name.clone(),
                    lrp: cookie.lrp,
                    router: cookie.router,
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
