//! Logical router datapath collector.

use ovn_db::nb::LogicalRouter;
use ovn_db::sb::EXTERNAL_ID_LOGICAL_ROUTER;
use ovn_db::{ChangeKind, NbDb, Smap, SmapExt};
use ovn_inc_common::{EngineNode, EngineResult, HandlerResult, NodeState};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::types::{DatapathKind, UnsyncedDatapath, UnsyncedDatapathMap};
use crate::tnlid::requested_tunnel_key;

/// Returns the smallest threshold of a `mac_binding_age_threshold` option.
///
/// The option is a `;`-separated list of `N` or `prefix:N` entries.
/// Malformed entries are skipped; 0 means no aging.
pub fn min_mac_binding_age_threshold(option: Option<&str>) -> u32 {
    let Some(option) = option else {
        return 0;
    };

    option
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let value = entry.rsplit_once(':').map_or(entry, |(_, v)| v);
            value.trim().parse::<u32>().ok()
        })
        .min()
        .unwrap_or(0)
}

fn build(nb_uuid: Uuid, lr: &LogicalRouter) -> UnsyncedDatapath {
    let mut external_ids = Smap::new();
    external_ids.insert("name".to_string(), lr.name.clone());
    if let Some(name2) = lr.options.get_nonempty("neutron:router_name") {
        external_ids.insert("name2".to_string(), name2.to_string());
    }
    let ct_zone_limit = lr.options.get_int("ct-zone-limit", -1);
    if ct_zone_limit > 0 {
        external_ids.insert("ct-zone-limit".to_string(), ct_zone_limit.to_string());
    }
    let snat_ct_zone = lr.options.get_int("snat-ct-zone", -1);
    if snat_ct_zone >= 0 {
        external_ids.insert("snat-ct-zone".to_string(), snat_ct_zone.to_string());
    }
    if !lr.options.get_bool("always_learn_from_arp_request", true) {
        external_ids.insert(
            "always_learn_from_arp_request".to_string(),
            "false".to_string(),
        );
    }
    let age_threshold =
        min_mac_binding_age_threshold(lr.options.get_str("mac_binding_age_threshold"));
    if age_threshold != 0 {
        external_ids.insert(
            "mac_binding_age_threshold".to_string(),
            age_threshold.to_string(),
        );
    }
    external_ids.insert(EXTERNAL_ID_LOGICAL_ROUTER.to_string(), nb_uuid.to_string());

    UnsyncedDatapath {
        nb_uuid,
        kind: DatapathKind::Router,
        name: lr.name.clone(),
        requested_tunnel_key: requested_tunnel_key(&lr.options),
        external_ids,
    }
}

/// Collector of logical router datapaths. Disabled routers get none.
#[derive(Debug)]
pub struct DatapathLogicalRouter {
    map: UnsyncedDatapathMap,
}

impl Default for DatapathLogicalRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl DatapathLogicalRouter {
    pub fn new() -> Self {
        Self {
            map: UnsyncedDatapathMap::new(DatapathKind::Router),
        }
    }

    /// Returns the collected datapaths.
    pub fn map(&self) -> &UnsyncedDatapathMap {
        &self.map
    }

    /// Applies tracked `Logical_Router` changes.
    ///
    /// A router that becomes disabled is handled as a deletion.
    #[instrument(skip_all)]
    pub fn handle_nb_logical_router(&mut self, nb: &NbDb) -> HandlerResult {
        let mut changed = false;
        for tracked in nb.logical_routers.tracked() {
            let wanted = tracked.kind != ChangeKind::Deleted && tracked.row.is_enabled();
            if wanted {
                changed |= self.map.dps.insert(tracked.id, build(tracked.id, tracked.row));
            } else {
                changed |= self.map.dps.remove(&tracked.id).is_some();
            }
        }
        debug!(changed, "handled logical router changes");
        HandlerResult::handled(changed)
    }
}

impl EngineNode for DatapathLogicalRouter {
    type Input<'a> = &'a NbDb;

    fn name(&self) -> &'static str {
        "datapath_logical_router"
    }

    #[instrument(skip_all)]
    fn run(&mut self, nb: Self::Input<'_>) -> EngineResult<NodeState> {
        let dps: Vec<_> = nb
            .logical_routers
            .iter()
            .filter(|(_, lr)| lr.is_enabled())
            .map(|(id, lr)| (id, build(id, lr)))
            .collect();
        debug!(count = dps.len(), "collected logical routers");
        self.map.dps.reset(dps);
        Ok(NodeState::Updated)
    }

    fn clear_tracked_data(&mut self) {
        self.map.dps.clear_tracked();
    }

    fn cleanup(&mut self) {
        self.map.dps.clear();
    }
}
