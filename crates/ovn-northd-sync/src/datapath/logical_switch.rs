//! Logical switch datapath collector.
//!
//! Turns every northbound `Logical_Switch` into an [`UnsyncedDatapath`]
//! carrying the requested key and the `external_ids` the southbound row
//! must hold.

use ovn_db::nb::LogicalSwitch;
use ovn_db::sb::EXTERNAL_ID_LOGICAL_SWITCH;
use ovn_db::{ChangeKind, NbDb, Smap, SmapExt};
use ovn_inc_common::{warn_rl, EngineNode, EngineResult, HandlerResult, NodeState, RateLimiter};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::types::{DatapathKind, UnsyncedDatapath, UnsyncedDatapathMap};
use crate::config::NorthdConfig;
use crate::tnlid::requested_tunnel_key;

/// Largest switch key usable in VXLAN mode without interconnection.
const VXLAN_MAX_SWITCH_KEY: u32 = (1 << 12) - 1;

/// Collector of logical switch datapaths.
#[derive(Debug)]
pub struct DatapathLogicalSwitch {
    map: UnsyncedDatapathMap,
    vxlan_rl: RateLimiter,
}

impl Default for DatapathLogicalSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl DatapathLogicalSwitch {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self {
            map: UnsyncedDatapathMap::new(DatapathKind::Switch),
            vxlan_rl: RateLimiter::new(1, 1),
        }
    }

    /// Returns the collected datapaths.
    pub fn map(&self) -> &UnsyncedDatapathMap {
        &self.map
    }

    fn build(&self, nb_uuid: Uuid, ls: &LogicalSwitch, config: &NorthdConfig) -> UnsyncedDatapath {
        let mut requested = requested_tunnel_key(&ls.other_config);
        let interconn_ts = ls.other_config.get_str("interconn-ts");

        if interconn_ts.is_none() && config.vxlan_mode && requested > VXLAN_MAX_SWITCH_KEY {
            warn_rl!(
                self.vxlan_rl,
                "Tunnel key {} for datapath {} is incompatible with VXLAN",
                requested,
                ls.name
            );
            requested = 0;
        }

        let mut external_ids = Smap::new();
        external_ids.insert(EXTERNAL_ID_LOGICAL_SWITCH.to_string(), nb_uuid.to_string());
        external_ids.insert("name".to_string(), ls.name.clone());
        if let Some(network) = ls.other_config.get_nonempty("neutron:network_name") {
            external_ids.insert("name2".to_string(), network.to_string());
        }
        let ct_zone_limit = ls.other_config.get_int("ct-zone-limit", -1);
        if ct_zone_limit > 0 {
            external_ids.insert("ct-zone-limit".to_string(), ct_zone_limit.to_string());
        }
        if let Some(ts) = interconn_ts {
            external_ids.insert("interconn-ts".to_string(), ts.to_string());
        }
        let age_threshold = ls.other_config.get_uint("fdb_age_threshold", 0);
        if age_threshold != 0 {
            external_ids.insert("fdb_age_threshold".to_string(), age_threshold.to_string());
        }

        UnsyncedDatapath {
            nb_uuid,
            kind: DatapathKind::Switch,
            name: ls.name.clone(),
            requested_tunnel_key: requested,
            external_ids,
        }
    }

    /// Applies tracked `Logical_Switch` changes.
    #[instrument(skip_all)]
    pub fn handle_nb_logical_switch(&mut self, nb: &NbDb, config: &NorthdConfig) -> HandlerResult {
        let mut changed = false;
        for tracked in nb.logical_switches.tracked() {
            match tracked.kind {
                ChangeKind::Deleted => {
                    changed |= self.map.dps.remove(&tracked.id).is_some();
                }
                ChangeKind::New | ChangeKind::Updated => {
                    let dp = self.build(tracked.id, tracked.row, config);
                    changed |= self.map.dps.insert(tracked.id, dp);
                }
            }
        }
        debug!(changed, "handled logical switch changes");
        HandlerResult::handled(changed)
    }
}

impl EngineNode for DatapathLogicalSwitch {
    type Input<'a> = (&'a NbDb, &'a NorthdConfig);

    fn name(&self) -> &'static str {
        "datapath_logical_switch"
    }

    #[instrument(skip_all)]
    fn run(&mut self, (nb, config): Self::Input<'_>) -> EngineResult<NodeState> {
        let dps: Vec<_> = nb
            .logical_switches
            .iter()
            .map(|(id, ls)| (id, self.build(id, ls, config)))
            .collect();
        debug!(count = dps.len(), "collected logical switches");
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
