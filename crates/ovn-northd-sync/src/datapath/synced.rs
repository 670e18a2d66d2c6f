//! Per-kind views of the synced datapaths.
//!
//! The port-binding collectors only care about switches or only about
//! routers; these decoders split [`SyncedDatapaths::synced`] by kind and
//! forward its deltas. Pending datapaths are never decoded.

use ovn_inc_common::{EngineNode, EngineResult, HandlerResult, NodeState, TrackedMap};
use ovn_db::RowId;
use tracing::instrument;
use uuid::Uuid;

use super::types::{DatapathKind, SyncedDatapath, SyncedDatapaths};

/// A synced datapath as seen by port-binding collectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedEntity {
    pub nb_uuid: Uuid,
    pub name: String,
    /// The southbound `Datapath_Binding` row.
    pub sb_row: RowId,
    pub tunnel_key: u32,
}

impl From<&SyncedDatapath> for SyncedEntity {
    fn from(sdp: &SyncedDatapath) -> Self {
        Self {
            nb_uuid: sdp.nb_uuid,
            name: sdp.name.clone(),
            sb_row: sdp.sb_row,
            tunnel_key: sdp.tunnel_key,
        }
    }
}

fn decode_all(kind: DatapathKind, dps: &SyncedDatapaths) -> Vec<(Uuid, SyncedEntity)> {
    dps.synced
        .values()
        .filter(|sdp| sdp.kind == kind)
        .map(|sdp| (sdp.nb_uuid, SyncedEntity::from(sdp)))
        .collect()
}

fn decode_changes(
    kind: DatapathKind,
    dps: &SyncedDatapaths,
    out: &mut TrackedMap<Uuid, SyncedEntity>,
) -> HandlerResult {
    if !dps.synced.is_tracked() {
        return HandlerResult::Unhandled;
    }

    let changes = dps.synced.changes();
    let mut changed = false;
    for nb_uuid in changes.new.iter().chain(changes.updated.iter()) {
        if let Some(sdp) = dps.synced.get(nb_uuid).filter(|sdp| sdp.kind == kind) {
            changed |= out.insert(*nb_uuid, SyncedEntity::from(sdp));
        }
    }
    for (nb_uuid, sdp) in &changes.deleted {
        if sdp.kind == kind {
            changed |= out.remove(nb_uuid).is_some();
        }
    }
    HandlerResult::handled(changed)
}

macro_rules! synced_map {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $node:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            /// Entities keyed by northbound UUID.
            pub entities: TrackedMap<Uuid, SyncedEntity>,
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self {
                    entities: TrackedMap::new(),
                }
            }

            /// Looks an entity up by northbound UUID.
            pub fn find(&self, nb_uuid: &Uuid) -> Option<&SyncedEntity> {
                self.entities.get(nb_uuid)
            }

            /// Iterates over entities in UUID order.
            pub fn iter(&self) -> impl Iterator<Item = &SyncedEntity> {
                self.entities.values()
            }

            pub fn len(&self) -> usize {
                self.entities.len()
            }

            pub fn is_empty(&self) -> bool {
                self.entities.is_empty()
            }

            /// Applies the deltas of the datapath sync output.
            #[instrument(skip_all)]
            pub fn handle_datapath_sync(&mut self, dps: &SyncedDatapaths) -> HandlerResult {
                decode_changes($kind, dps, &mut self.entities)
            }
        }

        impl EngineNode for $name {
            type Input<'a> = &'a SyncedDatapaths;

            fn name(&self) -> &'static str {
                $node
            }

            fn run(&mut self, dps: Self::Input<'_>) -> EngineResult<NodeState> {
                self.entities.reset(decode_all($kind, dps));
                Ok(NodeState::Updated)
            }

            fn clear_tracked_data(&mut self) {
                self.entities.clear_tracked();
            }

            fn cleanup(&mut self) {
                self.entities.clear();
            }
        }
    };
}

synced_map!(
    /// Synced logical switch datapaths.
    SyncedLogicalSwitchMap,
    DatapathKind::Switch,
    "synced_logical_switch_map"
);

synced_map!(
    /// Synced logical router datapaths.
    SyncedLogicalRouterMap,
    DatapathKind::Router,
    "synced_logical_router_map"
);
