//! Moves references off legacy `Datapath_Binding` rows.
//!
//! Rows written by older northd versions identify their logical datapath
//! only through `external_ids`. The sync engine replaces each of them with
//! a fresh row; this module points every dependent row at the replacement
//! and then deletes the legacy row.

use std::collections::BTreeMap;

use ovn_db::{RowId, SbDb};
use ovn_inc_common::{EngineError, EngineResult};
use tracing::{info, instrument};

use super::types::RecreatedDatapath;

/// Counters of one legacy update run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyUpdateStats {
    pub datapaths: usize,
    pub port_bindings: usize,
    pub mac_bindings: usize,
    pub igmp_groups: usize,
    pub learned_routes: usize,
}

const NODE: &str = "datapath_legacy_update";

/// Builds the old row to new row map.
///
/// The legacy row must still carry a northbound UUID and a current row must
/// exist for it; anything else is an invariant violation.
fn build_row_map(
    recreated: &[RecreatedDatapath],
    sb: &SbDb,
) -> EngineResult<BTreeMap<RowId, RowId>> {
    let mut rows = BTreeMap::new();
    for rdp in recreated {
        let old = sb
            .datapath_bindings
            .get(&rdp.old_row)
            .ok_or_else(|| EngineError::missing_row("Datapath_Binding", rdp.old_row))?;
        let nb_uuid = old.get_nb_uuid().ok_or_else(|| {
            EngineError::invariant(
                NODE,
                format!("legacy Datapath_Binding {} has no northbound UUID", rdp.old_row),
            )
        })?;
        let (new_row, _) = sb.datapath_binding_for_nb_uuid(&nb_uuid).ok_or_else(|| {
            EngineError::invariant(
                NODE,
                format!("no Datapath_Binding replaces {} for {}", rdp.old_row, nb_uuid),
            )
        })?;
        if rows.insert(rdp.old_row, new_row).is_some() {
            return Err(EngineError::invariant(
                NODE,
                format!("Datapath_Binding {} recreated twice", rdp.old_row),
            ));
        }
    }
    Ok(rows)
}

macro_rules! rewrite_datapath_refs {
    ($table:expr, $rows:expr) => {{
        let mut rewritten = 0;
        for id in $table.ids() {
            let Some(new_row) = $table.get(&id).and_then(|r| $rows.get(&r.datapath)).copied() else {
                continue;
            };
            if $table.update(&id, |r| r.datapath = new_row)? {
                rewritten += 1;
            }
        }
        rewritten
    }};
}

/// Rewrites every reference to a recreated row and deletes the old rows.
#[instrument(skip_all, fields(count = recreated.len()))]
pub fn run(recreated: &[RecreatedDatapath], sb: &mut SbDb) -> EngineResult<LegacyUpdateStats> {
    if recreated.is_empty() {
        return Ok(LegacyUpdateStats::default());
    }

    let rows = build_row_map(recreated, sb)?;
    let stats = LegacyUpdateStats {
        datapaths: rows.len(),
        port_bindings: rewrite_datapath_refs!(sb.port_bindings, rows),
        mac_bindings: rewrite_datapath_refs!(sb.mac_bindings, rows),
        igmp_groups: rewrite_datapath_refs!(sb.igmp_groups, rows),
        learned_routes: rewrite_datapath_refs!(sb.learned_routes, rows),
    };

    for old_row in rows.keys() {
        sb.datapath_bindings.delete(old_row)?;
    }

    info!(
        datapaths = stats.datapaths,
        port_bindings = stats.port_bindings,
        mac_bindings = stats.mac_bindings,
        igmp_groups = stats.igmp_groups,
        learned_routes = stats.learned_routes,
        "moved references off legacy datapaths"
    );
    Ok(stats)
}
