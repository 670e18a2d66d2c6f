//! Datapath sync engine.
//!
//! Binds every collected [`UnsyncedDatapath`] to exactly one southbound
//! `Datapath_Binding` row and gives it a tunnel key from the single global
//! datapath key space.
//!
//! A full run rebuilds everything from a scan of the southbound table:
//!
//! 1. rows naming no collected datapath are deleted, as are second rows
//!    naming an already claimed one;
//! 2. every claimed row gets its `external_ids` rewritten immediately;
//! 3. datapaths left without a row get a freshly inserted one;
//! 4. keys are assigned in three passes: requested, existing, allocated.
//!    A datapath still without a key loses its row.
//!
//! Rows inserted by this engine are *pending* until the database reports
//! them back, see [`DatapathSync::handle_sb_datapath_binding`].

use std::collections::{BTreeMap, BTreeSet};

use ovn_db::sb::DatapathBinding;
use ovn_db::{ChangeKind, RowId, SbDb};
use ovn_inc_common::{
    info_rl, warn_rl, EngineNode, EngineResult, HandlerResult, NodeState, RateLimiter,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::types::{
    DatapathKind, RecreatedDatapath, SyncedDatapath, SyncedDatapaths, UnsyncedDatapath,
    UnsyncedDatapathMap,
};
use crate::config::{NorthdConfig, OVN_MIN_DP_KEY_LOCAL};
use crate::tnlid::TunnelKeySet;

/// Inputs of the datapath sync engine.
pub struct DatapathSyncInput<'a> {
    /// One map per datapath kind, in lookup priority order.
    pub maps: [&'a UnsyncedDatapathMap; 2],
    pub sb: &'a mut SbDb,
    pub config: &'a NorthdConfig,
}

/// A datapath bound to a row but not yet keyed.
struct Candidate<'a> {
    udp: &'a UnsyncedDatapath,
    sb_row: RowId,
    existing_key: u32,
    inserted: bool,
    key: Option<u32>,
}

fn find_unsynced<'a>(maps: &[&'a UnsyncedDatapathMap], nb_uuid: &Uuid) -> Option<&'a UnsyncedDatapath> {
    maps.iter().copied().find_map(|map| map.find(nb_uuid))
}

fn new_binding(udp: &UnsyncedDatapath) -> DatapathBinding {
    DatapathBinding {
        tunnel_key: 0,
        nb_uuid: Some(udp.nb_uuid),
        datapath_type: Some(udp.kind.sb_type()),
        external_ids: udp.external_ids.clone(),
    }
}

fn synced_from(udp: &UnsyncedDatapath, sb_row: RowId, tunnel_key: u32) -> SyncedDatapath {
    SyncedDatapath {
        nb_uuid: udp.nb_uuid,
        kind: udp.kind,
        name: udp.name.clone(),
        sb_row,
        tunnel_key,
        external_ids: udp.external_ids.clone(),
    }
}

/// Returns true if the row holds exactly what the engine wrote.
fn row_matches(row: &DatapathBinding, sdp: &SyncedDatapath) -> bool {
    row.tunnel_key == sdp.tunnel_key
        && row.nb_uuid == Some(sdp.nb_uuid)
        && row.external_ids == sdp.external_ids
}

/// The datapath sync engine node.
pub struct DatapathSync {
    output: SyncedDatapaths,
    dp_tnlids: TunnelKeySet,
    has_run: bool,
    conflict_rl: RateLimiter,
    duplicate_rl: RateLimiter,
    exhausted_rl: RateLimiter,
}

impl std::fmt::Debug for DatapathSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatapathSync")
            .field("synced", &self.output.synced.len())
            .field("pending", &self.output.pending.len())
            .field("recreated", &self.output.recreated.len())
            .field("keys", &self.dp_tnlids.len())
            .field("has_run", &self.has_run)
            .finish()
    }
}

impl Default for DatapathSync {
    fn default() -> Self {
        Self::new()
    }
}

impl DatapathSync {
    /// Creates an engine that has not run yet.
    pub fn new() -> Self {
        Self {
            output: SyncedDatapaths::default(),
            dp_tnlids: TunnelKeySet::new(),
            has_run: false,
            conflict_rl: RateLimiter::new(1, 1),
            duplicate_rl: RateLimiter::new(1, 5),
            exhausted_rl: RateLimiter::new(1, 1),
        }
    }

    /// Returns the engine output.
    pub fn output(&self) -> &SyncedDatapaths {
        &self.output
    }

    /// Returns the occupied datapath keys.
    pub fn tunnel_keys(&self) -> &TunnelKeySet {
        &self.dp_tnlids
    }

    fn warn_conflict(&self, udp: &UnsyncedDatapath, key: u32) {
        warn_rl!(
            self.conflict_rl,
            "Logical datapath {} requests same tunnel key {} as another logical datapath",
            udp.nb_uuid,
            key
        );
    }

    fn warn_exhausted(&self, udp: &UnsyncedDatapath) {
        warn_rl!(
            self.exhausted_rl,
            "all datapath tunnel ids exhausted, dropping {} {}",
            udp.kind,
            udp.name
        );
    }

    /// Scans the southbound table and claims rows for collected datapaths.
    ///
    /// Returns the candidates and the legacy rows per northbound UUID.
    fn claim_rows<'a>(
        &self,
        maps: &[&'a UnsyncedDatapathMap; 2],
        sb: &mut SbDb,
    ) -> EngineResult<(Vec<Candidate<'a>>, BTreeMap<Uuid, Vec<(RowId, u32)>>)> {
        let mut candidates: Vec<Candidate<'a>> = Vec::new();
        let mut claimed: BTreeMap<Uuid, RowId> = BTreeMap::new();
        let mut legacy: BTreeMap<Uuid, Vec<(RowId, u32)>> = BTreeMap::new();

        for row_id in sb.datapath_bindings.ids() {
            let row = sb.datapath_bindings.try_get(&row_id)?;
            let legacy_ref = if row.is_legacy() {
                row.legacy_nb_uuid()
            } else {
                None
            };
            let row_nb_uuid = row.nb_uuid;
            let existing_key = row.tunnel_key;

            if let Some((dp_type, nb_uuid)) = legacy_ref {
                let wanted = find_unsynced(maps, &nb_uuid)
                    .is_some_and(|udp| udp.kind == DatapathKind::from(dp_type));
                if wanted {
                    legacy.entry(nb_uuid).or_default().push((row_id, existing_key));
                } else {
                    debug!(row = %row_id, "deleting orphaned legacy Datapath_Binding");
                    sb.datapath_bindings.delete(&row_id)?;
                }
                continue;
            }

            let Some(udp) = row_nb_uuid.and_then(|nb_uuid| find_unsynced(maps, &nb_uuid)) else {
                debug!(row = %row_id, "deleting orphaned Datapath_Binding");
                sb.datapath_bindings.delete(&row_id)?;
                continue;
            };

            if let Some(first) = claimed.get(&udp.nb_uuid) {
                info_rl!(
                    self.duplicate_rl,
                    "deleting Datapath_Binding {} with duplicate nb_uuid {} (kept {})",
                    row_id,
                    udp.nb_uuid,
                    first
                );
                sb.datapath_bindings.delete(&row_id)?;
                continue;
            }

            sb.datapath_bindings.update(&row_id, |dp| {
                dp.datapath_type = Some(udp.kind.sb_type());
                dp.external_ids = udp.external_ids.clone();
            })?;
            claimed.insert(udp.nb_uuid, row_id);
            candidates.push(Candidate {
                udp,
                sb_row: row_id,
                existing_key,
                inserted: false,
                key: None,
            });
        }

        for map in maps.iter().copied() {
            for udp in map.dps.values() {
                if claimed.contains_key(&udp.nb_uuid) {
                    continue;
                }
                let sb_row = sb.datapath_bindings.insert(new_binding(udp));
                candidates.push(Candidate {
                    udp,
                    sb_row,
                    existing_key: 0,
                    inserted: true,
                    key: None,
                });
            }
        }

        // A recreated datapath keeps the key of the row it replaces.
        for candidate in &mut candidates {
            if candidate.existing_key != 0 {
                continue;
            }
            if let Some((_, key)) = legacy.get(&candidate.udp.nb_uuid).and_then(|rows| rows.first()) {
                candidate.existing_key = *key;
            }
        }

        Ok((candidates, legacy))
    }

    /// Runs the three key assignment passes over `candidates`.
    fn assign_keys(&mut self, candidates: &mut [Candidate<'_>], max_key: u32) {
        for candidate in candidates.iter_mut() {
            let requested = candidate.udp.requested_tunnel_key;
            if requested == 0 {
                continue;
            }
            if self.dp_tnlids.add(requested) {
                candidate.key = Some(requested);
            } else {
                self.warn_conflict(candidate.udp, requested);
            }
        }

        for candidate in candidates.iter_mut() {
            if candidate.key.is_none()
                && candidate.existing_key != 0
                && self.dp_tnlids.add(candidate.existing_key)
            {
                candidate.key = Some(candidate.existing_key);
            }
        }

        for candidate in candidates.iter_mut().filter(|c| c.key.is_none()) {
            candidate.key = self.dp_tnlids.allocate(OVN_MIN_DP_KEY_LOCAL, max_key);
        }
    }

    /// Returns true if applying `deleted` then `upserts` assigns the keys
    /// a full run would.
    ///
    /// That fails when a requested key is held by a datapath that is not
    /// being deleted, or when a freed key would go to a datapath left
    /// untouched here: one that requests it, or one still without a key.
    fn keys_match_full_run(
        &self,
        maps: &[&UnsyncedDatapathMap; 2],
        deleted: &[&Uuid],
        upserts: &[&UnsyncedDatapath],
    ) -> bool {
        let mut keys = self.dp_tnlids.clone();
        let mut freed = BTreeSet::new();
        for nb_uuid in deleted {
            if let Some(sdp) = self.output.find(nb_uuid) {
                keys.remove(sdp.tunnel_key);
                freed.insert(sdp.tunnel_key);
            }
        }

        for udp in upserts {
            let requested = udp.requested_tunnel_key;
            let current = self.output.find(&udp.nb_uuid).map(|sdp| sdp.tunnel_key);
            if requested == 0 || current == Some(requested) {
                continue;
            }
            if !keys.add(requested) {
                debug!(name = %udp.name, key = requested, "requested datapath key is held");
                return false;
            }
            if let Some(key) = current {
                keys.remove(key);
                freed.insert(key);
            }
        }

        freed.retain(|key| !keys.present(*key));
        if freed.is_empty() {
            return true;
        }
        let upserted: BTreeSet<Uuid> = upserts.iter().map(|udp| udp.nb_uuid).collect();
        let waiting = maps
            .iter()
            .flat_map(|map| map.dps.values())
            .filter(|udp| !upserted.contains(&udp.nb_uuid))
            .any(|udp| match self.output.find(&udp.nb_uuid) {
                None => true,
                Some(sdp) => {
                    udp.requested_tunnel_key != sdp.tunnel_key
                        && freed.contains(&udp.requested_tunnel_key)
                }
            });
        !waiting
    }

    /// Applies collector deltas without rescanning the southbound table.
    ///
    /// Deletions from every collector are applied before any insertion or
    /// update. Returns `Unhandled` if the engine never ran, a collector was
    /// recomputed, or the deltas move keys in a way only a full run
    /// resolves.
    #[instrument(skip_all)]
    pub fn handle_datapath_changes(
        &mut self,
        input: DatapathSyncInput<'_>,
    ) -> EngineResult<HandlerResult> {
        let DatapathSyncInput { maps, sb, config } = input;
        if !self.has_run || maps.iter().any(|map| !map.dps.is_tracked()) {
            return Ok(HandlerResult::Unhandled);
        }

        let deleted: Vec<&Uuid> = maps
            .iter()
            .flat_map(|map| map.dps.changes().deleted.keys())
            .collect();
        let upserts: Vec<&UnsyncedDatapath> = maps
            .iter()
            .flat_map(|map| {
                let changes = map.dps.changes();
                changes
                    .new
                    .iter()
                    .chain(changes.updated.iter())
                    .filter_map(move |nb_uuid| map.find(nb_uuid))
            })
            .collect();

        if !self.keys_match_full_run(&maps, &deleted, &upserts) {
            return Ok(HandlerResult::Unhandled);
        }

        let mut changed = false;
        for nb_uuid in deleted {
            changed |= self.remove_datapath(sb, nb_uuid)?;
        }
        for udp in upserts {
            changed |= self.upsert_datapath(sb, udp, config)?;
        }

        debug!(changed, "handled datapath collector changes");
        Ok(HandlerResult::handled(changed))
    }

    fn remove_datapath(&mut self, sb: &mut SbDb, nb_uuid: &Uuid) -> EngineResult<bool> {
        let removed = match self.output.synced.remove(nb_uuid) {
            Some(sdp) => Some(sdp),
            None => self.output.pending.remove(nb_uuid),
        };
        let Some(sdp) = removed else {
            return Ok(false);
        };

        self.dp_tnlids.remove(sdp.tunnel_key);
        if sb.datapath_bindings.contains(&sdp.sb_row) {
            sb.datapath_bindings.delete(&sdp.sb_row)?;
        }
        debug!(name = %sdp.name, key = sdp.tunnel_key, "removed datapath");
        Ok(true)
    }

    fn upsert_datapath(
        &mut self,
        sb: &mut SbDb,
        udp: &UnsyncedDatapath,
        config: &NorthdConfig,
    ) -> EngineResult<bool> {
        let (current, pending) = match self.output.synced.get(&udp.nb_uuid) {
            Some(sdp) => (Some(sdp.clone()), false),
            None => (self.output.pending.get(&udp.nb_uuid).cloned(), true),
        };

        let Some(current) = current else {
            return self.add_datapath(sb, udp, config);
        };

        let mut key = current.tunnel_key;
        let requested = udp.requested_tunnel_key;
        if requested != 0 && requested != key {
            if self.dp_tnlids.add(requested) {
                self.dp_tnlids.remove(key);
                key = requested;
            } else {
                self.warn_conflict(udp, requested);
            }
        }

        sb.datapath_bindings.update(&current.sb_row, |dp| {
            dp.tunnel_key = key;
            dp.external_ids = udp.external_ids.clone();
        })?;

        let next = synced_from(udp, current.sb_row, key);
        if pending {
            let changed = next != current;
            self.output.pending.insert(udp.nb_uuid, next);
            Ok(changed)
        } else {
            Ok(self.output.synced.insert(udp.nb_uuid, next))
        }
    }

    fn add_datapath(
        &mut self,
        sb: &mut SbDb,
        udp: &UnsyncedDatapath,
        config: &NorthdConfig,
    ) -> EngineResult<bool> {
        let sb_row = sb.datapath_bindings.insert(new_binding(udp));

        let requested = udp.requested_tunnel_key;
        let mut key = None;
        if requested != 0 {
            if self.dp_tnlids.add(requested) {
                key = Some(requested);
            } else {
                self.warn_conflict(udp, requested);
            }
        }
        let key = match key {
            Some(key) => Some(key),
            None => self
                .dp_tnlids
                .allocate(OVN_MIN_DP_KEY_LOCAL, config.max_dp_tunnel_id()),
        };

        let Some(key) = key else {
            self.warn_exhausted(udp);
            sb.datapath_bindings.delete(&sb_row)?;
            return Ok(false);
        };

        sb.datapath_bindings.update(&sb_row, |dp| dp.tunnel_key = key)?;
        self.output
            .pending
            .insert(udp.nb_uuid, synced_from(udp, sb_row, key));
        debug!(name = %udp.name, key, "added pending datapath");
        Ok(true)
    }

    /// Reacts to tracked `Datapath_Binding` changes.
    ///
    /// Graduates pending datapaths whose rows the database now reports.
    /// Changes the engine did not make itself cannot be reconciled
    /// incrementally and yield `Unhandled`.
    #[instrument(skip_all)]
    pub fn handle_sb_datapath_binding(&mut self, sb: &SbDb) -> HandlerResult {
        if !self.has_run {
            return HandlerResult::Unhandled;
        }

        let mut changed = false;
        for tracked in sb.datapath_bindings.tracked() {
            let owner = self
                .output
                .find_by_row(&tracked.id)
                .map(|(sdp, pending)| (sdp.nb_uuid, pending));

            match (tracked.kind, owner) {
                (ChangeKind::Deleted, None) => {}
                (ChangeKind::Deleted, Some(_)) => {
                    debug!(row = %tracked.id, "bound Datapath_Binding deleted");
                    return HandlerResult::Unhandled;
                }
                (ChangeKind::New, Some((nb_uuid, true))) => {
                    if sb.datapath_bindings.is_new_in_txn(&tracked.id) {
                        continue;
                    }
                    let Some(sdp) = self.output.pending.remove(&nb_uuid) else {
                        continue;
                    };
                    if !row_matches(tracked.row, &sdp) {
                        self.output.pending.insert(sdp.nb_uuid, sdp);
                        return HandlerResult::Unhandled;
                    }
                    debug!(name = %sdp.name, key = sdp.tunnel_key, "graduated pending datapath");
                    self.output.synced.insert(sdp.nb_uuid, sdp);
                    changed = true;
                }
                (_, owner) => {
                    let ours = owner.and_then(|(nb_uuid, _)| self.output.find(&nb_uuid));
                    match ours {
                        Some(sdp) if row_matches(tracked.row, sdp) => {}
                        _ => return HandlerResult::Unhandled,
                    }
                }
            }
        }

        HandlerResult::handled(changed)
    }
}

impl EngineNode for DatapathSync {
    type Input<'a> = DatapathSyncInput<'a>;

    fn name(&self) -> &'static str {
        "datapath_sync"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let DatapathSyncInput { maps, sb, config } = input;

        let previous_pending = std::mem::take(&mut self.output.pending);
        let had_recreated = !self.output.recreated.is_empty();
        self.output.recreated.clear();
        self.dp_tnlids = TunnelKeySet::new();

        let (mut candidates, mut legacy) = self.claim_rows(&maps, sb)?;
        self.assign_keys(&mut candidates, config.max_dp_tunnel_id());

        let mut synced = Vec::with_capacity(candidates.len());
        let mut pending = BTreeMap::new();
        for candidate in &candidates {
            let udp = candidate.udp;
            let Some(key) = candidate.key else {
                self.warn_exhausted(udp);
                sb.datapath_bindings.delete(&candidate.sb_row)?;
                // No replacement row: the legacy rows go away with nothing
                // to move their references to.
                for (old_row, _) in legacy.remove(&udp.nb_uuid).unwrap_or_default() {
                    sb.datapath_bindings.delete(&old_row)?;
                }
                continue;
            };

            sb.datapath_bindings
                .update(&candidate.sb_row, |dp| dp.tunnel_key = key)?;
            let sdp = synced_from(udp, candidate.sb_row, key);
            if candidate.inserted {
                pending.insert(udp.nb_uuid, sdp);
            } else {
                synced.push((udp.nb_uuid, sdp));
            }
        }

        for (nb_uuid, rows) in legacy {
            for (old_row, _) in rows {
                self.output.recreated.push(RecreatedDatapath { old_row, nb_uuid });
            }
        }

        let synced_changed = self.output.synced.replace_all(synced);
        let pending_changed = pending != previous_pending;
        self.output.pending = pending;
        self.has_run = true;

        info!(
            synced = self.output.synced.len(),
            pending = self.output.pending.len(),
            recreated = self.output.recreated.len(),
            "datapath sync complete"
        );

        if synced_changed || pending_changed || had_recreated || !self.output.recreated.is_empty() {
            Ok(NodeState::Updated)
        } else {
            Ok(NodeState::Unchanged)
        }
    }

    fn clear_tracked_data(&mut self) {
        self.output.synced.clear_tracked();
        self.output.recreated.clear();
    }

    fn cleanup(&mut self) {
        self.output = SyncedDatapaths::default();
        self.dp_tnlids = TunnelKeySet::new();
        self.has_run = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovn_db::sb::DatapathType;
    use ovn_db::{smap, Smap};
    use pretty_assertions::assert_eq;

    fn udp(kind: DatapathKind, name: &str, requested: u32) -> UnsyncedDatapath {
        UnsyncedDatapath {
            nb_uuid: Uuid::new_v4(),
            kind,
            name: name.to_string(),
            requested_tunnel_key: requested,
            external_ids: smap([("name", name)]),
        }
    }

    fn maps(dps: &[UnsyncedDatapath]) -> (UnsyncedDatapathMap, UnsyncedDatapathMap) {
        let mut switches = UnsyncedDatapathMap::new(DatapathKind::Switch);
        let mut routers = UnsyncedDatapathMap::new(DatapathKind::Router);
        for dp in dps {
            let map = match dp.kind {
                DatapathKind::Switch => &mut switches,
                DatapathKind::Router => &mut routers,
            };
            map.dps.insert(dp.nb_uuid, dp.clone());
        }
        (switches, routers)
    }

    fn run(
        node: &mut DatapathSync,
        maps: &(UnsyncedDatapathMap, UnsyncedDatapathMap),
        sb: &mut SbDb,
        config: &NorthdConfig,
    ) -> NodeState {
        node.run(DatapathSyncInput {
            maps: [&maps.0, &maps.1],
            sb,
            config,
        })
        .unwrap()
    }

    fn key_of(sb: &SbDb, nb_uuid: &Uuid) -> u32 {
        sb.datapath_binding_for_nb_uuid(nb_uuid).unwrap().1.tunnel_key
    }

    #[test]
    fn test_requested_key_honored() {
        let sw1 = udp(DatapathKind::Switch, "sw1", 0);
        let sw2 = udp(DatapathKind::Switch, "sw2", 5);
        let maps = maps(&[sw1.clone(), sw2.clone()]);
        let mut sb = SbDb::new();
        let config = NorthdConfig::new();
        let mut node = DatapathSync::new();

        assert_eq!(run(&mut node, &maps, &mut sb, &config), NodeState::Updated);

        assert_eq!(sb.datapath_bindings.len(), 2);
        assert_eq!(key_of(&sb, &sw2.nb_uuid), 5);
        let k1 = key_of(&sb, &sw1.nb_uuid);
        assert_ne!(k1, 5);
        assert!((OVN_MIN_DP_KEY_LOCAL..=config.max_dp_tunnel_id()).contains(&k1));
        assert_eq!(node.output().pending.len(), 2);
        assert!(node.output().synced.is_empty());
    }

    #[test]
    fn test_rerun_graduates_and_is_stable() {
        let sw1 = udp(DatapathKind::Switch, "sw1", 0);
        let lr1 = udp(DatapathKind::Router, "lr1", 0);
        let maps = maps(&[sw1.clone(), lr1.clone()]);
        let mut sb = SbDb::new();
        let config = NorthdConfig::new();
        let mut node = DatapathSync::new();

        run(&mut node, &maps, &mut sb, &config);
        let before: Vec<_> = sb.datapath_bindings.iter().map(|(id, dp)| (id, dp.clone())).collect();
        node.clear_tracked_data();

        run(&mut node, &maps, &mut sb, &config);
        let after: Vec<_> = sb.datapath_bindings.iter().map(|(id, dp)| (id, dp.clone())).collect();

        assert_eq!(before, after);
        assert!(node.output().pending.is_empty());
        assert_eq!(node.output().synced.len(), 2);
        assert_eq!(
            node.output().synced.get(&lr1.nb_uuid).unwrap().kind,
            DatapathKind::Router
        );
    }

    #[test]
    fn test_orphans_and_duplicates_deleted() {
        let sw1 = udp(DatapathKind::Switch, "sw1", 0);
        let maps = maps(&[sw1.clone()]);
        let mut sb = SbDb::new();
        let orphan = sb.datapath_bindings.insert(DatapathBinding {
            tunnel_key: 9,
            nb_uuid: Some(Uuid::new_v4()),
            ..Default::default()
        });
        for key in [3, 4] {
            sb.datapath_bindings.insert(DatapathBinding {
                tunnel_key: key,
                nb_uuid: Some(sw1.nb_uuid),
                ..Default::default()
            });
        }

        let mut node = DatapathSync::new();
        run(&mut node, &maps, &mut sb, &NorthdConfig::new());

        assert!(!sb.datapath_bindings.contains(&orphan));
        assert_eq!(sb.datapath_bindings.len(), 1);
        let (_, dp) = sb.datapath_binding_for_nb_uuid(&sw1.nb_uuid).unwrap();
        assert!(dp.tunnel_key == 3 || dp.tunnel_key == 4);
        assert_eq!(dp.external_ids, sw1.external_ids);
        assert_eq!(dp.datapath_type, Some(DatapathType::LogicalSwitch));
    }

    #[test]
    fn test_conflicting_request_falls_back() {
        let a = udp(DatapathKind::Switch, "a", 7);
        let b = udp(DatapathKind::Router, "b", 7);
        let maps = maps(&[a.clone(), b.clone()]);
        let mut sb = SbDb::new();
        let mut node = DatapathSync::new();
        run(&mut node, &maps, &mut sb, &NorthdConfig::new());

        let ka = key_of(&sb, &a.nb_uuid);
        let kb = key_of(&sb, &b.nb_uuid);
        assert_ne!(ka, kb);
        assert!(ka == 7 || kb == 7);
    }

    #[test]
    fn test_requested_key_preempts_existing() {
        let holder = udp(DatapathKind::Switch, "holder", 0);
        let wants = udp(DatapathKind::Switch, "wants", 2);
        let maps = maps(&[holder.clone(), wants.clone()]);
        let mut sb = SbDb::new();
        sb.datapath_bindings.insert(DatapathBinding {
            tunnel_key: 2,
            nb_uuid: Some(holder.nb_uuid),
            ..Default::default()
        });

        let mut node = DatapathSync::new();
        run(&mut node, &maps, &mut sb, &NorthdConfig::new());

        assert_eq!(key_of(&sb, &wants.nb_uuid), 2);
        assert_ne!(key_of(&sb, &holder.nb_uuid), 2);
    }

    #[test]
    fn test_exhausted_space_drops_row() {
        let dps: Vec<_> = (0..3)
            .map(|i| udp(DatapathKind::Switch, &format!("sw{i}"), 0))
            .collect();
        let maps = maps(&dps);
        let config = NorthdConfig {
            max_dp_tunnel_id: Some(2),
            ..Default::default()
        };
        let mut sb = SbDb::new();
        let mut node = DatapathSync::new();
        run(&mut node, &maps, &mut sb, &config);

        assert_eq!(sb.datapath_bindings.len(), 2);
        assert_eq!(node.output().total(), 2);
        let keys: Vec<_> = node.tunnel_keys().iter().collect();
        assert_eq!(keys, vec![1, 2]);
    }

    #[test]
    fn test_legacy_row_recreated() {
        let sw1 = udp(DatapathKind::Switch, "sw1", 0);
        let maps = maps(&[sw1.clone()]);
        let mut sb = SbDb::new();
        let old = sb.datapath_bindings.insert(DatapathBinding {
            tunnel_key: 42,
            external_ids: smap([("logical-switch", sw1.nb_uuid.to_string())]),
            ..Default::default()
        });

        let mut node = DatapathSync::new();
        run(&mut node, &maps, &mut sb, &NorthdConfig::new());

        assert!(sb.datapath_bindings.contains(&old));
        let (new_row, dp) = sb.datapath_binding_for_nb_uuid(&sw1.nb_uuid).unwrap();
        assert_ne!(new_row, old);
        assert_eq!(dp.tunnel_key, 42);
        assert_eq!(
            node.output().recreated,
            vec![RecreatedDatapath {
                old_row: old,
                nb_uuid: sw1.nb_uuid
            }]
        );
    }

    #[test]
    fn test_legacy_row_of_wrong_kind_is_orphan() {
        let sw1 = udp(DatapathKind::Switch, "sw1", 0);
        let maps = maps(&[sw1.clone()]);
        let mut sb = SbDb::new();
        let old = sb.datapath_bindings.insert(DatapathBinding {
            tunnel_key: 42,
            external_ids: smap([("logical-router", sw1.nb_uuid.to_string())]),
            ..Default::default()
        });

        let mut node = DatapathSync::new();
        run(&mut node, &maps, &mut sb, &NorthdConfig::new());

        assert!(!sb.datapath_bindings.contains(&old));
        assert!(node.output().recreated.is_empty());
    }

    #[test]
    fn test_handlers_require_prior_run() {
        let maps = maps(&[]);
        let mut sb = SbDb::new();
        let mut node = DatapathSync::new();
        let result = node
            .handle_datapath_changes(DatapathSyncInput {
                maps: [&maps.0, &maps.1],
                sb: &mut sb,
                config: &NorthdConfig::new(),
            })
            .unwrap();
        assert_eq!(result, HandlerResult::Unhandled);
        assert_eq!(node.handle_sb_datapath_binding(&sb), HandlerResult::Unhandled);
    }

    #[test]
    fn test_incremental_add_update_delete() {
        let sw1 = udp(DatapathKind::Switch, "sw1", 0);
        let sw2 = udp(DatapathKind::Switch, "sw2", 0);
        let (mut switches, mut routers) = maps(&[sw1.clone(), sw2.clone()]);
        let mut sb = SbDb::new();
        let config = NorthdConfig::new();
        let mut node = DatapathSync::new();

        node.run(DatapathSyncInput {
            maps: [&switches, &routers],
            sb: &mut sb,
            config: &config,
        })
        .unwrap();
        // Second run graduates the inserted rows.
        node.run(DatapathSyncInput {
            maps: [&switches, &routers],
            sb: &mut sb,
            config: &config,
        })
        .unwrap();
        node.clear_tracked_data();
        switches.dps.clear_tracked();
        routers.dps.clear_tracked();

        let sw3 = udp(DatapathKind::Switch, "sw3", 100);
        switches.dps.insert(sw3.nb_uuid, sw3.clone());
        switches.dps.remove(&sw2.nb_uuid);
        switches.dps.insert(
            sw1.nb_uuid,
            UnsyncedDatapath {
                requested_tunnel_key: 50,
                external_ids: smap([("name", "sw1"), ("name2", "net1")]),
                ..sw1.clone()
            },
        );

        let result = node
            .handle_datapath_changes(DatapathSyncInput {
                maps: [&switches, &routers],
                sb: &mut sb,
                config: &config,
            })
            .unwrap();
        assert_eq!(result, HandlerResult::HandledUpdated);

        assert!(sb.datapath_binding_for_nb_uuid(&sw2.nb_uuid).is_none());
        assert_eq!(key_of(&sb, &sw3.nb_uuid), 100);
        assert_eq!(key_of(&sb, &sw1.nb_uuid), 50);
        assert!(node.output().pending.contains_key(&sw3.nb_uuid));

        let changes = node.output().synced.changes();
        assert!(changes.deleted.contains_key(&sw2.nb_uuid));
        assert!(changes.updated.contains(&sw1.nb_uuid));
        assert_eq!(
            node.output().synced.get(&sw1.nb_uuid).unwrap().external_ids,
            smap([("name", "sw1"), ("name2", "net1")])
        );
    }

    fn converged(
        dps: &[UnsyncedDatapath],
        config: &NorthdConfig,
    ) -> (UnsyncedDatapathMap, UnsyncedDatapathMap, SbDb, DatapathSync) {
        let (mut switches, mut routers) = maps(dps);
        let mut sb = SbDb::new();
        let mut node = DatapathSync::new();
        for _ in 0..2 {
            node.run(DatapathSyncInput {
                maps: [&switches, &routers],
                sb: &mut sb,
                config,
            })
            .unwrap();
        }
        node.clear_tracked_data();
        switches.dps.clear_tracked();
        routers.dps.clear_tracked();
        (switches, routers, sb, node)
    }

    #[test]
    fn test_request_for_held_key_declined() {
        let config = NorthdConfig::new();
        let holder = udp(DatapathKind::Switch, "holder", 0);
        let (mut switches, routers, mut sb, mut node) = converged(&[holder.clone()], &config);
        let held = key_of(&sb, &holder.nb_uuid);
        let before = sb.datapath_bindings.len();

        let wants = udp(DatapathKind::Switch, "wants", held);
        switches.dps.insert(wants.nb_uuid, wants.clone());
        let result = node
            .handle_datapath_changes(DatapathSyncInput {
                maps: [&switches, &routers],
                sb: &mut sb,
                config: &config,
            })
            .unwrap();

        assert_eq!(result, HandlerResult::Unhandled);
        assert_eq!(sb.datapath_bindings.len(), before);
        assert!(node.output().find(&wants.nb_uuid).is_none());

        node.run(DatapathSyncInput {
            maps: [&switches, &routers],
            sb: &mut sb,
            config: &config,
        })
        .unwrap();
        assert_eq!(key_of(&sb, &wants.nb_uuid), held);
        assert_ne!(key_of(&sb, &holder.nb_uuid), held);
    }

    #[test]
    fn test_deletions_applied_before_insertions() {
        let config = NorthdConfig::new();
        let lr = udp(DatapathKind::Router, "lr", 5);
        let (mut switches, mut routers, mut sb, mut node) = converged(&[lr.clone()], &config);
        assert_eq!(key_of(&sb, &lr.nb_uuid), 5);

        let sw = udp(DatapathKind::Switch, "sw", 5);
        switches.dps.insert(sw.nb_uuid, sw.clone());
        routers.dps.remove(&lr.nb_uuid);
        let result = node
            .handle_datapath_changes(DatapathSyncInput {
                maps: [&switches, &routers],
                sb: &mut sb,
                config: &config,
            })
            .unwrap();

        assert_eq!(result, HandlerResult::HandledUpdated);
        assert_eq!(key_of(&sb, &sw.nb_uuid), 5);
        assert!(sb.datapath_binding_for_nb_uuid(&lr.nb_uuid).is_none());
    }

    #[test]
    fn test_freed_key_for_waiting_request_declined() {
        let config = NorthdConfig::new();
        let a = udp(DatapathKind::Switch, "a", 7);
        let b = udp(DatapathKind::Switch, "b", 7);
        let (mut switches, routers, mut sb, mut node) =
            converged(&[a.clone(), b.clone()], &config);
        let (winner, loser) = if key_of(&sb, &a.nb_uuid) == 7 {
            (a, b)
        } else {
            (b, a)
        };
        assert_ne!(key_of(&sb, &loser.nb_uuid), 7);

        switches.dps.remove(&winner.nb_uuid);
        let result = node
            .handle_datapath_changes(DatapathSyncInput {
                maps: [&switches, &routers],
                sb: &mut sb,
                config: &config,
            })
            .unwrap();
        assert_eq!(result, HandlerResult::Unhandled);

        node.run(DatapathSyncInput {
            maps: [&switches, &routers],
            sb: &mut sb,
            config: &config,
        })
        .unwrap();
        assert_eq!(key_of(&sb, &loser.nb_uuid), 7);
    }

    #[test]
    fn test_sb_handler_graduates_pending() {
        let sw1 = udp(DatapathKind::Switch, "sw1", 0);
        let maps = maps(&[sw1.clone()]);
        let mut sb = SbDb::new();
        let config = NorthdConfig::new();
        let mut node = DatapathSync::new();

        sb.begin().unwrap();
        run(&mut node, &maps, &mut sb, &config);
        sb.clear_tracked();
        sb.commit().unwrap();
        node.clear_tracked_data();

        assert_eq!(node.handle_sb_datapath_binding(&sb), HandlerResult::HandledUpdated);
        assert!(node.output().pending.is_empty());
        assert!(node.output().synced.changes().new.contains(&sw1.nb_uuid));
    }

    #[test]
    fn test_sb_handler_rejects_foreign_changes() {
        let sw1 = udp(DatapathKind::Switch, "sw1", 0);
        let maps = maps(&[sw1.clone()]);
        let mut sb = SbDb::new();
        let config = NorthdConfig::new();
        let mut node = DatapathSync::new();
        run(&mut node, &maps, &mut sb, &config);
        run(&mut node, &maps, &mut sb, &config);
        sb.clear_tracked();
        node.clear_tracked_data();

        let (row, _) = sb.datapath_binding_for_nb_uuid(&sw1.nb_uuid).unwrap();
        sb.datapath_bindings
            .update(&row, |dp| dp.external_ids = Smap::new())
            .unwrap();
        assert_eq!(node.handle_sb_datapath_binding(&sb), HandlerResult::Unhandled);

        sb.clear_tracked();
        sb.datapath_bindings.insert(DatapathBinding::default());
        assert_eq!(node.handle_sb_datapath_binding(&sb), HandlerResult::Unhandled);
    }
}
