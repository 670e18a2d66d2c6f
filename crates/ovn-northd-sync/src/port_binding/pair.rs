//! Port binding pairing engine.
//!
//! Pairs every collected [`UnpairedPortBinding`] with one southbound
//! `Port_Binding` row and gives it a tunnel key unique within its
//! datapath. The structure follows the datapath sync engine, with these
//! differences:
//!
//! - a row is matched by `logical_port`, trying the kinds in priority
//!   order; the first kind whose callbacks accept the row wins;
//! - a row whose port moved to another datapath is deleted and recreated;
//! - each datapath has its own key scope;
//! - stale `FDB` entries are swept once keys are known;
//! - a row on a pending datapath is kept only while it names a northbound
//!   port of that datapath, since those ports are not collected until the
//!   datapath is confirmed.

use std::collections::{BTreeMap, BTreeSet};

use ovn_db::sb::PortBinding;
use ovn_db::{ChangeKind, RowId, SbDb};
use ovn_inc_common::{
    info_rl, warn_rl, EngineNode, EngineResult, HandlerResult, NodeState, RateLimiter,
};
use tracing::{debug, info, instrument};

use super::types::{
    PairedPortBinding, PairedPortBindings, PendingDatapathPorts, PortBindingKind,
    UnpairedPortBinding, UnpairedPortBindingMap,
};
use crate::config::{NorthdConfig, OVN_MIN_PORT_KEY, OVN_VXLAN_MIN_MULTICAST};

/// Inputs of the pairing engine.
pub struct PortBindingPairInput<'a> {
    /// One map per kind, in [`PortBindingKind::ALL`] order.
    pub maps: [&'a UnpairedPortBindingMap; 4],
    pub sb: &'a mut SbDb,
    pub config: &'a NorthdConfig,
    /// Ports of datapaths inserted but not yet confirmed, keyed by the
    /// datapath row.
    pub pending: &'a BTreeMap<RowId, PendingDatapathPorts>,
}

struct Candidate<'a> {
    upb: &'a UnpairedPortBinding,
    sb_row: RowId,
    existing_key: u32,
    key: Option<u32>,
}

/// The port binding pairing engine node.
#[derive(Debug)]
pub struct PortBindingPair {
    output: PairedPortBindings,
    /// Port keys that may still appear on each pending datapath, keyed by
    /// datapath key.
    pending_keys: BTreeMap<u32, BTreeSet<u32>>,
    has_run: bool,
    duplicate_rl: RateLimiter,
    duplicate_port_rl: RateLimiter,
    vxlan_rl: RateLimiter,
    conflict_rl: RateLimiter,
    exhausted_rl: RateLimiter,
}

impl Default for PortBindingPair {
    fn default() -> Self {
        Self::new()
    }
}

impl PortBindingPair {
    pub fn new() -> Self {
        Self {
            output: PairedPortBindings::default(),
            pending_keys: BTreeMap::new(),
            has_run: false,
            duplicate_rl: RateLimiter::new(1, 5),
            duplicate_port_rl: RateLimiter::new(1, 5),
            vxlan_rl: RateLimiter::new(1, 1),
            conflict_rl: RateLimiter::new(1, 1),
            exhausted_rl: RateLimiter::new(1, 1),
        }
    }

    /// Returns the engine output.
    pub fn output(&self) -> &PairedPortBindings {
        &self.output
    }

    fn fdb_is_stale(&self, dp_key: u32, port_key: u32) -> bool {
        let pending = self
            .pending_keys
            .get(&dp_key)
            .is_some_and(|keys| keys.contains(&port_key));
        !pending && !self.output.key_present(dp_key, port_key)
    }

    /// Claims southbound rows and inserts rows for unclaimed ports.
    fn collect_candidates<'a>(
        &mut self,
        maps: &[&'a UnpairedPortBindingMap; 4],
        sb: &mut SbDb,
        pending: &BTreeMap<RowId, PendingDatapathPorts>,
    ) -> EngineResult<Vec<Candidate<'a>>> {
        self.pending_keys = pending
            .values()
            .map(|ports| (ports.tunnel_key, ports.requested_keys.clone()))
            .collect();

        let mut candidates = Vec::new();
        let mut visited: BTreeMap<String, PortBindingKind> = BTreeMap::new();

        for row_id in sb.port_bindings.ids() {
            let row = sb.port_bindings.try_get(&row_id)?;
            let upb = maps.iter().copied().find_map(|map| map.find_valid(row));
            let datapath = row.datapath;
            let existing_key = row.tunnel_key;

            let Some(upb) = upb else {
                let awaited = pending
                    .get(&datapath)
                    .filter(|ports| ports.names.contains(&row.logical_port));
                if let Some(ports) = awaited {
                    if existing_key != 0 {
                        self.pending_keys
                            .entry(ports.tunnel_key)
                            .or_default()
                            .insert(existing_key);
                    }
                    continue;
                }
                debug!(row = %row_id, "deleting orphaned Port_Binding");
                sb.port_bindings.delete(&row_id)?;
                continue;
            };

            if upb.sb_datapath != datapath {
                debug!(port = %upb.name, "port moved to another datapath, recreating binding");
                sb.port_bindings.delete(&row_id)?;
                continue;
            }

            if visited.contains_key(&upb.name) {
                info_rl!(
                    self.duplicate_rl,
                    "deleting port_binding {} with duplicate name {}",
                    row_id,
                    upb.name
                );
                sb.port_bindings.delete(&row_id)?;
                continue;
            }
            visited.insert(upb.name.clone(), upb.kind);

            sb.port_bindings.update(&row_id, |pb| {
                pb.logical_port = upb.name.clone();
                pb.external_ids = upb.external_ids.clone();
            })?;
            self.output.tunnel_key_maps.entry(upb.dp_tunnel_key).or_default();
            candidates.push(Candidate {
                upb,
                sb_row: row_id,
                existing_key,
                key: None,
            });
        }

        for map in maps.iter().copied() {
            for upb in map.ports.values() {
                if let Some(kind) = visited.get(&upb.name) {
                    if *kind != upb.kind {
                        warn_rl!(self.duplicate_port_rl, "duplicate logical port {}", upb.name);
                    }
                    continue;
                }
                visited.insert(upb.name.clone(), upb.kind);

                let sb_row = sb.port_bindings.insert(PortBinding {
                    logical_port: upb.name.clone(),
                    datapath: upb.sb_datapath,
                    external_ids: upb.external_ids.clone(),
                    ..Default::default()
                });
                self.output.tunnel_key_maps.entry(upb.dp_tunnel_key).or_default();
                candidates.push(Candidate {
                    upb,
                    sb_row,
                    existing_key: 0,
                    key: None,
                });
            }
        }

        Ok(candidates)
    }

    fn assign_keys(&mut self, candidates: &mut [Candidate<'_>], config: &NorthdConfig) {
        for candidate in candidates.iter_mut() {
            let requested = candidate.upb.requested_tunnel_key;
            if requested == 0 {
                continue;
            }
            if config.vxlan_mode && requested >= OVN_VXLAN_MIN_MULTICAST {
                warn_rl!(
                    self.vxlan_rl,
                    "Tunnel key {} for port {} is incompatible with VXLAN",
                    requested,
                    candidate.upb.name
                );
                continue;
            }
            let keys = self
                .output
                .tunnel_key_maps
                .entry(candidate.upb.dp_tunnel_key)
                .or_default();
            if keys.add(requested) {
                candidate.key = Some(requested);
            } else {
                warn_rl!(
                    self.conflict_rl,
                    "Logical port_binding {} requests same tunnel key {} as another logical port_binding on the same datapath",
                    candidate.upb.name,
                    requested
                );
            }
        }

        for candidate in candidates.iter_mut() {
            if candidate.key.is_some() || candidate.existing_key == 0 {
                continue;
            }
            let keys = self
                .output
                .tunnel_key_maps
                .entry(candidate.upb.dp_tunnel_key)
                .or_default();
            if keys.add(candidate.existing_key) {
                candidate.key = Some(candidate.existing_key);
            }
        }

        let max_key = config.max_pb_tunnel_id();
        for candidate in candidates.iter_mut().filter(|c| c.key.is_none()) {
            candidate.key = self
                .output
                .tunnel_key_maps
                .entry(candidate.upb.dp_tunnel_key)
                .or_default()
                .allocate(OVN_MIN_PORT_KEY, max_key);
        }
    }

    /// Deletes `FDB` rows whose datapath and port keys are no longer paired.
    fn sweep_fdb(&self, sb: &mut SbDb) -> EngineResult<usize> {
        let stale: Vec<RowId> = sb
            .fdbs
            .iter()
            .filter(|(_, fdb)| self.fdb_is_stale(fdb.dp_key, fdb.port_key))
            .map(|(id, _)| id)
            .collect();
        for id in &stale {
            sb.fdbs.delete(id)?;
        }
        Ok(stale.len())
    }

    /// Sweeps only the tracked `FDB` rows.
    ///
    /// Never changes the engine output.
    #[instrument(skip_all)]
    pub fn handle_sb_fdb(&mut self, sb: &mut SbDb) -> EngineResult<HandlerResult> {
        if !self.has_run {
            return Ok(HandlerResult::Unhandled);
        }

        let stale: Vec<RowId> = sb
            .fdbs
            .tracked()
            .filter(|t| t.kind != ChangeKind::Deleted)
            .filter(|t| self.fdb_is_stale(t.row.dp_key, t.row.port_key))
            .map(|t| t.id)
            .collect();
        for id in &stale {
            sb.fdbs.delete(id)?;
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "deleted stale FDB entries");
        }
        Ok(HandlerResult::HandledUnchanged)
    }
}

impl EngineNode for PortBindingPair {
    type Input<'a> = PortBindingPairInput<'a>;

    fn name(&self) -> &'static str {
        "port_binding_pair"
    }

    #[instrument(skip_all)]
    fn run(&mut self, input: Self::Input<'_>) -> EngineResult<NodeState> {
        let PortBindingPairInput {
            maps,
            sb,
            config,
            pending,
        } = input;

        let previous = std::mem::take(&mut self.output);

        let mut candidates = self.collect_candidates(&maps, sb, pending)?;
        self.assign_keys(&mut candidates, config);
        let fdb_deleted = self.sweep_fdb(sb)?;

        for candidate in &candidates {
            let upb = candidate.upb;
            let Some(key) = candidate.key else {
                warn_rl!(
                    self.exhausted_rl,
                    "all port tunnel ids exhausted on datapath {}, dropping {}",
                    upb.dp_tunnel_key,
                    upb.name
                );
                sb.port_bindings.delete(&candidate.sb_row)?;
                continue;
            };

            sb.port_bindings
                .update(&candidate.sb_row, |pb| pb.tunnel_key = key)?;
            self.output.paired.insert(
                upb.name.clone(),
                PairedPortBinding {
                    name: upb.name.clone(),
                    kind: upb.kind,
                    cookie: upb.cookie.clone(),
                    sb_row: candidate.sb_row,
                    tunnel_key: key,
                    dp_tunnel_key: upb.dp_tunnel_key,
                },
            );
        }
        self.has_run = true;

        info!(
            paired = self.output.paired.len(),
            fdb_deleted, "port binding pairing complete"
        );

        if self.output.paired == previous.paired {
            Ok(NodeState::Unchanged)
        } else {
            Ok(NodeState::Updated)
        }
    }

    fn cleanup(&mut self) {
        self.output = PairedPortBindings::default();
        self.pending_keys.clear();
        self.has_run = false;
    }
}
