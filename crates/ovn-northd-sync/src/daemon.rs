//! Northd pass driver.
//!
//! [`Northd`] owns every node and runs them in dependency order:
//!
//! 1. datapath collectors (switches, routers)
//! 2. datapath sync, then the legacy reference rewriter
//! 3. synced datapath decoders
//! 4. port collectors (switch, router, chassis-redirect, mirror)
//! 5. port binding pairing
//! 6. paired port decoders
//!
//! A pass runs inside one northbound and one southbound transaction. For
//! each node the driver uses a change handler when upstream deltas are
//! available and falls back to a full run when the handler declines.

use std::collections::BTreeMap;

use ovn_db::{NbDb, SbDb, TxnTable};
use ovn_inc_common::{EngineNode, EngineResult, HandlerResult, NodeState, NodeStats};
use tracing::{debug, error, info, instrument};

use crate::config::NorthdConfig;
use crate::datapath::{
    legacy_update, DatapathLogicalRouter, DatapathLogicalSwitch, DatapathSync, DatapathSyncInput,
    LegacyUpdateStats, SyncedLogicalRouterMap, SyncedLogicalSwitchMap,
};
use crate::port_binding::{
    pending_datapath_ports, PairedChassisRedirectPorts, PairedDecodeInput, PairedLogicalRouterPorts,
    PairedLogicalSwitchPorts, PairedMirrorPorts, PortBindingChassisRedirect, PortBindingMirror,
    PendingDatapathPorts, PortBindingPair, PortBindingPairInput, PortBindingRouterPort,
    PortBindingSwitchPort, PortCollectorInput,
};

/// How a node was processed in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Full run.
    Recomputed(NodeState),
    /// A change handler applied the upstream deltas.
    Handled(NodeState),
    /// A change handler declined and the node was run instead.
    Fallback(NodeState),
    /// Nothing upstream changed.
    Skipped,
}

impl NodeOutcome {
    /// Returns the node state this outcome leaves behind.
    pub fn state(&self) -> NodeState {
        match self {
            NodeOutcome::Recomputed(state)
            | NodeOutcome::Handled(state)
            | NodeOutcome::Fallback(state) => *state,
            NodeOutcome::Skipped => NodeState::Unchanged,
        }
    }

    /// Returns true if the node ran from scratch.
    pub fn is_recompute(&self) -> bool {
        matches!(self, NodeOutcome::Recomputed(_) | NodeOutcome::Fallback(_))
    }
}

/// Summary of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Every node, in run order.
    pub nodes: Vec<(&'static str, NodeOutcome)>,
    /// Every node was forced to run.
    pub full_recompute: bool,
    pub legacy: LegacyUpdateStats,
    /// Confirmed datapaths.
    pub datapaths: usize,
    /// Datapaths inserted this pass or the last and not yet confirmed.
    pub pending_datapaths: usize,
    /// Paired port bindings.
    pub port_bindings: usize,
    /// The pass committed a change to either database.
    pub changed: bool,
}

impl PassReport {
    /// Returns the outcome of the named node.
    pub fn outcome(&self, node: &str) -> Option<NodeOutcome> {
        self.nodes
            .iter()
            .find(|(name, _)| *name == node)
            .map(|(_, outcome)| *outcome)
    }
}

/// Resolves a handler result, running the node when the handler declined.
fn resolve<F>(result: HandlerResult, run: F) -> EngineResult<NodeOutcome>
where
    F: FnOnce() -> EngineResult<NodeState>,
{
    match result.node_state() {
        Some(state) => Ok(NodeOutcome::Handled(state)),
        None => Ok(NodeOutcome::Fallback(run()?)),
    }
}

/// The northd reconciliation pipeline.
#[derive(Debug)]
pub struct Northd {
    config: NorthdConfig,
    force_full: bool,
    passes: u64,
    stats: BTreeMap<&'static str, NodeStats>,

    logical_switches: DatapathLogicalSwitch,
    logical_routers: DatapathLogicalRouter,
    datapath_sync: DatapathSync,
    synced_switches: SyncedLogicalSwitchMap,
    synced_routers: SyncedLogicalRouterMap,
    switch_ports: PortBindingSwitchPort,
    router_ports: PortBindingRouterPort,
    chassis_redirect_ports: PortBindingChassisRedirect,
    mirror_ports: PortBindingMirror,
    pair: PortBindingPair,
    paired_switch_ports: PairedLogicalSwitchPorts,
    paired_router_ports: PairedLogicalRouterPorts,
    paired_chassis_redirect_ports: PairedChassisRedirectPorts,
    paired_mirror_ports: PairedMirrorPorts,
}

impl Default for Northd {
    fn default() -> Self {
        Self::new(NorthdConfig::default())
    }
}

impl Northd {
    /// Creates a pipeline; the first pass recomputes every node.
    pub fn new(config: NorthdConfig) -> Self {
        Self {
            config,
            force_full: true,
            passes: 0,
            stats: BTreeMap::new(),
            logical_switches: DatapathLogicalSwitch::new(),
            logical_routers: DatapathLogicalRouter::new(),
            datapath_sync: DatapathSync::new(),
            synced_switches: SyncedLogicalSwitchMap::new(),
            synced_routers: SyncedLogicalRouterMap::new(),
            switch_ports: PortBindingSwitchPort::new(),
            router_ports: PortBindingRouterPort::new(),
            chassis_redirect_ports: PortBindingChassisRedirect::new(),
            mirror_ports: PortBindingMirror::new(),
            pair: PortBindingPair::new(),
            paired_switch_ports: PairedLogicalSwitchPorts::new(),
            paired_router_ports: PairedLogicalRouterPorts::new(),
            paired_chassis_redirect_ports: PairedChassisRedirectPorts::new(),
            paired_mirror_ports: PairedMirrorPorts::new(),
        }
    }

    pub fn config(&self) -> &NorthdConfig {
        &self.config
    }

    /// Replaces the configuration. A different configuration forces the
    /// next pass to recompute every node.
    pub fn set_config(&mut self, config: NorthdConfig) -> EngineResult<()> {
        config.validate()?;
        if config != self.config {
            info!(?config, "configuration changed, forcing full recompute");
            self.config = config;
            self.force_full = true;
        }
        Ok(())
    }

    /// Makes the next pass recompute every node, e.g. after the northbound
    /// database was reloaded wholesale.
    pub fn force_recompute(&mut self) {
        self.force_full = true;
    }

    /// Per-node run and handler counters.
    pub fn stats(&self) -> &BTreeMap<&'static str, NodeStats> {
        &self.stats
    }

    /// Number of committed passes.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn datapath_sync(&self) -> &DatapathSync {
        &self.datapath_sync
    }

    pub fn pair(&self) -> &PortBindingPair {
        &self.pair
    }

    pub fn paired_switch_ports(&self) -> &PairedLogicalSwitchPorts {
        &self.paired_switch_ports
    }

    pub fn paired_router_ports(&self) -> &PairedLogicalRouterPorts {
        &self.paired_router_ports
    }

    pub fn paired_chassis_redirect_ports(&self) -> &PairedChassisRedirectPorts {
        &self.paired_chassis_redirect_ports
    }

    pub fn paired_mirror_ports(&self) -> &PairedMirrorPorts {
        &self.paired_mirror_ports
    }

    fn record(&mut self, report: &mut PassReport, node: &'static str, outcome: NodeOutcome) {
        let stats = self.stats.entry(node).or_default();
        match outcome {
            NodeOutcome::Recomputed(_) => stats.record_run(),
            NodeOutcome::Handled(_) => stats.record_handler(true),
            NodeOutcome::Fallback(_) => {
                stats.record_handler(false);
                stats.record_run();
            }
            NodeOutcome::Skipped => {}
        }
        debug!(node, ?outcome, "node processed");
        report.nodes.push((node, outcome));
    }

    /// Runs one pass and commits it.
    ///
    /// On error both transactions are rolled back and the next pass
    /// recomputes every node.
    #[instrument(skip_all, fields(pass = self.passes + 1))]
    pub fn run_pass(&mut self, nb: &mut NbDb, sb: &mut SbDb) -> EngineResult<PassReport> {
        nb.begin()?;
        if let Err(err) = sb.begin() {
            nb.abort()?;
            return Err(err.into());
        }

        match self.run_nodes(nb, sb) {
            Ok(mut report) => {
                // Inputs are consumed; what this pass wrote becomes the
                // tracked changes of the next one.
                nb.clear_tracked();
                sb.clear_tracked();
                let nb_changed = nb.commit()?;
                let sb_changed = sb.commit()?;
                self.clear_tracked_data();

                self.force_full = false;
                self.passes += 1;
                report.changed = nb_changed || sb_changed;
                info!(
                    full = report.full_recompute,
                    datapaths = report.datapaths,
                    pending = report.pending_datapaths,
                    port_bindings = report.port_bindings,
                    changed = report.changed,
                    "pass complete"
                );
                Ok(report)
            }
            Err(err) => {
                error!(error = %err, "pass failed, rolling back");
                self.force_full = true;
                nb.abort()?;
                sb.abort()?;
                Err(err)
            }
        }
    }

    /// Runs passes until one commits nothing, at most `max_passes` times.
    pub fn run_until_quiescent(
        &mut self,
        nb: &mut NbDb,
        sb: &mut SbDb,
        max_passes: usize,
    ) -> EngineResult<Vec<PassReport>> {
        let mut reports = Vec::new();
        for _ in 0..max_passes {
            let report = self.run_pass(nb, sb)?;
            let changed = report.changed;
            reports.push(report);
            if !changed {
                break;
            }
        }
        Ok(reports)
    }

    fn clear_tracked_data(&mut self) {
        self.logical_switches.clear_tracked_data();
        self.logical_routers.clear_tracked_data();
        self.datapath_sync.clear_tracked_data();
        self.synced_switches.clear_tracked_data();
        self.synced_routers.clear_tracked_data();
        self.switch_ports.clear_tracked_data();
        self.router_ports.clear_tracked_data();
        self.chassis_redirect_ports.clear_tracked_data();
        self.mirror_ports.clear_tracked_data();
        self.pair.clear_tracked_data();
        self.paired_switch_ports.clear_tracked_data();
        self.paired_router_ports.clear_tracked_data();
        self.paired_chassis_redirect_ports.clear_tracked_data();
        self.paired_mirror_ports.clear_tracked_data();
    }

    /// Releases every node's data. The next pass recomputes everything.
    pub fn cleanup(&mut self) {
        self.logical_switches.cleanup();
        self.logical_routers.cleanup();
        self.datapath_sync.cleanup();
        self.synced_switches.cleanup();
        self.synced_routers.cleanup();
        self.switch_ports.cleanup();
        self.router_ports.cleanup();
        self.chassis_redirect_ports.cleanup();
        self.mirror_ports.cleanup();
        self.pair.cleanup();
        self.paired_switch_ports.cleanup();
        self.paired_router_ports.cleanup();
        self.paired_chassis_redirect_ports.cleanup();
        self.paired_mirror_ports.cleanup();
        self.force_full = true;
    }

    fn run_nodes(&mut self, nb: &mut NbDb, sb: &mut SbDb) -> EngineResult<PassReport> {
        let full = self.force_full;
        let mut report = PassReport {
            full_recompute: full,
            ..Default::default()
        };

        // Datapath collectors.
        let switches = if full {
            NodeOutcome::Recomputed(self.logical_switches.run((&*nb, &self.config))?)
        } else if nb.logical_switches.has_tracked_changes() {
            let result = self.logical_switches.handle_nb_logical_switch(nb, &self.config);
            resolve(result, || self.logical_switches.run((&*nb, &self.config)))?
        } else {
            NodeOutcome::Skipped
        };
        self.record(&mut report, "datapath_logical_switch", switches);

        let routers = if full {
            NodeOutcome::Recomputed(self.logical_routers.run(nb)?)
        } else if nb.logical_routers.has_tracked_changes() {
            let result = self.logical_routers.handle_nb_logical_router(nb);
            resolve(result, || self.logical_routers.run(nb))?
        } else {
            NodeOutcome::Skipped
        };
        self.record(&mut report, "datapath_logical_router", routers);

        // Datapath sync.
        let collectors_recomputed = switches.is_recompute() || routers.is_recompute();
        let collectors_updated =
            switches.state().is_updated() || routers.state().is_updated();
        let sync = if full || collectors_recomputed {
            NodeOutcome::Recomputed(self.run_datapath_sync(sb)?)
        } else {
            let mut state = NodeState::Unchanged;
            let mut handled = false;
            let mut declined = false;
            if sb.datapath_bindings.has_tracked_changes() {
                match self.datapath_sync.handle_sb_datapath_binding(sb).node_state() {
                    Some(s) => state = state.merge(s),
                    None => declined = true,
                }
                handled = true;
            }
            if !declined && collectors_updated {
                let input = DatapathSyncInput {
                    maps: [self.logical_switches.map(), self.logical_routers.map()],
                    sb: &mut *sb,
                    config: &self.config,
                };
                match self.datapath_sync.handle_datapath_changes(input)?.node_state() {
                    Some(s) => state = state.merge(s),
                    None => declined = true,
                }
                handled = true;
            }

            if declined {
                NodeOutcome::Fallback(self.run_datapath_sync(sb)?)
            } else if handled {
                NodeOutcome::Handled(state)
            } else {
                NodeOutcome::Skipped
            }
        };
        self.record(&mut report, "datapath_sync", sync);

        report.legacy = legacy_update::run(&self.datapath_sync.output().recreated, sb)?;

        // Synced datapath decoders.
        let dps = self.datapath_sync.output();
        let synced_switches = if full || sync.is_recompute() {
            NodeOutcome::Recomputed(self.synced_switches.run(dps)?)
        } else if sync.state().is_updated() {
            let result = self.synced_switches.handle_datapath_sync(dps);
            resolve(result, || self.synced_switches.run(dps))?
        } else {
            NodeOutcome::Skipped
        };
        let synced_routers = if full || sync.is_recompute() {
            NodeOutcome::Recomputed(self.synced_routers.run(dps)?)
        } else if sync.state().is_updated() {
            let result = self.synced_routers.handle_datapath_sync(dps);
            resolve(result, || self.synced_routers.run(dps))?
        } else {
            NodeOutcome::Skipped
        };
        self.record(&mut report, "synced_logical_switch_map", synced_switches);
        self.record(&mut report, "synced_logical_router_map", synced_routers);

        // Port collectors.
        let ports_dirty = full
            || synced_switches.state().is_updated()
            || synced_routers.state().is_updated()
            || nb.has_tracked_changes();
        let collectors = if ports_dirty {
            let input = PortCollectorInput {
                nb: &*nb,
                switches: &self.synced_switches,
                routers: &self.synced_routers,
            };
            [
                NodeOutcome::Recomputed(self.switch_ports.run(input)?),
                NodeOutcome::Recomputed(self.router_ports.run(input)?),
                NodeOutcome::Recomputed(self.chassis_redirect_ports.run(input)?),
                NodeOutcome::Recomputed(self.mirror_ports.run(input)?),
            ]
        } else {
            [NodeOutcome::Skipped; 4]
        };
        let collector_names = [
            "port_binding_logical_switch_port",
            "port_binding_logical_router_port",
            "port_binding_chassisredirect_port",
            "port_binding_mirror",
        ];
        for (name, outcome) in collector_names.into_iter().zip(collectors) {
            self.record(&mut report, name, outcome);
        }

        // Pairing.
        let pending = pending_datapath_ports(&*nb, self.datapath_sync.output().pending.values());
        let pair_dirty = full
            || collectors.iter().any(|o| o.state().is_updated())
            || sync.state().is_updated()
            || report.legacy.datapaths > 0
            || sb.port_bindings.has_tracked_changes();
        let pair = if pair_dirty {
            NodeOutcome::Recomputed(self.run_pair(sb, &pending)?)
        } else if sb.fdbs.has_tracked_changes() {
            let result = self.pair.handle_sb_fdb(sb)?;
            resolve(result, || self.run_pair(sb, &pending))?
        } else {
            NodeOutcome::Skipped
        };
        self.record(&mut report, "port_binding_pair", pair);

        // Paired decoders.
        if pair.is_recompute() {
            let paired = self.pair.output();
            let decoded = [
                self.paired_switch_ports.run(PairedDecodeInput {
                    paired,
                    nb: &mut *nb,
                    sb: &mut *sb,
                })?,
                self.paired_router_ports.run(PairedDecodeInput {
                    paired,
                    nb: &mut *nb,
                    sb: &mut *sb,
                })?,
                self.paired_chassis_redirect_ports.run(PairedDecodeInput {
                    paired,
                    nb: &mut *nb,
                    sb: &mut *sb,
                })?,
                self.paired_mirror_ports.run(PairedDecodeInput {
                    paired,
                    nb: &mut *nb,
                    sb: &mut *sb,
                })?,
            ];
            let decoder_names = [
                "port_binding_paired_logical_switch_port",
                "port_binding_paired_logical_router_port",
                "port_binding_paired_chassisredirect_port",
                "port_binding_paired_mirror",
            ];
            for (name, state) in decoder_names.into_iter().zip(decoded) {
                self.record(&mut report, name, NodeOutcome::Recomputed(state));
            }
        }

        report.datapaths = self.datapath_sync.output().synced.len();
        report.pending_datapaths = self.datapath_sync.output().pending.len();
        report.port_bindings = self.pair.output().len();
        Ok(report)
    }

    fn run_datapath_sync(&mut self, sb: &mut SbDb) -> EngineResult<NodeState> {
        self.datapath_sync.run(DatapathSyncInput {
            maps: [self.logical_switches.map(), self.logical_routers.map()],
            sb,
            config: &self.config,
        })
    }

    fn run_pair(
        &mut self,
        sb: &mut SbDb,
        pending: &BTreeMap<ovn_db::RowId, PendingDatapathPorts>,
    ) -> EngineResult<NodeState> {
        self.pair.run(PortBindingPairInput {
            maps: [
                self.switch_ports.map(),
                self.router_ports.map(),
                self.chassis_redirect_ports.map(),
                self.mirror_ports.map(),
            ],
            sb,
            config: &self.config,
            pending,
        })
    }
}
