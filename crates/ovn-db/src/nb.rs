//! Northbound (desired state) database.
//!
//! Row identities double as the logical entities' stable UUIDs.

use serde::{Deserialize, Serialize};

use crate::error::DbResult;
use crate::smap::Smap;
use crate::table::{begin_all, for_each_table, Row, RowId, Table, TxnTable};

/// `Logical_Switch` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicalSwitch {
    pub name: String,
    /// References to `Logical_Switch_Port` rows.
    pub ports: Vec<RowId>,
    pub other_config: Smap,
}

impl Row for LogicalSwitch {
    const TABLE: &'static str = "Logical_Switch";
}

/// `Logical_Router` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicalRouter {
    pub name: String,
    /// Unset means enabled.
    pub enabled: Option<bool>,
    /// References to `Logical_Router_Port` rows.
    pub ports: Vec<RowId>,
    pub options: Smap,
}

impl LogicalRouter {
    /// Returns false only when `enabled` is explicitly false.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

impl Row for LogicalRouter {
    const TABLE: &'static str = "Logical_Router";
}

/// `Logical_Switch_Port` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicalSwitchPort {
    pub name: String,
    /// Port type: empty for a VIF, or `router`, `localnet`, `localport`...
    #[serde(rename = "type")]
    pub port_type: String,
    pub options: Smap,
    pub external_ids: Smap,
    pub up: Option<bool>,
    /// References to `Mirror` rows.
    pub mirror_rules: Vec<RowId>,
}

impl Row for LogicalSwitchPort {
    const TABLE: &'static str = "Logical_Switch_Port";
}

/// `Logical_Router_Port` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicalRouterPort {
    pub name: String,
    pub options: Smap,
    pub external_ids: Smap,
    /// Gateway chassis names.
    pub gateway_chassis: Vec<String>,
    pub ha_chassis_group: Option<String>,
}

impl LogicalRouterPort {
    /// Returns true for a distributed gateway port.
    pub fn is_gateway_port(&self) -> bool {
        self.ha_chassis_group.is_some() || !self.gateway_chassis.is_empty()
    }
}

impl Row for LogicalRouterPort {
    const TABLE: &'static str = "Logical_Router_Port";
}

/// `Mirror` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mirror {
    pub name: String,
    /// `gre`, `erspan`, `local` or `lport`.
    #[serde(rename = "type")]
    pub mirror_type: String,
    pub sink: String,
}

impl Row for Mirror {
    const TABLE: &'static str = "Mirror";
}

/// The northbound database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NbDb {
    pub logical_switches: Table<LogicalSwitch>,
    pub logical_routers: Table<LogicalRouter>,
    pub logical_switch_ports: Table<LogicalSwitchPort>,
    pub logical_router_ports: Table<LogicalRouterPort>,
    pub mirrors: Table<Mirror>,
}

impl NbDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON snapshot. Every loaded row is tracked as new.
    pub fn from_json(json: &str) -> DbResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Renders the database as pretty-printed JSON.
    pub fn to_json_pretty(&self) -> DbResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn tables(&mut self) -> [&mut dyn TxnTable; 5] {
        [
            &mut self.logical_switches,
            &mut self.logical_routers,
            &mut self.logical_switch_ports,
            &mut self.logical_router_ports,
            &mut self.mirrors,
        ]
    }

    /// Opens a transaction on every table.
    pub fn begin(&mut self) -> DbResult<()> {
        begin_all(&mut self.tables())
    }

    /// Commits the open transaction. Returns true if anything changed.
    pub fn commit(&mut self) -> DbResult<bool> {
        let mut changed = false;
        for_each_table(&mut self.tables(), |t| {
            changed |= t.commit()?;
            Ok(())
        })?;
        Ok(changed)
    }

    /// Rolls back the open transaction.
    pub fn abort(&mut self) -> DbResult<()> {
        for_each_table(&mut self.tables(), |t| t.abort())
    }

    /// Drops tracked changes of every table.
    pub fn clear_tracked(&mut self) {
        for table in self.tables() {
            table.clear_tracked();
        }
    }

    /// Returns true if any table has tracked changes.
    pub fn has_tracked_changes(&self) -> bool {
        self.logical_switches.has_tracked_changes()
            || self.logical_routers.has_tracked_changes()
            || self.logical_switch_ports.has_tracked_changes()
            || self.logical_router_ports.has_tracked_changes()
            || self.mirrors.has_tracked_changes()
    }

    /// Returns true if any port-level table has tracked changes.
    pub fn has_tracked_port_changes(&self) -> bool {
        self.logical_switch_ports.has_tracked_changes()
            || self.logical_router_ports.has_tracked_changes()
            || self.mirrors.has_tracked_changes()
    }

    /// Returns the switch ports of a switch, skipping dangling references.
    pub fn switch_ports<'a>(
        &'a self,
        ls: &'a LogicalSwitch,
    ) -> impl Iterator<Item = (RowId, &'a LogicalSwitchPort)> + 'a {
        ls.ports
            .iter()
            .filter_map(move |id| self.logical_switch_ports.get(id).map(|lsp| (*id, lsp)))
    }

    /// Returns the router ports of a router, skipping dangling references.
    pub fn router_ports<'a>(
        &'a self,
        lr: &'a LogicalRouter,
    ) -> impl Iterator<Item = (RowId, &'a LogicalRouterPort)> + 'a {
        lr.ports
            .iter()
            .filter_map(move |id| self.logical_router_ports.get(id).map(|lrp| (*id, lrp)))
    }
}
