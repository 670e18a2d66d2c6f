//! Southbound (realized state) database.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DbResult;
use crate::smap::{Smap, SmapExt};
use crate::table::{begin_all, for_each_table, Row, RowId, Table, TxnTable};

/// `external_ids` key carrying a switch's northbound UUID on legacy rows.
pub const EXTERNAL_ID_LOGICAL_SWITCH: &str = "logical-switch";
/// `external_ids` key carrying a router's northbound UUID on legacy rows.
pub const EXTERNAL_ID_LOGICAL_ROUTER: &str = "logical-router";

/// Value of the `Datapath_Binding` `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatapathType {
    LogicalSwitch,
    LogicalRouter,
}

impl DatapathType {
    /// Returns the column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatapathType::LogicalSwitch => "logical-switch",
            DatapathType::LogicalRouter => "logical-router",
        }
    }

    /// Returns the legacy `external_ids` key naming the northbound row.
    pub fn legacy_key(&self) -> &'static str {
        match self {
            DatapathType::LogicalSwitch => EXTERNAL_ID_LOGICAL_SWITCH,
            DatapathType::LogicalRouter => EXTERNAL_ID_LOGICAL_ROUTER,
        }
    }
}

/// `Datapath_Binding` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapathBinding {
    pub tunnel_key: u32,
    /// UUID of the northbound switch or router. Unset on legacy rows.
    pub nb_uuid: Option<Uuid>,
    #[serde(rename = "type")]
    pub datapath_type: Option<DatapathType>,
    pub external_ids: Smap,
}

impl DatapathBinding {
    /// Returns the northbound UUID recorded in `external_ids` by older
    /// writers, together with the datapath type it implies.
    pub fn legacy_nb_uuid(&self) -> Option<(DatapathType, Uuid)> {
        [DatapathType::LogicalSwitch, DatapathType::LogicalRouter]
            .into_iter()
            .find_map(|t| self.external_ids.get_uuid(t.legacy_key()).map(|u| (t, u)))
    }

    /// Returns true for a row written by an older writer: no `nb_uuid`
    /// column, but a northbound UUID in `external_ids`.
    pub fn is_legacy(&self) -> bool {
        self.nb_uuid.is_none() && self.legacy_nb_uuid().is_some()
    }

    /// Returns the northbound UUID this row stands for, from either the
    /// `nb_uuid` column or the legacy `external_ids`.
    pub fn get_nb_uuid(&self) -> Option<Uuid> {
        self.nb_uuid
            .or_else(|| self.legacy_nb_uuid().map(|(_, uuid)| uuid))
    }
}

impl Row for DatapathBinding {
    const TABLE: &'static str = "Datapath_Binding";
}

/// `Port_Binding` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortBinding {
    pub logical_port: String,
    /// Owning `Datapath_Binding` row.
    pub datapath: RowId,
    pub tunnel_key: u32,
    #[serde(rename = "type")]
    pub port_type: String,
    pub external_ids: Smap,
    pub up: Option<bool>,
}

impl Row for PortBinding {
    const TABLE: &'static str = "Port_Binding";
}

/// `FDB` row: a learned MAC keyed by datapath and port tunnel keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fdb {
    pub mac: String,
    pub dp_key: u32,
    pub port_key: u32,
}

impl Row for Fdb {
    const TABLE: &'static str = "FDB";
}

/// `MAC_Binding` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacBinding {
    pub logical_port: String,
    pub ip: String,
    pub mac: String,
    pub datapath: RowId,
}

impl Row for MacBinding {
    const TABLE: &'static str = "MAC_Binding";
}

/// `IGMP_Group` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgmpGroup {
    pub address: String,
    pub datapath: RowId,
}

impl Row for IgmpGroup {
    const TABLE: &'static str = "IGMP_Group";
}

/// `Learned_Route` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedRoute {
    pub ip_prefix: String,
    pub nexthop: String,
    pub datapath: RowId,
}

impl Row for LearnedRoute {
    const TABLE: &'static str = "Learned_Route";
}

/// The southbound database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SbDb {
    pub datapath_bindings: Table<DatapathBinding>,
    pub port_bindings: Table<PortBinding>,
    pub fdbs: Table<Fdb>,
    pub mac_bindings: Table<MacBinding>,
    pub igmp_groups: Table<IgmpGroup>,
    pub learned_routes: Table<LearnedRoute>,
}

impl SbDb {
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

    fn tables(&mut self) -> [&mut dyn TxnTable; 6] {
        [
            &mut self.datapath_bindings,
            &mut self.port_bindings,
            &mut self.fdbs,
            &mut self.mac_bindings,
            &mut self.igmp_groups,
            &mut self.learned_routes,
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
        self.datapath_bindings.has_tracked_changes()
            || self.port_bindings.has_tracked_changes()
            || self.fdbs.has_tracked_changes()
            || self.mac_bindings.has_tracked_changes()
            || self.igmp_groups.has_tracked_changes()
            || self.learned_routes.has_tracked_changes()
    }

    /// Looks a datapath binding up by its `nb_uuid` column.
    pub fn datapath_binding_for_nb_uuid(&self, nb_uuid: &Uuid) -> Option<(RowId, &DatapathBinding)> {
        self.datapath_bindings
            .find(|dp| dp.nb_uuid.as_ref() == Some(nb_uuid))
    }

    /// Looks a port binding up by `logical_port`.
    pub fn port_binding_by_name(&self, name: &str) -> Option<(RowId, &PortBinding)> {
        self.port_bindings.find(|pb| pb.logical_port == name)
    }
}
