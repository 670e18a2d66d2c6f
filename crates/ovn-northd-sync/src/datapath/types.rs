//! Datapath types shared by the collectors, the sync engine and the
//! decoders.

use std::collections::BTreeMap;
use std::fmt;

use ovn_db::sb::DatapathType;
use ovn_db::{RowId, Smap};
use ovn_inc_common::TrackedMap;
use uuid::Uuid;

/// Kind of northbound entity a datapath is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatapathKind {
    /// `Logical_Switch`
    Switch,
    /// `Logical_Router`
    Router,
}

impl DatapathKind {
    /// Returns the southbound `type` column value.
    pub fn sb_type(&self) -> DatapathType {
        match self {
            DatapathKind::Switch => DatapathType::LogicalSwitch,
            DatapathKind::Router => DatapathType::LogicalRouter,
        }
    }
}

impl From<DatapathType> for DatapathKind {
    fn from(t: DatapathType) -> Self {
        match t {
            DatapathType::LogicalSwitch => DatapathKind::Switch,
            DatapathType::LogicalRouter => DatapathKind::Router,
        }
    }
}

impl fmt::Display for DatapathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatapathKind::Switch => write!(f, "logical switch"),
            DatapathKind::Router => write!(f, "logical router"),
        }
    }
}

/// A northbound datapath not yet bound to a southbound row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsyncedDatapath {
    /// Northbound row UUID; the stable identity.
    pub nb_uuid: Uuid,
    pub kind: DatapathKind,
    pub name: String,
    /// 0 when no key was requested.
    pub requested_tunnel_key: u32,
    /// Copied verbatim onto the southbound row.
    pub external_ids: Smap,
}

/// All unsynced datapaths of one kind, keyed by northbound UUID.
#[derive(Debug, Clone)]
pub struct UnsyncedDatapathMap {
    kind: DatapathKind,
    /// The datapaths, with per-pass change tracking.
    pub dps: TrackedMap<Uuid, UnsyncedDatapath>,
}

impl UnsyncedDatapathMap {
    /// Creates an empty map.
    pub fn new(kind: DatapathKind) -> Self {
        Self {
            kind,
            dps: TrackedMap::new(),
        }
    }

    /// Returns the kind of every datapath in this map.
    pub fn kind(&self) -> DatapathKind {
        self.kind
    }

    /// Looks a datapath up by northbound UUID.
    pub fn find(&self, nb_uuid: &Uuid) -> Option<&UnsyncedDatapath> {
        self.dps.get(nb_uuid)
    }

    /// Returns the number of datapaths.
    pub fn len(&self) -> usize {
        self.dps.len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.dps.is_empty()
    }
}

/// A datapath bound to a southbound `Datapath_Binding` row with a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedDatapath {
    pub nb_uuid: Uuid,
    pub kind: DatapathKind,
    pub name: String,
    /// The southbound row.
    pub sb_row: RowId,
    pub tunnel_key: u32,
    pub external_ids: Smap,
}

/// A legacy southbound row whose references must move to the row that
/// replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecreatedDatapath {
    /// The legacy row.
    pub old_row: RowId,
    /// The northbound entity both rows stand for.
    pub nb_uuid: Uuid,
}

/// Output of the datapath sync engine.
///
/// Only `synced` entries may be cached by consumers: their rows were read
/// back from the southbound database. `pending` entries were inserted by
/// this engine and graduate to `synced` once the database reports the row.
#[derive(Debug, Clone, Default)]
pub struct SyncedDatapaths {
    /// Confirmed datapaths, with new/updated/deleted deltas.
    pub synced: TrackedMap<Uuid, SyncedDatapath>,
    /// Datapaths whose rows were inserted and not yet confirmed.
    pub pending: BTreeMap<Uuid, SyncedDatapath>,
    /// Legacy rows replaced in this pass.
    pub recreated: Vec<RecreatedDatapath>,
}

impl SyncedDatapaths {
    /// Looks a datapath up in `synced` then `pending`.
    pub fn find(&self, nb_uuid: &Uuid) -> Option<&SyncedDatapath> {
        self.synced
            .get(nb_uuid)
            .or_else(|| self.pending.get(nb_uuid))
    }

    /// Looks a datapath up by its southbound row in `synced` then
    /// `pending`. Returns whether the entry is pending.
    pub fn find_by_row(&self, row: &RowId) -> Option<(&SyncedDatapath, bool)> {
        self.synced
            .values()
            .find(|sdp| sdp.sb_row == *row)
            .map(|sdp| (sdp, false))
            .or_else(|| {
                self.pending
                    .values()
                    .find(|sdp| sdp.sb_row == *row)
                    .map(|sdp| (sdp, true))
            })
    }

    /// Returns the number of synced and pending datapaths.
    pub fn total(&self) -> usize {
        self.synced.len() + self.pending.len()
    }
}
