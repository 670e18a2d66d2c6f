//! Datapath synchronization.
//!
//! Northbound logical switches and routers are collected into
//! [`UnsyncedDatapathMap`]s, bound to southbound `Datapath_Binding` rows by
//! [`DatapathSync`], and decoded back per kind for the port-binding nodes.

pub mod legacy_update;
mod logical_router;
mod logical_switch;
mod sync;
mod synced;
mod types;

pub use legacy_update::LegacyUpdateStats;
pub use logical_router::{min_mac_binding_age_threshold, DatapathLogicalRouter};
pub use logical_switch::DatapathLogicalSwitch;
pub use sync::{DatapathSync, DatapathSyncInput};
pub use synced::{SyncedEntity, SyncedLogicalRouterMap, SyncedLogicalSwitchMap};
pub use types::{
    DatapathKind, RecreatedDatapath, SyncedDatapath, SyncedDatapaths, UnsyncedDatapath,
    UnsyncedDatapathMap,
};
