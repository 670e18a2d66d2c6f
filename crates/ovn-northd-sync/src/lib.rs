//! ovn-northd-sync - OVN northd datapath and port binding reconciliation
//!
//! Translates the northbound logical topology into southbound bindings:
//!
//! - every logical switch and enabled logical router gets exactly one
//!   `Datapath_Binding` row with a tunnel key unique across datapaths
//! - every logical port (switch, router, chassis-redirect, mirror) gets
//!   exactly one `Port_Binding` row with a tunnel key unique within its
//!   datapath
//!
//! Requested keys win over existing ones, existing ones over fresh
//! allocations. Rows nobody wants are deleted; rows written by older
//! versions are replaced and every reference to them is moved over.
//!
//! [`Northd`] drives the node pipeline one transactional pass at a time.

pub mod config;
pub mod daemon;
pub mod datapath;
pub mod port_binding;
pub mod tnlid;

pub use config::NorthdConfig;
pub use daemon::{NodeOutcome, Northd, PassReport};
pub use tnlid::TunnelKeySet;
