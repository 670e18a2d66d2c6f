//! In-memory OVN databases.
//!
//! This crate stands in for the northbound and southbound OVSDB databases
//! as seen by northd through its IDL:
//!
//! - [`NbDb`]: desired state (logical switches, routers, their ports and
//!   mirrors)
//! - [`SbDb`]: realized state (datapath and port bindings, FDB, and the
//!   tables that reference datapaths)
//! - [`Table`]: a change-tracked table with snapshot transactions
//! - [`Smap`] / [`SmapExt`]: option maps with forgiving typed accessors
//!
//! Both databases load from and render to JSON snapshots.

mod error;
pub mod nb;
pub mod sb;
mod smap;
mod table;

pub use error::{DbError, DbResult};
pub use nb::NbDb;
pub use sb::SbDb;
pub use smap::{smap, Smap, SmapExt};
pub use table::{ChangeKind, Row, RowId, Table, TrackedRow, TxnTable};
