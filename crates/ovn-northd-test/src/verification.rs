//! Verification helpers for southbound binding state
//!
//! Every check returns a [`VerifyResult`] so tests can `expect` with a
//! message naming the offending row.

use std::collections::{BTreeMap, BTreeSet};

use ovn_db::sb::{DatapathBinding, PortBinding};
use ovn_db::{RowId, SbDb};
use thiserror::Error;
use uuid::Uuid;

/// Verification error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerificationError {
    #[error("No Datapath_Binding for northbound entity {nb_uuid}")]
    DatapathNotFound { nb_uuid: Uuid },

    #[error("No Port_Binding for logical port '{name}'")]
    PortNotFound { name: String },

    #[error("Datapath tunnel key {key} used by {first} and {second}")]
    DuplicateDatapathKey { key: u32, first: RowId, second: RowId },

    #[error("Port tunnel key {key} used twice on datapath {datapath}")]
    DuplicatePortKey { datapath: RowId, key: u32 },

    #[error("Logical port '{name}' bound {count} times")]
    DuplicatePort { name: String, count: usize },

    #[error("{what} tunnel key {key} outside [1, {max}]")]
    KeyOutOfRange { what: &'static str, key: u32, max: u32 },

    #[error("{table} row {row} references missing Datapath_Binding {datapath}")]
    DanglingDatapath {
        table: &'static str,
        row: RowId,
        datapath: RowId,
    },

    #[error("Legacy Datapath_Binding {row} still present")]
    LegacyDatapath { row: RowId },

    #[error("Expected {expected} {table} rows, found {actual}")]
    CountMismatch {
        table: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Southbound verification helper
pub struct SbVerifier<'a> {
    sb: &'a SbDb,
}

impl<'a> SbVerifier<'a> {
    /// Create a new verifier
    pub fn new(sb: &'a SbDb) -> Self {
        Self { sb }
    }

    /// Datapath binding of a northbound switch or router
    pub fn datapath(&self, nb_uuid: Uuid) -> VerifyResult<(RowId, &'a DatapathBinding)> {
        self.sb
            .datapath_binding_for_nb_uuid(&nb_uuid)
            .ok_or(VerificationError::DatapathNotFound { nb_uuid })
    }

    /// Tunnel key of a northbound switch or router
    pub fn datapath_key(&self, nb_uuid: Uuid) -> VerifyResult<u32> {
        self.datapath(nb_uuid).map(|(_, dp)| dp.tunnel_key)
    }

    /// Port binding of a logical port
    pub fn port(&self, name: &str) -> VerifyResult<&'a PortBinding> {
        self.sb
            .port_binding_by_name(name)
            .map(|(_, pb)| pb)
            .ok_or_else(|| VerificationError::PortNotFound {
                name: name.to_string(),
            })
    }

    /// Tunnel key of a logical port
    pub fn port_key(&self, name: &str) -> VerifyResult<u32> {
        self.port(name).map(|pb| pb.tunnel_key)
    }

    /// Verify the number of datapath bindings
    pub fn assert_datapath_count(&self, expected: usize) -> VerifyResult<()> {
        check_count("Datapath_Binding", expected, self.sb.datapath_bindings.len())
    }

    /// Verify the number of port bindings
    pub fn assert_port_count(&self, expected: usize) -> VerifyResult<()> {
        check_count("Port_Binding", expected, self.sb.port_bindings.len())
    }

    /// Verify that no two datapaths share a tunnel key
    pub fn assert_unique_datapath_keys(&self) -> VerifyResult<()> {
        let mut seen: BTreeMap<u32, RowId> = BTreeMap::new();
        for (row, dp) in self.sb.datapath_bindings.iter() {
            if let Some(first) = seen.insert(dp.tunnel_key, row) {
                return Err(VerificationError::DuplicateDatapathKey {
                    key: dp.tunnel_key,
                    first,
                    second: row,
                });
            }
        }
        Ok(())
    }

    /// Verify that port keys are unique per datapath and port names are
    /// bound once
    pub fn assert_unique_ports(&self) -> VerifyResult<()> {
        let mut keys: BTreeSet<(RowId, u32)> = BTreeSet::new();
        let mut names: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, pb) in self.sb.port_bindings.iter() {
            if !keys.insert((pb.datapath, pb.tunnel_key)) {
                return Err(VerificationError::DuplicatePortKey {
                    datapath: pb.datapath,
                    key: pb.tunnel_key,
                });
            }
            *names.entry(pb.logical_port.as_str()).or_default() += 1;
        }
        match names.into_iter().find(|(_, count)| *count > 1) {
            Some((name, count)) => Err(VerificationError::DuplicatePort {
                name: name.to_string(),
                count,
            }),
            None => Ok(()),
        }
    }

    /// Verify that every key lies in `[1, max]`
    pub fn assert_keys_in_range(&self, max_dp_key: u32, max_port_key: u32) -> VerifyResult<()> {
        for (_, dp) in self.sb.datapath_bindings.iter() {
            check_range("Datapath", dp.tunnel_key, max_dp_key)?;
        }
        for (_, pb) in self.sb.port_bindings.iter() {
            check_range("Port", pb.tunnel_key, max_port_key)?;
        }
        Ok(())
    }

    /// Verify that no legacy datapath remains and nothing references a
    /// missing datapath
    pub fn assert_no_stale_references(&self) -> VerifyResult<()> {
        let sb = self.sb;
        if let Some((row, _)) = sb.datapath_bindings.find(|dp| dp.is_legacy()) {
            return Err(VerificationError::LegacyDatapath { row });
        }

        let refs = sb
            .port_bindings
            .iter()
            .map(|(id, r)| ("Port_Binding", id, r.datapath))
            .chain(sb.mac_bindings.iter().map(|(id, r)| ("MAC_Binding", id, r.datapath)))
            .chain(sb.igmp_groups.iter().map(|(id, r)| ("IGMP_Group", id, r.datapath)))
            .chain(
                sb.learned_routes
                    .iter()
                    .map(|(id, r)| ("Learned_Route", id, r.datapath)),
            );
        for (table, row, datapath) in refs {
            if !sb.datapath_bindings.contains(&datapath) {
                return Err(VerificationError::DanglingDatapath {
                    table,
                    row,
                    datapath,
                });
            }
        }
        Ok(())
    }

    /// Run every structural check
    pub fn assert_consistent(&self, max_dp_key: u32, max_port_key: u32) -> VerifyResult<()> {
        self.assert_unique_datapath_keys()?;
        self.assert_unique_ports()?;
        self.assert_keys_in_range(max_dp_key, max_port_key)?;
        self.assert_no_stale_references()
    }
}

fn check_count(table: &'static str, expected: usize, actual: usize) -> VerifyResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(VerificationError::CountMismatch {
            table,
            expected,
            actual,
        })
    }
}

fn check_range(what: &'static str, key: u32, max: u32) -> VerifyResult<()> {
    if key == 0 || key > max {
        return Err(VerificationError::KeyOutOfRange { what, key, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sb_fixtures;
    use ovn_db::sb::DatapathType;

    #[test]
    fn test_duplicate_port_key_detected() {
        let mut sb = SbDb::new();
        let dp = sb_fixtures::datapath(&mut sb, Uuid::new_v4(), DatapathType::LogicalSwitch, 1);
        sb_fixtures::port_binding(&mut sb, "a", dp, 3, "");
        sb_fixtures::port_binding(&mut sb, "b", dp, 3, "");

        let verifier = SbVerifier::new(&sb);
        assert!(verifier.assert_unique_datapath_keys().is_ok());
        assert_eq!(
            verifier.assert_unique_ports(),
            Err(VerificationError::DuplicatePortKey { datapath: dp, key: 3 })
        );
    }

    #[test]
    fn test_dangling_and_legacy_detected() {
        let mut sb = SbDb::new();
        let legacy =
            sb_fixtures::legacy_datapath(&mut sb, Uuid::new_v4(), DatapathType::LogicalSwitch, 1);
        assert_eq!(
            SbVerifier::new(&sb).assert_no_stale_references(),
            Err(VerificationError::LegacyDatapath { row: legacy })
        );

        let mut sb = SbDb::new();
        let gone = Uuid::new_v4();
        let mac = sb_fixtures::mac_binding(&mut sb, "p", gone);
        assert_eq!(
            SbVerifier::new(&sb).assert_no_stale_references(),
            Err(VerificationError::DanglingDatapath {
                table: "MAC_Binding",
                row: mac,
                datapath: gone,
            })
        );
    }

    #[test]
    fn test_key_range() {
        let mut sb = SbDb::new();
        sb_fixtures::datapath(&mut sb, Uuid::new_v4(), DatapathType::LogicalRouter, 0);
        assert!(SbVerifier::new(&sb).assert_keys_in_range(10, 10).is_err());
    }
}
