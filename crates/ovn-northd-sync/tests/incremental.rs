//! Incremental processing tests
//!
//! Verify which nodes recompute, which apply deltas and which are skipped
//! from one pass to the next.

mod common;

use common::{assert_consistent, converge};
use ovn_db::nb::LogicalSwitch;
use ovn_db::{smap, NbDb, RowId, SbDb, Smap, TxnTable};
use ovn_inc_common::{EngineError, NodeState};
use ovn_northd_sync::{NodeOutcome, Northd, NorthdConfig};
use ovn_northd_test::port_fixtures::*;
use ovn_northd_test::{sb_fixtures, NbFixture, SbVerifier};
use pretty_assertions::assert_eq;

/// A fresh datapath is pending for one pass, then graduates.
///
/// Scenario:
/// 1. First pass inserts the row; the switch has no ports bound yet
/// 2. Second pass sees the row come back, graduates it and binds ports
/// 3. Third pass changes nothing
#[test]
fn test_pending_datapath_graduates() {
    let mut fixture = NbFixture::new();
    let sw0 = fixture.switch("sw0", Smap::new(), vec![vif("p1")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();

    let first = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert!(first.full_recompute);
    assert!(first.changed);
    assert_eq!(first.datapaths, 0);
    assert_eq!(first.pending_datapaths, 1);
    assert_eq!(first.port_bindings, 0);
    SbVerifier::new(&sb).datapath(sw0.row).unwrap();

    let second = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert!(!second.full_recompute);
    assert_eq!(
        second.outcome("datapath_logical_switch"),
        Some(NodeOutcome::Skipped)
    );
    assert_eq!(
        second.outcome("datapath_sync"),
        Some(NodeOutcome::Handled(NodeState::Updated))
    );
    assert_eq!(second.datapaths, 1);
    assert_eq!(second.pending_datapaths, 0);
    assert_eq!(second.port_bindings, 1);
    assert_eq!(SbVerifier::new(&sb).port("p1").unwrap().tunnel_key, 1);

    let third = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert!(!third.changed);
    assert_eq!(northd.passes(), 3);
}

/// Adding a port to an existing switch does not touch datapath sync.
#[test]
fn test_port_added_without_datapath_recompute() {
    let mut fixture = NbFixture::new();
    let sw0 = fixture.switch("sw0", Smap::new(), vec![vif("p1")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();
    converge(&mut northd, &mut nb, &mut sb);

    let p2 = nb.logical_switch_ports.insert(vif("p2"));
    nb.logical_switches
        .update(&sw0.row, |ls| ls.ports.push(p2))
        .unwrap();

    let report = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert_eq!(
        report.outcome("datapath_logical_switch"),
        Some(NodeOutcome::Handled(NodeState::Unchanged))
    );
    assert_eq!(report.outcome("datapath_sync"), Some(NodeOutcome::Skipped));
    assert_eq!(
        report.outcome("synced_logical_switch_map"),
        Some(NodeOutcome::Skipped)
    );
    assert_eq!(
        report.outcome("port_binding_logical_switch_port"),
        Some(NodeOutcome::Recomputed(NodeState::Updated))
    );
    assert_eq!(
        report.outcome("port_binding_pair"),
        Some(NodeOutcome::Recomputed(NodeState::Updated))
    );
    assert_eq!(report.port_bindings, 2);

    converge(&mut northd, &mut nb, &mut sb);
    assert_eq!(SbVerifier::new(&sb).port_key("p1").unwrap(), 1);
    assert_eq!(SbVerifier::new(&sb).port_key("p2").unwrap(), 2);
    assert_consistent(&northd, &sb);
}

/// Learned FDB entries are checked by the FDB handler alone.
#[test]
fn test_fdb_changes_handled_incrementally() {
    let mut fixture = NbFixture::new();
    let sw0 = fixture.switch("sw0", Smap::new(), vec![vif("p1")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();
    converge(&mut northd, &mut nb, &mut sb);

    let verifier = SbVerifier::new(&sb);
    let dp_key = verifier.datapath_key(sw0.row).unwrap();
    let port_key = verifier.port_key("p1").unwrap();

    let live = sb_fixtures::fdb(&mut sb, "00:00:00:00:00:01", dp_key, port_key);
    let bad_port = sb_fixtures::fdb(&mut sb, "00:00:00:00:00:02", dp_key, port_key + 100);
    let bad_dp = sb_fixtures::fdb(&mut sb, "00:00:00:00:00:03", dp_key + 100, port_key);

    let report = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert_eq!(
        report.outcome("port_binding_pair"),
        Some(NodeOutcome::Handled(NodeState::Unchanged))
    );
    assert!(report.changed);
    assert!(sb.fdbs.contains(&live));
    assert!(!sb.fdbs.contains(&bad_port));
    assert!(!sb.fdbs.contains(&bad_dp));
}

/// Nothing tracked means every node is skipped.
#[test]
fn test_idle_pass_skips_everything() {
    let mut fixture = NbFixture::new();
    fixture.switch("sw0", Smap::new(), vec![vif("p1")]);
    fixture.router("lr0", Smap::new(), vec![lrp("lr0-p1")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();
    converge(&mut northd, &mut nb, &mut sb);

    let report = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert!(!report.changed);
    for (node, outcome) in &report.nodes {
        assert_eq!(*outcome, NodeOutcome::Skipped, "node {node}");
    }
}

/// A configuration change recomputes every node; keys already in use are
/// kept.
#[test]
fn test_config_change_forces_full_recompute() {
    let mut fixture = NbFixture::new();
    let sw0 = fixture.switch("sw0", Smap::new(), vec![vif("p1"), vif("p2")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();
    converge(&mut northd, &mut nb, &mut sb);
    let dp_key = SbVerifier::new(&sb).datapath_key(sw0.row).unwrap();
    let p2_key = SbVerifier::new(&sb).port_key("p2").unwrap();

    northd.set_config(NorthdConfig::vxlan()).unwrap();
    let report = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert!(report.full_recompute);
    assert!(matches!(
        report.outcome("datapath_sync"),
        Some(NodeOutcome::Recomputed(_))
    ));
    assert!(matches!(
        report.outcome("port_binding_pair"),
        Some(NodeOutcome::Recomputed(_))
    ));

    converge(&mut northd, &mut nb, &mut sb);
    assert_eq!(SbVerifier::new(&sb).datapath_key(sw0.row).unwrap(), dp_key);
    assert_eq!(SbVerifier::new(&sb).port_key("p2").unwrap(), p2_key);
    assert_consistent(&northd, &sb);
}

/// An invalid configuration is rejected and the old one kept.
#[test]
fn test_invalid_config_rejected() {
    let mut northd = Northd::default();
    let config = NorthdConfig {
        max_pb_tunnel_id: Some(0),
        ..NorthdConfig::default()
    };
    assert!(matches!(
        northd.set_config(config),
        Err(EngineError::InvalidConfig { .. })
    ));
    assert_eq!(northd.config(), &NorthdConfig::default());
}

/// A pass that cannot open its transactions leaves both databases
/// untouched.
#[test]
fn test_failed_pass_rolls_back() {
    let mut fixture = NbFixture::new();
    fixture.switch("sw0", Smap::new(), vec![vif("p1")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();
    converge(&mut northd, &mut nb, &mut sb);
    let before = sb.to_json_pretty().unwrap();
    let passes = northd.passes();

    sb.fdbs.begin().unwrap();
    let err = northd.run_pass(&mut nb, &mut sb).unwrap_err();
    assert!(matches!(err, EngineError::Transaction(_)));
    assert!(!nb.logical_switches.in_txn());
    assert!(!sb.datapath_bindings.in_txn());
    assert_eq!(northd.passes(), passes);

    sb.fdbs.abort().unwrap();
    let report = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert!(!report.changed);
    assert_eq!(sb.to_json_pretty().unwrap(), before);
}

/// After cleanup the next pass rebuilds everything from the databases
/// and reaches the same state.
#[test]
fn test_cleanup_then_recompute_is_stable() {
    let mut fixture = NbFixture::new();
    fixture.switch("sw0", Smap::new(), vec![vif("p1"), vif("p2")]);
    fixture.router("lr0", Smap::new(), vec![gateway_port("lr0-gw", "hv1")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();
    converge(&mut northd, &mut nb, &mut sb);
    let before = sb.to_json_pretty().unwrap();

    northd.cleanup();
    let report = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert!(report.full_recompute);
    assert!(!report.changed);
    assert_eq!(sb.to_json_pretty().unwrap(), before);
}

fn datapath_keys(sb: &SbDb, rows: &[RowId]) -> Vec<u32> {
    let verifier = SbVerifier::new(sb);
    rows.iter()
        .map(|row| verifier.datapath_key(*row).unwrap())
        .collect()
}

/// Checks that a forced full recompute leaves every datapath key where the
/// incremental passes put it.
fn assert_keys_survive_recompute(
    northd: &mut Northd,
    nb: &mut NbDb,
    sb: &mut SbDb,
    rows: &[RowId],
) {
    let incremental = datapath_keys(sb, rows);
    northd.force_recompute();
    converge(northd, nb, sb);
    assert_eq!(datapath_keys(sb, rows), incremental);
    assert_consistent(northd, sb);
}

/// A new switch requesting a key another switch holds gets it, as a full
/// run would grant it.
#[test]
fn test_new_switch_takes_held_key() {
    let mut fixture = NbFixture::new();
    let holder = fixture.switch("holder", Smap::new(), vec![vif("p1")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();
    converge(&mut northd, &mut nb, &mut sb);
    let held = SbVerifier::new(&sb).datapath_key(holder.row).unwrap();

    let wants = nb.logical_switches.insert(LogicalSwitch {
        name: "wants".into(),
        other_config: smap([("requested-tnl-key", held.to_string())]),
        ..Default::default()
    });
    let report = northd.run_pass(&mut nb, &mut sb).unwrap();
    assert!(report.outcome("datapath_sync").unwrap().is_recompute());
    converge(&mut northd, &mut nb, &mut sb);

    assert_eq!(SbVerifier::new(&sb).datapath_key(wants).unwrap(), held);
    assert_ne!(SbVerifier::new(&sb).datapath_key(holder.row).unwrap(), held);
    assert_keys_survive_recompute(&mut northd, &mut nb, &mut sb, &[holder.row, wants]);
}

/// An existing switch that starts requesting a held key takes it over.
#[test]
fn test_updated_switch_takes_held_key() {
    let mut fixture = NbFixture::new();
    let a = fixture.switch("a", Smap::new(), vec![vif("p1")]);
    let b = fixture.switch("b", Smap::new(), vec![vif("p2")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();
    converge(&mut northd, &mut nb, &mut sb);
    let a_key = SbVerifier::new(&sb).datapath_key(a.row).unwrap();

    nb.logical_switches
        .update(&b.row, |ls| {
            ls.other_config
                .insert("requested-tnl-key".into(), a_key.to_string());
        })
        .unwrap();
    converge(&mut northd, &mut nb, &mut sb);

    assert_eq!(SbVerifier::new(&sb).datapath_key(b.row).unwrap(), a_key);
    assert_ne!(SbVerifier::new(&sb).datapath_key(a.row).unwrap(), a_key);
    assert_keys_survive_recompute(&mut northd, &mut nb, &mut sb, &[a.row, b.row]);
}

/// A key freed by a deleted router goes to the switch requesting it in the
/// same pass.
#[test]
fn test_freed_key_requested_in_same_pass() {
    let mut fixture = NbFixture::new();
    let lr = fixture.router("lr", smap([("requested-tnl-key", "5")]), vec![lrp("lr-p1")]);
    let sw0 = fixture.switch("sw0", Smap::new(), vec![vif("p1")]);
    let mut nb = fixture.build();
    let mut sb = SbDb::new();
    let mut northd = Northd::default();
    converge(&mut northd, &mut nb, &mut sb);
    assert_eq!(SbVerifier::new(&sb).datapath_key(lr.row).unwrap(), 5);

    nb.logical_routers.delete(&lr.row).unwrap();
    let sw = nb.logical_switches.insert(LogicalSwitch {
        name: "sw".into(),
        other_config: smap([("requested-tnl-key", "5")]),
        ..Default::default()
    });
    converge(&mut northd, &mut nb, &mut sb);

    let verifier = SbVerifier::new(&sb);
    assert_eq!(verifier.datapath_key(sw).unwrap(), 5);
    assert!(verifier.datapath(lr.row).is_err());
    assert_keys_survive_recompute(&mut northd, &mut nb, &mut sb, &[sw0.row, sw]);
}
