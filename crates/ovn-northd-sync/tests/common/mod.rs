//! Shared helpers for pipeline tests

#![allow(dead_code)]

use ovn_db::{NbDb, SbDb};
use ovn_northd_sync::{Northd, PassReport};
use ovn_northd_test::SbVerifier;

/// Pass limit for convergence.
pub const MAX_PASSES: usize = 10;

/// Runs passes until nothing changes and checks that convergence happened.
pub fn converge(northd: &mut Northd, nb: &mut NbDb, sb: &mut SbDb) -> Vec<PassReport> {
    let reports = northd
        .run_until_quiescent(nb, sb, MAX_PASSES)
        .expect("reconciliation failed");
    let last = reports.last().expect("no pass ran");
    assert!(!last.changed, "still changing after {} passes", reports.len());
    reports
}

/// Checks key uniqueness, key ranges and references.
pub fn assert_consistent(northd: &Northd, sb: &SbDb) {
    let config = northd.config();
    SbVerifier::new(sb)
        .assert_consistent(config.max_dp_tunnel_id(), config.max_pb_tunnel_id())
        .expect("inconsistent southbound state");
}

/// Checks that every port of every switch has exactly one binding.
pub fn assert_switch_ports_bound(nb: &NbDb, sb: &SbDb) {
    let verifier = SbVerifier::new(sb);
    for (ls_id, ls) in nb.logical_switches.iter() {
        let (dp_row, _) = verifier.datapath(ls_id).expect("switch has no datapath");
        for (_, lsp) in nb.switch_ports(ls) {
            let pb = verifier.port(&lsp.name).expect("switch port not bound");
            assert_eq!(pb.datapath, dp_row, "{} bound on wrong datapath", lsp.name);
        }
    }
}
