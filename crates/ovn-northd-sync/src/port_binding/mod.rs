//! Port binding synchronization.
//!
//! One collector per port kind turns the ports of synced datapaths into
//! [`UnpairedPortBindingMap`]s. [`PortBindingPair`] binds them to
//! southbound `Port_Binding` rows and one decoder per kind reads the result
//! back.

mod chassisredirect;
mod mirror;
mod pair;
mod router_port;
mod switch_port;
mod types;

pub use chassisredirect::{
    chassis_redirect_name, PairedChassisRedirectPort, PairedChassisRedirectPorts,
    PortBindingChassisRedirect,
};
pub use mirror::{
    mirror_port_name, PairedMirrorPort, PairedMirrorPorts, PortBindingMirror, MIRROR_TYPE_LPORT,
};
pub use pair::{PortBindingPair, PortBindingPairInput};
pub use router_port::{PairedLogicalRouterPort, PairedLogicalRouterPorts, PortBindingRouterPort};
pub use switch_port::{
    switch_port_sb_type, PairedLogicalSwitchPort, PairedLogicalSwitchPorts,
    PortBindingSwitchPort, SwitchPortCallbacks,
};
pub use types::{
    pending_datapath_ports, ChassisRedirectCookie, ChassisRedirectPrimary, DefaultCallbacks,
    MirrorCookie, PairedDecodeInput, PairedPortBinding, PairedPortBindings,
    PendingDatapathPorts, PortBindingKind, PortCollectorInput, PortCookie, RouterPortCookie,
    SwitchPortCookie, UnpairedMapCallbacks, UnpairedPortBinding, UnpairedPortBindingMap,
};
