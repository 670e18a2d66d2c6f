//! Port binding types shared by the collectors, the pairing engine and the
//! paired decoders.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use ovn_db::sb::PortBinding;
use ovn_db::{NbDb, RowId, SbDb, Smap};
use ovn_inc_common::EngineResult;
use uuid::Uuid;

use super::chassisredirect::chassis_redirect_name;
use super::mirror::{mirror_port_name, MIRROR_TYPE_LPORT};
use crate::datapath::{
    DatapathKind, SyncedDatapath, SyncedLogicalRouterMap, SyncedLogicalSwitchMap,
};
use crate::tnlid::{requested_tunnel_key, TunnelKeySet};

/// Kind of port binding, in pairing priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortBindingKind {
    SwitchPort,
    RouterPort,
    ChassisRedirect,
    Mirror,
}

impl PortBindingKind {
    /// Every kind, highest pairing priority first.
    pub const ALL: [PortBindingKind; 4] = [
        PortBindingKind::SwitchPort,
        PortBindingKind::RouterPort,
        PortBindingKind::ChassisRedirect,
        PortBindingKind::Mirror,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PortBindingKind::SwitchPort => "switch port",
            PortBindingKind::RouterPort => "router port",
            PortBindingKind::ChassisRedirect => "chassis-redirect port",
            PortBindingKind::Mirror => "mirror port",
        }
    }
}

impl fmt::Display for PortBindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of a logical switch port binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchPortCookie {
    /// The `Logical_Switch_Port` row.
    pub lsp: RowId,
    /// Northbound UUID of the owning switch.
    pub switch: Uuid,
    /// Southbound `type` the row must carry.
    pub sb_type: String,
}

/// Payload of a logical router port binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterPortCookie {
    /// The `Logical_Router_Port` row.
    pub lrp: RowId,
    /// Northbound UUID of the owning router.
    pub router: Uuid,
    /// `l3gateway` for gateway routers, `patch` otherwise.
    pub sb_type: String,
}

/// The port a chassis-redirect port is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChassisRedirectPrimary {
    /// A distributed gateway port.
    RouterPort(RowId),
    /// A switch port of type `router` peered with a distributed gateway
    /// port.
    SwitchPort(RowId),
}

/// Payload of a chassis-redirect port binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChassisRedirectCookie {
    pub primary: ChassisRedirectPrimary,
    /// Northbound UUID of the datapath the port lives on.
    pub datapath: Uuid,
}

/// Payload of a mirror port binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorCookie {
    /// The mirrored `Logical_Switch_Port` row.
    pub lsp: RowId,
    /// Name of the sink port.
    pub sink: String,
    /// Northbound UUID of the owning switch.
    pub switch: Uuid,
}

/// Kind-specific payload carried through pairing back to the decoder of
/// the kind that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortCookie {
    SwitchPort(SwitchPortCookie),
    RouterPort(RouterPortCookie),
    ChassisRedirect(ChassisRedirectCookie),
    Mirror(MirrorCookie),
}

impl PortCookie {
    /// Returns the kind this payload belongs to.
    pub fn kind(&self) -> PortBindingKind {
        match self {
            PortCookie::SwitchPort(_) => PortBindingKind::SwitchPort,
            PortCookie::RouterPort(_) => PortBindingKind::RouterPort,
            PortCookie::ChassisRedirect(_) => PortBindingKind::ChassisRedirect,
            PortCookie::Mirror(_) => PortBindingKind::Mirror,
        }
    }

    /// Returns the southbound `type` of the binding.
    pub fn sb_type(&self) -> &str {
        match self {
            PortCookie::SwitchPort(cookie) => &cookie.sb_type,
            PortCookie::RouterPort(cookie) => &cookie.sb_type,
            PortCookie::ChassisRedirect(_) => "chassisredirect",
            PortCookie::Mirror(_) => "mirror",
        }
    }
}

/// A northbound port not yet paired with a southbound row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpairedPortBinding {
    /// `logical_port` of the southbound row; unique across kinds.
    pub name: String,
    pub kind: PortBindingKind,
    /// 0 when no key was requested.
    pub requested_tunnel_key: u32,
    /// Copied verbatim onto the southbound row.
    pub external_ids: Smap,
    pub cookie: PortCookie,
    /// The synced `Datapath_Binding` row the port belongs to.
    pub sb_datapath: RowId,
    /// Tunnel key of that datapath; names the port key scope.
    pub dp_tunnel_key: u32,
}

/// Per-kind hooks consulted while pairing.
pub trait UnpairedMapCallbacks: Send + Sync {
    /// Returns false if `sb` must not be reused for `upb` even though the
    /// names match.
    fn sb_is_valid(&self, _sb: &PortBinding, _upb: &UnpairedPortBinding) -> bool {
        true
    }
}

/// Callbacks accepting every row.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCallbacks;

impl UnpairedMapCallbacks for DefaultCallbacks {}

/// All unpaired ports of one kind, keyed by name.
#[derive(Clone)]
pub struct UnpairedPortBindingMap {
    kind: PortBindingKind,
    pub ports: BTreeMap<String, UnpairedPortBinding>,
    callbacks: Arc<dyn UnpairedMapCallbacks>,
}

impl fmt::Debug for UnpairedPortBindingMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnpairedPortBindingMap")
            .field("kind", &self.kind)
            .field("ports", &self.ports)
            .finish()
    }
}

impl PartialEq for UnpairedPortBindingMap {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.ports == other.ports
    }
}

impl UnpairedPortBindingMap {
    /// Creates an empty map with the given callbacks.
    pub fn new(kind: PortBindingKind, callbacks: Arc<dyn UnpairedMapCallbacks>) -> Self {
        Self {
            kind,
            ports: BTreeMap::new(),
            callbacks,
        }
    }

    /// Creates an empty map accepting every southbound row.
    pub fn with_default_callbacks(kind: PortBindingKind) -> Self {
        Self::new(kind, Arc::new(DefaultCallbacks))
    }

    pub fn kind(&self) -> PortBindingKind {
        self.kind
    }

    /// Adds a port unless one with the same name exists.
    ///
    /// Returns false, leaving the first port in place, on a duplicate.
    pub fn add_once(&mut self, upb: UnpairedPortBinding) -> bool {
        match self.ports.entry(upb.name.clone()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(upb);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&UnpairedPortBinding> {
        self.ports.get(name)
    }

    /// Returns the port named `name` if `sb` may be paired with it.
    pub fn find_valid(&self, sb: &PortBinding) -> Option<&UnpairedPortBinding> {
        self.ports
            .get(&sb.logical_port)
            .filter(|upb| self.callbacks.sb_is_valid(sb, upb))
    }

    /// Drops every port, keeping the callbacks.
    pub fn clear(&mut self) {
        self.ports.clear();
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// A port bound to a southbound `Port_Binding` row with a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedPortBinding {
    pub name: String,
    pub kind: PortBindingKind,
    pub cookie: PortCookie,
    /// The southbound row.
    pub sb_row: RowId,
    pub tunnel_key: u32,
    /// Key of the owning datapath.
    pub dp_tunnel_key: u32,
}

/// Output of the pairing engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairedPortBindings {
    /// Paired ports keyed by name.
    pub paired: BTreeMap<String, PairedPortBinding>,
    /// Occupied port keys per datapath key.
    pub tunnel_key_maps: BTreeMap<u32, TunnelKeySet>,
}

impl PairedPortBindings {
    /// Iterates over the paired ports of one kind.
    pub fn of_kind(&self, kind: PortBindingKind) -> impl Iterator<Item = &PairedPortBinding> {
        self.paired.values().filter(move |ppb| ppb.kind == kind)
    }

    /// Returns true if `port_key` is occupied on the datapath `dp_key`.
    pub fn key_present(&self, dp_key: u32, port_key: u32) -> bool {
        self.tunnel_key_maps
            .get(&dp_key)
            .is_some_and(|keys| keys.present(port_key))
    }

    pub fn len(&self) -> usize {
        self.paired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paired.is_empty()
    }
}

/// Ports a datapath will carry once its inserted row is confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingDatapathPorts {
    /// Tunnel key of the datapath.
    pub tunnel_key: u32,
    /// `logical_port` names of its northbound ports and the ports derived
    /// from them.
    pub names: BTreeSet<String>,
    /// Keys those ports request.
    pub requested_keys: BTreeSet<u32>,
}

/// Lists the northbound ports of every pending datapath, keyed by its
/// southbound row.
///
/// Chassis-redirect names are listed for every `router` switch port and
/// every gateway router port; the collectors may derive fewer.
pub fn pending_datapath_ports<'a>(
    nb: &NbDb,
    pending: impl IntoIterator<Item = &'a SyncedDatapath>,
) -> BTreeMap<RowId, PendingDatapathPorts> {
    let mut out = BTreeMap::new();
    for sdp in pending {
        let mut ports = PendingDatapathPorts {
            tunnel_key: sdp.tunnel_key,
            ..Default::default()
        };
        match sdp.kind {
            DatapathKind::Switch => {
                let Some(ls) = nb.logical_switches.get(&sdp.nb_uuid) else {
                    continue;
                };
                for (_, lsp) in nb.switch_ports(ls) {
                    ports.names.insert(lsp.name.clone());
                    if lsp.port_type == "router" {
                        ports.names.insert(chassis_redirect_name(&lsp.name));
                    }
                    let sinks = lsp
                        .mirror_rules
                        .iter()
                        .filter_map(|id| nb.mirrors.get(id))
                        .filter(|m| m.mirror_type == MIRROR_TYPE_LPORT);
                    for mirror in sinks {
                        ports.names.insert(mirror_port_name(&sdp.name, &mirror.sink));
                    }
                    ports.requested_keys.insert(requested_tunnel_key(&lsp.options));
                }
            }
            DatapathKind::Router => {
                let Some(lr) = nb.logical_routers.get(&sdp.nb_uuid) else {
                    continue;
                };
                for (_, lrp) in nb.router_ports(lr) {
                    ports.names.insert(lrp.name.clone());
                    if lrp.is_gateway_port() {
                        ports.names.insert(chassis_redirect_name(&lrp.name));
                    }
                    ports.requested_keys.insert(requested_tunnel_key(&lrp.options));
                }
            }
        }
        ports.requested_keys.remove(&0);
        out.insert(sdp.sb_row, ports);
    }
    out
}

/// Inputs of the port collectors.
#[derive(Debug, Clone, Copy)]
pub struct PortCollectorInput<'a> {
    pub nb: &'a NbDb,
    pub switches: &'a SyncedLogicalSwitchMap,
    pub routers: &'a SyncedLogicalRouterMap,
}

/// Inputs of the paired decoders.
pub struct PairedDecodeInput<'a> {
    pub paired: &'a PairedPortBindings,
    pub nb: &'a mut NbDb,
    pub sb: &'a mut SbDb,
}

/// Writes the expected southbound `type` onto a paired row.
pub(crate) fn sync_sb_type(sb: &mut SbDb, ppb: &PairedPortBinding) -> EngineResult<bool> {
    let sb_type = ppb.cookie.sb_type();
    Ok(sb
        .port_bindings
        .update(&ppb.sb_row, |pb| pb.port_type = sb_type.to_string())?)
}
