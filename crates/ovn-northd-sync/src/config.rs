//! Global northd configuration and tunnel key ranges.

use ovn_inc_common::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Largest datapath tunnel key (24-bit key space).
pub const OVN_MAX_DP_KEY: u32 = (1 << 24) - 1;
/// Number of datapath keys reserved for globally allocated datapaths.
pub const OVN_MAX_DP_GLOBAL_NUM: u32 = 1 << 16;
/// Smallest locally allocated datapath key.
pub const OVN_MIN_DP_KEY_LOCAL: u32 = 1;
/// Largest locally allocated datapath key.
pub const OVN_MAX_DP_KEY_LOCAL: u32 = OVN_MAX_DP_KEY - OVN_MAX_DP_GLOBAL_NUM;
/// Largest datapath key that fits a VXLAN VNI in OVN's encoding.
pub const OVN_MAX_DP_VXLAN_KEY: u32 = (1 << 12) - 1;

/// Smallest port tunnel key.
pub const OVN_MIN_PORT_KEY: u32 = 1;
/// Largest unicast port tunnel key.
pub const OVN_MAX_PORT_KEY: u32 = (1 << 15) - 1;
/// First multicast group key in VXLAN mode.
pub const OVN_VXLAN_MIN_MULTICAST: u32 = 1 << 11;
/// Largest port tunnel key in VXLAN mode.
pub const OVN_MAX_PORT_VXLAN_KEY: u32 = OVN_VXLAN_MIN_MULTICAST - 1;

/// Configuration shared by every node.
///
/// A change of configuration forces a full recompute of every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NorthdConfig {
    /// A chassis uses VXLAN encapsulation, which limits key widths.
    pub vxlan_mode: bool,
    /// Override of the largest datapath key.
    pub max_dp_tunnel_id: Option<u32>,
    /// Override of the largest port key.
    pub max_pb_tunnel_id: Option<u32>,
}

impl NorthdConfig {
    /// Creates the default (Geneve) configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a VXLAN-mode configuration.
    pub fn vxlan() -> Self {
        Self {
            vxlan_mode: true,
            ..Self::default()
        }
    }

    /// Largest datapath key allowed by the encapsulation.
    fn dp_key_limit(&self) -> u32 {
        if self.vxlan_mode {
            OVN_MAX_DP_VXLAN_KEY
        } else {
            OVN_MAX_DP_KEY_LOCAL
        }
    }

    /// Largest port key allowed by the encapsulation.
    fn pb_key_limit(&self) -> u32 {
        if self.vxlan_mode {
            OVN_MAX_PORT_VXLAN_KEY
        } else {
            OVN_MAX_PORT_KEY
        }
    }

    /// Returns the largest datapath key the allocator may hand out.
    pub fn max_dp_tunnel_id(&self) -> u32 {
        self.max_dp_tunnel_id.unwrap_or_else(|| self.dp_key_limit())
    }

    /// Returns the largest port key the allocator may hand out.
    pub fn max_pb_tunnel_id(&self) -> u32 {
        self.max_pb_tunnel_id.unwrap_or_else(|| self.pb_key_limit())
    }

    /// Checks that overrides stay inside the encapsulation's key space.
    pub fn validate(&self) -> EngineResult<()> {
        if let Some(max) = self.max_dp_tunnel_id {
            if max < OVN_MIN_DP_KEY_LOCAL || max > self.dp_key_limit() {
                return Err(EngineError::invalid_config(
                    "max_dp_tunnel_id",
                    format!(
                        "{} outside [{}, {}]",
                        max,
                        OVN_MIN_DP_KEY_LOCAL,
                        self.dp_key_limit()
                    ),
                ));
            }
        }
        if let Some(max) = self.max_pb_tunnel_id {
            if max < OVN_MIN_PORT_KEY || max > self.pb_key_limit() {
                return Err(EngineError::invalid_config(
                    "max_pb_tunnel_id",
                    format!("{} outside [{}, {}]", max, OVN_MIN_PORT_KEY, self.pb_key_limit()),
                ));
            }
        }
        Ok(())
    }
}
