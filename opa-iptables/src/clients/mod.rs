//! Clients for the two external collaborators.
//!
//! - `opa`: the policy engine serving desired rule sets over HTTP
//! - `iptables`: the host's packet-filter rule table

pub mod iptables;
pub mod opa;

pub use iptables::{IptablesApplier, RuleApplier};
pub use opa::{OpaClient, RuleSource};
