//! Mutable endpoint options and their registry
//!
//! Options are boolean datapath toggles validated against an explicit
//! [`OptionLibrary`] passed through the endpoint constructor. There is no
//! process-wide registry; every endpoint carries a handle to the library it
//! was created with.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Enable per flow (conntrack) statistics
pub const OPTION_CONNTRACK_ACCOUNTING: &str = "ConntrackAccounting";
/// Use an endpoint dedicated tracking table instead of the global one
pub const OPTION_CONNTRACK_LOCAL: &str = "ConntrackLocal";
/// Enable stateful connection tracking
pub const OPTION_CONNTRACK: &str = "Conntrack";
/// Enable debugging trace statements
pub const OPTION_DEBUG: &str = "Debug";
/// Enable debugging trace statements for the load balancer
pub const OPTION_DEBUG_LB: &str = "DebugLB";
/// Enable drop notifications
pub const OPTION_DROP_NOTIFY: &str = "DropNotification";
/// Enable trace notifications
pub const OPTION_TRACE_NOTIFY: &str = "TraceNotification";
/// Enable automatic NAT46 translation
pub const OPTION_NAT46: &str = "NAT46";
/// Enable ingress policy enforcement
pub const OPTION_INGRESS_POLICY: &str = "IngressPolicy";
/// Enable egress policy enforcement
pub const OPTION_EGRESS_POLICY: &str = "EgressPolicy";

/// Specification of a single recognized option.
#[derive(Clone, Debug)]
pub struct OptionSpec {
    /// Option name as accepted by the configuration API
    pub name: &'static str,
    /// Preprocessor define handed to the datapath build
    pub define: &'static str,
    /// Human readable description
    pub description: &'static str,
    /// Options that must be enabled alongside this one
    pub requires: &'static [&'static str],
    /// Whether the option only makes sense with IPv4 enabled
    pub requires_ipv4: bool,
}

/// Registry of recognized options. Passed explicitly to endpoints; never a
/// process-wide singleton.
#[derive(Clone, Debug)]
pub struct OptionLibrary {
    specs: BTreeMap<&'static str, OptionSpec>,
    ipv4_enabled: bool,
}

impl OptionLibrary {
    /// The mutable option set recognized on endpoints.
    ///
    /// `ipv4_enabled` reflects whether the node runs with IPv4; options that
    /// depend on it (NAT46) fail validation when it is off.
    pub fn endpoint_defaults(ipv4_enabled: bool) -> Self {
        let specs = [
            OptionSpec {
                name: OPTION_CONNTRACK_ACCOUNTING,
                define: "CONNTRACK_ACCOUNTING",
                description: "Enable per flow (conntrack) statistics",
                requires: &[OPTION_CONNTRACK],
                requires_ipv4: false,
            },
            OptionSpec {
                name: OPTION_CONNTRACK_LOCAL,
                define: "CONNTRACK_LOCAL",
                description: "Use endpoint dedicated tracking table instead of global one",
                requires: &[OPTION_CONNTRACK],
                requires_ipv4: false,
            },
            OptionSpec {
                name: OPTION_CONNTRACK,
                define: "CONNTRACK",
                description: "Enable stateful connection tracking",
                requires: &[],
                requires_ipv4: false,
            },
            OptionSpec {
                name: OPTION_DEBUG,
                define: "DEBUG",
                description: "Enable debugging trace statements",
                requires: &[],
                requires_ipv4: false,
            },
            OptionSpec {
                name: OPTION_DEBUG_LB,
                define: "LB_DEBUG",
                description: "Enable debugging trace statements for load balancer",
                requires: &[],
                requires_ipv4: false,
            },
            OptionSpec {
                name: OPTION_DROP_NOTIFY,
                define: "DROP_NOTIFY",
                description: "Enable drop notifications",
                requires: &[],
                requires_ipv4: false,
            },
            OptionSpec {
                name: OPTION_TRACE_NOTIFY,
                define: "TRACE_NOTIFY",
                description: "Enable trace notifications",
                requires: &[],
                requires_ipv4: false,
            },
            OptionSpec {
                name: OPTION_NAT46,
                define: "ENABLE_NAT46",
                description: "Enable automatic NAT46 translation",
                requires: &[OPTION_CONNTRACK],
                requires_ipv4: true,
            },
            OptionSpec {
                name: OPTION_INGRESS_POLICY,
                define: "POLICY_INGRESS",
                description: "Enable ingress policy enforcement",
                requires: &[],
                requires_ipv4: false,
            },
            OptionSpec {
                name: OPTION_EGRESS_POLICY,
                define: "POLICY_EGRESS",
                description: "Enable egress policy enforcement",
                requires: &[],
                requires_ipv4: false,
            },
        ]
        .into_iter()
        .map(|spec| (spec.name, spec))
        .collect();

        Self {
            specs,
            ipv4_enabled,
        }
    }

    /// Look up the spec for an option name.
    pub fn lookup(&self, name: &str) -> Option<&OptionSpec> {
        self.specs.get(name)
    }

    /// Validate a requested option map against the registry. Unknown names
    /// and options whose preconditions cannot be met are rejected.
    pub fn validate(&self, requested: &BTreeMap<String, bool>) -> Result<()> {
        for (name, value) in requested {
            let spec = self
                .lookup(name)
                .ok_or_else(|| Error::Validation(format!("unknown option: {name}")))?;
            if *value && spec.requires_ipv4 && !self.ipv4_enabled {
                return Err(Error::Validation(format!(
                    "option {name} requires IPv4 to be enabled"
                )));
            }
        }
        Ok(())
    }
}

/// The option values currently applied to an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoolOptions {
    values: BTreeMap<String, bool>,
}

impl BoolOptions {
    /// Create an empty option set; all options read as disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the named option is currently enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.values.get(name).copied().unwrap_or(false)
    }

    /// Whether the named option has an explicitly assigned value.
    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Set a single option value.
    pub fn set(&mut self, name: &str, value: bool) {
        self.values.insert(name.to_string(), value);
    }

    /// Apply a requested option map, enabling required dependencies of any
    /// newly enabled option. Returns the number of options whose effective
    /// value changed.
    pub fn apply(&mut self, library: &OptionLibrary, requested: &BTreeMap<String, bool>) -> usize {
        let mut changed = 0;
        for (name, value) in requested {
            if self.is_enabled(name) != *value {
                self.values.insert(name.clone(), *value);
                changed += 1;
            }
            if *value {
                if let Some(spec) = library.lookup(name) {
                    for required in spec.requires {
                        if !self.is_enabled(required) {
                            self.values.insert((*required).to_string(), true);
                            changed += 1;
                        }
                    }
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn unknown_option_is_rejected() {
        let library = OptionLibrary::endpoint_defaults(true);
        let err = library
            .validate(&requested(&[("NoSuchOption", true)]))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn nat46_requires_ipv4() {
        let library = OptionLibrary::endpoint_defaults(false);
        assert!(library.validate(&requested(&[(OPTION_NAT46, true)])).is_err());
        // Disabling it is always acceptable.
        assert!(library
            .validate(&requested(&[(OPTION_NAT46, false)]))
            .is_ok());

        let library = OptionLibrary::endpoint_defaults(true);
        assert!(library.validate(&requested(&[(OPTION_NAT46, true)])).is_ok());
    }

    #[test]
    fn apply_enables_dependencies_and_counts_changes() {
        let library = OptionLibrary::endpoint_defaults(true);
        let mut opts = BoolOptions::new();

        let changed = opts.apply(&library, &requested(&[(OPTION_CONNTRACK_ACCOUNTING, true)]));
        assert_eq!(changed, 2);
        assert!(opts.is_enabled(OPTION_CONNTRACK_ACCOUNTING));
        assert!(opts.is_enabled(OPTION_CONNTRACK));

        // Re-applying the same request changes nothing.
        let changed = opts.apply(&library, &requested(&[(OPTION_CONNTRACK_ACCOUNTING, true)]));
        assert_eq!(changed, 0);
    }
}
