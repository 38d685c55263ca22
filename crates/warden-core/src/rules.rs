//! Transparent-proxy rule synthesis.
//!
//! Builds the ordered list of `iptables` commands that redirect plaintext
//! and TLS traffic into the local listener ports while leaving the
//! controlling process's own traffic alone.
//!
//! ## Ordering
//!
//! ```text
//! enable:   create chains → per-port accept/redirect/exclude → attach chains
//! disable:  detach chains → per-port deletes                 → delete chains
//! ```
//!
//! Attaching a chain before its rules exist would briefly let traffic through
//! unfiltered, and the rule engine refuses to delete a chain that is still
//! referenced, so the two sequences are mirror images of each other.
//!
//! ## Usage
//!
//! ```
//! use warden_core::rules::{RulePolicy, RuleSetBuilder};
//!
//! let builder = RuleSetBuilder::new(RulePolicy::default());
//! let rules = builder.build(true, "10042");
//!
//! assert_eq!(rules.first().unwrap().command, "iptables --new spplugin");
//! assert_eq!(rules.last().unwrap().command, "iptables -t nat -A OUTPUT -j sppluginOutput");
//! ```

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Default name of the main chain.
pub const DEFAULT_MAIN_CHAIN: &str = "spplugin";

/// Default name of the outbound NAT chain.
pub const DEFAULT_OUTPUT_CHAIN: &str = "sppluginOutput";

/// Which routing table a rule lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    /// The default `filter` table.
    Filter,
    /// The `nat` table.
    Nat,
}

impl Table {
    /// Returns the table as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

/// What a rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Accept traffic for a port on the main chain.
    Accept,
    /// Redirect inbound traffic for a port to the local listener.
    Redirect,
    /// Redirect outbound traffic for a port, except the excluded identity's.
    Exclude,
    /// Create a chain.
    CreateChain,
    /// Hook a chain into a built-in chain.
    AttachChain,
    /// Unhook a chain from a built-in chain.
    DetachChain,
    /// Delete a chain.
    DeleteChain,
}

impl Direction {
    /// Returns true for the accept/redirect/exclude rules emitted per port.
    pub fn is_per_port(&self) -> bool {
        matches!(self, Self::Accept | Self::Redirect | Self::Exclude)
    }
}

/// Append or delete, the two verbs the per-port rules are written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Append,
    Delete,
}

impl Verb {
    fn flag(&self) -> &'static str {
        match self {
            Self::Append => "A",
            Self::Delete => "D",
        }
    }
}

/// The two chains used to group the rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSet {
    /// Chain holding the accept/redirect rules (filter and nat tables).
    pub main: String,
    /// Chain holding the owner-exclusion rules (nat table).
    pub output: String,
}

impl Default for ChainSet {
    fn default() -> Self {
        Self {
            main: DEFAULT_MAIN_CHAIN.to_string(),
            output: DEFAULT_OUTPUT_CHAIN.to_string(),
        }
    }
}

/// A redirected port and the local listener port it lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRedirect {
    /// Destination port of the intercepted traffic.
    pub port: u16,
    /// Local listener port.
    pub to_port: u16,
}

impl PortRedirect {
    /// Creates a new port redirect.
    pub const fn new(port: u16, to_port: u16) -> Self {
        Self { port, to_port }
    }
}

/// Configuration for [`RuleSetBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePolicy {
    /// Firewall binary invoked by every rule.
    pub binary: String,
    /// Chains the rules are grouped in.
    pub chains: ChainSet,
    /// Plaintext and TLS redirects, in emission order.
    pub redirects: [PortRedirect; 2],
    /// Address the outbound DNAT rules send traffic to.
    pub loopback: Ipv4Addr,
}

impl Default for RulePolicy {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
            chains: ChainSet::default(),
            redirects: [PortRedirect::new(80, 8009), PortRedirect::new(443, 8010)],
            loopback: Ipv4Addr::LOCALHOST,
        }
    }
}

/// A single firewall command, ready to be fed to a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Full command line.
    pub command: String,
    /// Redirected port, for per-port rules.
    pub port: Option<u16>,
    /// What the rule does.
    pub direction: Direction,
    /// Chain the rule creates, targets or appends to.
    pub chain: String,
    /// Table the rule applies to.
    pub table: Table,
}

/// Pure builder for the transparent-proxy rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleSetBuilder {
    policy: RulePolicy,
}

impl RuleSetBuilder {
    /// Creates a builder for the given policy.
    pub fn new(policy: RulePolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy.
    pub fn policy(&self) -> &RulePolicy {
        &self.policy
    }

    /// Builds the ordered rule list.
    ///
    /// `activate` selects installation or removal; `excluded_identity` is the
    /// uid whose outbound traffic must not be redirected.
    pub fn build(&self, activate: bool, excluded_identity: &str) -> Vec<RuleSpec> {
        let verb = if activate { Verb::Append } else { Verb::Delete };
        let mut rules = Vec::with_capacity(12);

        if activate {
            rules.extend(self.create_chains());
        } else {
            rules.extend(self.detach_chains());
        }

        for redirect in &self.policy.redirects {
            rules.extend(self.port_rules(verb, *redirect, excluded_identity));
        }

        if activate {
            rules.extend(self.attach_chains());
        } else {
            rules.extend(self.delete_chains());
        }

        rules
    }

    fn chain_rule(&self, direction: Direction, table: Table, chain: &str, args: String) -> RuleSpec {
        let command = match table {
            Table::Filter => format!("{} {}", self.policy.binary, args),
            Table::Nat => format!("{} -t nat {}", self.policy.binary, args),
        };
        RuleSpec {
            command,
            port: None,
            direction,
            chain: chain.to_string(),
            table,
        }
    }

    /// (table, chain) pairs managed by this policy, in creation order.
    fn managed_chains(&self) -> [(Table, &str); 3] {
        let chains = &self.policy.chains;
        [
            (Table::Filter, chains.main.as_str()),
            (Table::Nat, chains.main.as_str()),
            (Table::Nat, chains.output.as_str()),
        ]
    }

    /// Built-in hook each managed chain is attached to, same order.
    fn hooks(&self) -> [(Table, &'static str, &str); 3] {
        let chains = &self.policy.chains;
        [
            (Table::Filter, "INPUT", chains.main.as_str()),
            (Table::Nat, "PREROUTING", chains.main.as_str()),
            (Table::Nat, "OUTPUT", chains.output.as_str()),
        ]
    }

    fn create_chains(&self) -> Vec<RuleSpec> {
        self.managed_chains()
            .iter()
            .map(|(table, chain)| {
                self.chain_rule(Direction::CreateChain, *table, chain, format!("--new {}", chain))
            })
            .collect()
    }

    fn delete_chains(&self) -> Vec<RuleSpec> {
        self.managed_chains()
            .iter()
            .map(|(table, chain)| {
                self.chain_rule(
                    Direction::DeleteChain,
                    *table,
                    chain,
                    format!("--delete-chain {}", chain),
                )
            })
            .collect()
    }

    fn attach_chains(&self) -> Vec<RuleSpec> {
        self.hooks()
            .iter()
            .map(|(table, hook, chain)| {
                self.chain_rule(
                    Direction::AttachChain,
                    *table,
                    chain,
                    format!("-A {} -j {}", hook, chain),
                )
            })
            .collect()
    }

    fn detach_chains(&self) -> Vec<RuleSpec> {
        self.hooks()
            .iter()
            .map(|(table, hook, chain)| {
                self.chain_rule(
                    Direction::DetachChain,
                    *table,
                    chain,
                    format!("-D {} -j {}", hook, chain),
                )
            })
            .collect()
    }

    fn port_rules(&self, verb: Verb, redirect: PortRedirect, excluded_identity: &str) -> [RuleSpec; 3] {
        let binary = &self.policy.binary;
        let main = &self.policy.chains.main;
        let output = &self.policy.chains.output;
        let flag = verb.flag();
        let PortRedirect { port, to_port } = redirect;

        [
            RuleSpec {
                command: format!("{binary} -{flag} {main} -p tcp --dport {port} -j ACCEPT"),
                port: Some(port),
                direction: Direction::Accept,
                chain: main.clone(),
                table: Table::Filter,
            },
            RuleSpec {
                command: format!(
                    "{binary} -{flag} {main} -t nat -p tcp --dport {port} -j REDIRECT --to-port {to_port}"
                ),
                port: Some(port),
                direction: Direction::Redirect,
                chain: main.clone(),
                table: Table::Nat,
            },
            RuleSpec {
                command: format!(
                    "{binary} -t nat -{flag} {output} -m owner ! --uid-owner {excluded_identity} -p tcp --dport {port} -j DNAT --to {}:{to_port}",
                    self.policy.loopback
                ),
                port: Some(port),
                direction: Direction::Exclude,
                chain: output.clone(),
                table: Table::Nat,
            },
        ]
    }
}
