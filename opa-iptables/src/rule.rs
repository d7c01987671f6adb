//! Packet-filter rules as served by the policy engine.
//!
//! A [`Rule`] is decoded from a policy document and rendered into the
//! argument list understood by `iptables`. Two rules are the same rule when
//! their table, chain and rendered specification match; that equality drives
//! the watcher's diff.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

/// Tables known to iptables, used when listing every rule on the host.
pub const TABLES: &[&str] = &["filter", "nat", "mangle", "raw", "security"];

const DEFAULT_TABLE: &str = "filter";

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

/// A single iptables rule.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Rule {
    #[serde(default = "default_table")]
    pub table: String,
    pub chain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_address: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_port: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub destination_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Extra match arguments passed through verbatim (e.g. `-m state --state NEW`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump: Option<String>,
    /// Target options following `-j` (e.g. `--reject-with tcp-reset`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_args: Vec<String>,
}

/// Ports may be written as numbers or as strings (`"1000:2000"`).
fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    Ok(Option::<Port>::deserialize(deserializer)?.map(|p| match p {
        Port::Number(n) => n.to_string(),
        Port::Text(s) => s,
    }))
}

impl Rule {
    /// Create a rule with only table and chain set.
    pub fn new(table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            chain: chain.into(),
            protocol: None,
            source_address: None,
            destination_address: None,
            source_port: None,
            destination_port: None,
            in_interface: None,
            out_interface: None,
            comment: None,
            match_args: Vec::new(),
            jump: None,
            target_args: Vec::new(),
        }
    }

    /// Argument list after `-A <chain>`, in the order `iptables -S` prints it.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: &Option<String>| {
            if let Some(v) = value {
                args.push(flag.to_string());
                args.push(v.clone());
            }
        };

        push("-s", &self.source_address);
        push("-d", &self.destination_address);
        push("-i", &self.in_interface);
        push("-o", &self.out_interface);
        push("-p", &self.protocol);

        if self.source_port.is_some() || self.destination_port.is_some() {
            // Port matches need the protocol's match module loaded.
            if let Some(proto) = &self.protocol {
                args.push("-m".to_string());
                args.push(proto.clone());
            }
            if let Some(p) = &self.source_port {
                args.push("--sport".to_string());
                args.push(p.clone());
            }
            if let Some(p) = &self.destination_port {
                args.push("--dport".to_string());
                args.push(p.clone());
            }
        }

        args.extend(self.match_args.iter().cloned());

        if let Some(c) = &self.comment {
            args.push("-m".to_string());
            args.push("comment".to_string());
            args.push("--comment".to_string());
            args.push(c.clone());
        }

        if let Some(j) = &self.jump {
            args.push("-j".to_string());
            args.push(j.clone());
            args.extend(self.target_args.iter().cloned());
        }

        args
    }

    /// Canonical specification string; the basis of rule equality.
    pub fn spec(&self) -> String {
        join_args(&self.args())
    }

    /// Parse one line of `iptables -t <table> -S` output.
    ///
    /// Returns `Ok(None)` for lines that do not describe a rule (`-P`, `-N`).
    pub fn from_listing(table: &str, line: &str) -> Result<Option<Rule>, String> {
        let tokens = split_args(line)?;
        let mut iter = tokens.into_iter().peekable();

        match iter.next().as_deref() {
            Some("-A") => {}
            Some(_) | None => return Ok(None),
        }
        let chain = iter
            .next()
            .ok_or_else(|| format!("missing chain in rule listing: {line}"))?;

        let mut rule = Rule::new(table, chain);
        while let Some(tok) = iter.next() {
            let mut value = |flag: &str| {
                iter.next()
                    .ok_or_else(|| format!("missing value for {flag} in rule listing: {line}"))
            };
            match tok.as_str() {
                "-s" => rule.source_address = Some(value("-s")?),
                "-d" => rule.destination_address = Some(value("-d")?),
                "-i" => rule.in_interface = Some(value("-i")?),
                "-o" => rule.out_interface = Some(value("-o")?),
                "-p" => rule.protocol = Some(value("-p")?),
                "--sport" => rule.source_port = Some(value("--sport")?),
                "--dport" => rule.destination_port = Some(value("--dport")?),
                "-m" => {
                    let module = value("-m")?;
                    if module == "comment" {
                        continue;
                    }
                    if rule.protocol.as_deref() == Some(module.as_str()) {
                        continue;
                    }
                    rule.match_args.push(tok);
                    rule.match_args.push(module);
                }
                "--comment" => rule.comment = Some(value("--comment")?),
                "!" => {
                    // Negated matches are kept verbatim, with their operand if the flag takes one.
                    let flag = value("!")?;
                    rule.match_args.push(tok);
                    rule.match_args.push(flag);
                    if let Some(operand) = iter.next_if(|next| !next.starts_with('-')) {
                        rule.match_args.push(operand);
                    }
                }
                "-j" => {
                    rule.jump = Some(value("-j")?);
                    rule.target_args.extend(iter.by_ref());
                }
                _ => rule.match_args.push(tok),
            }
        }

        Ok(Some(rule))
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.chain == other.chain && self.spec() == other.spec()
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.chain.hash(state);
        self.spec().hash(state);
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} -A {}", self.table, self.chain)?;
        let spec = self.spec();
        if !spec.is_empty() {
            write!(f, " {spec}")?;
        }
        Ok(())
    }
}

/// Ordered rules for one target. Order is insertion order in the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    /// Decode a policy engine answer of the form `{"result": {"rules": [...]}}`.
    ///
    /// An undefined document (no `result`) is an empty rule set.
    pub fn from_policy_answer(body: &[u8]) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct Answer {
            #[serde(default)]
            result: Option<RuleSet>,
        }

        let answer: Answer = serde_json::from_slice(body)?;
        Ok(answer.result.unwrap_or_default())
    }
}

impl From<Vec<Rule>> for RuleSet {
    fn from(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

impl IntoIterator for RuleSet {
    type Item = Rule;
    type IntoIter = std::vec::IntoIter<Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.into_iter()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

fn join_args(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if a.is_empty() || a.contains(char::is_whitespace) || a.contains('"') {
                format!("\"{}\"", a.replace('"', "\\\""))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a listing line into arguments, honoring double quotes.
fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if in_quotes {
        return Err(format!("unterminated quote in rule listing: {line}"));
    }
    if has_token {
        args.push(current);
    }
    Ok(args)
}
