//! Selection scripts — per-node predicates attached to a request.
//!
//! The built-in [`ExpressionEvaluator`] understands one clause per line:
//!
//! ```text
//! # comments and blank lines are ignored
//! host == rack-1
//! url =~ ^pnp://10\.0\.
//! token contains $team
//! source != cloud
//! ```
//!
//! Attributes: `url`, `host`, `source`, `token`. Operators: `==`, `!=`,
//! `=~` (regex), `contains`. A value starting with `$` is looked up in
//! the request bindings. Every clause must hold for the node to qualify.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use gridpool_core::config::SelectionConfig;
use gridpool_core::criteria::content_digest;
use gridpool_core::{Bindings, CriteriaError, CriteriaResult, Node, SelectionScript};

/// Result type alias for script evaluation.
pub type ScriptResult<T> = Result<T, ScriptError>;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("unbound variable: ${0}")]
    UnboundVariable(String),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
}

/// Evaluates selection scripts against candidate nodes.
///
/// A script is compiled once per request, with the request bindings,
/// and the result is then matched against every candidate. Neither step
/// may touch the registry: both run inside the selection critical
/// section.
pub trait ScriptEvaluator: Send + Sync {
    /// Prepare `script` for matching under `bindings`.
    fn compile(&self, script: &SelectionScript, bindings: &Bindings) -> ScriptResult<Box<dyn CompiledScript>>;

    /// Whether `node` satisfies `script`.
    fn evaluate(&self, script: &SelectionScript, node: &Node, bindings: &Bindings) -> ScriptResult<bool> {
        Ok(self.compile(script, bindings)?.matches(node))
    }

    /// Reject a script before any node is looked at.
    fn check(&self, _script: &SelectionScript) -> ScriptResult<()> {
        Ok(())
    }
}

/// A script bound to one request's variables.
pub trait CompiledScript: Send + Sync {
    fn matches(&self, node: &Node) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribute {
    Url,
    Host,
    Source,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Matches,
    Contains,
}

#[derive(Debug, Clone)]
struct Clause {
    attribute: Attribute,
    operator: Operator,
    value: String,
}

/// The default clause-list evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    fn parse(content: &str) -> ScriptResult<Vec<Clause>> {
        let mut clauses = Vec::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line == "true" {
                continue;
            }
            let parse_err = |reason: &str| ScriptError::Parse {
                line: index + 1,
                reason: reason.to_string(),
            };

            let mut parts = line.splitn(3, char::is_whitespace);
            let attribute = match parts.next() {
                Some("url") => Attribute::Url,
                Some("host") => Attribute::Host,
                Some("source") => Attribute::Source,
                Some("token") => Attribute::Token,
                Some(other) => return Err(ScriptError::UnknownAttribute(other.to_string())),
                None => return Err(parse_err("missing attribute")),
            };
            let operator = match parts.next() {
                Some("==") => Operator::Eq,
                Some("!=") => Operator::Ne,
                Some("=~") => Operator::Matches,
                Some("contains") => Operator::Contains,
                Some(other) => return Err(parse_err(&format!("unknown operator {other}"))),
                None => return Err(parse_err("missing operator")),
            };
            let value = parts
                .next()
                .map(|v| v.trim().trim_matches('"').to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| parse_err("missing value"))?;

            clauses.push(Clause {
                attribute,
                operator,
                value,
            });
        }
        Ok(clauses)
    }

    fn resolve<'a>(value: &'a str, bindings: &'a Bindings) -> ScriptResult<&'a str> {
        match value.strip_prefix('$') {
            Some(name) => bindings
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| ScriptError::UnboundVariable(name.to_string())),
            None => Ok(value),
        }
    }

    fn bind(clause: &Clause, bindings: &Bindings) -> ScriptResult<BoundClause> {
        let value = Self::resolve(&clause.value, bindings)?;
        let test = match clause.operator {
            Operator::Eq => Test::Eq(value.to_string()),
            Operator::Ne => Test::Ne(value.to_string()),
            Operator::Contains => Test::Contains(value.to_string()),
            Operator::Matches => Test::Matches(Regex::new(value)?),
        };
        Ok(BoundClause {
            attribute: clause.attribute,
            test,
        })
    }
}

#[derive(Debug)]
enum Test {
    Eq(String),
    Ne(String),
    Contains(String),
    Matches(Regex),
}

#[derive(Debug)]
struct BoundClause {
    attribute: Attribute,
    test: Test,
}

impl BoundClause {
    fn holds(&self, node: &Node) -> bool {
        if self.attribute == Attribute::Token {
            return match &self.test {
                Test::Eq(value) | Test::Contains(value) => node.has_token(value),
                Test::Ne(value) => !node.has_token(value),
                Test::Matches(re) => node.access_tokens.iter().any(|t| re.is_match(t)),
            };
        }

        let actual = match self.attribute {
            Attribute::Url => node.url.as_str(),
            Attribute::Host => node.host_id.as_str(),
            Attribute::Source => node.source_id.as_str(),
            Attribute::Token => unreachable!("handled above"),
        };
        match &self.test {
            Test::Eq(value) => actual == value,
            Test::Ne(value) => actual != value,
            Test::Contains(value) => actual.contains(value.as_str()),
            Test::Matches(re) => re.is_match(actual),
        }
    }
}

/// Clauses of an [`ExpressionEvaluator`] script, variables substituted
/// and regexes built.
#[derive(Debug)]
struct CompiledExpression {
    clauses: Vec<BoundClause>,
}

impl CompiledScript for CompiledExpression {
    fn matches(&self, node: &Node) -> bool {
        self.clauses.iter().all(|clause| clause.holds(node))
    }
}

impl ScriptEvaluator for ExpressionEvaluator {
    fn compile(&self, script: &SelectionScript, bindings: &Bindings) -> ScriptResult<Box<dyn CompiledScript>> {
        let clauses = Self::parse(&script.content)?
            .iter()
            .map(|clause| Self::bind(clause, bindings))
            .collect::<ScriptResult<Vec<_>>>()?;
        Ok(Box::new(CompiledExpression { clauses }))
    }

    fn check(&self, script: &SelectionScript) -> ScriptResult<()> {
        let clauses = Self::parse(&script.content)?;
        for clause in clauses {
            if clause.operator == Operator::Matches && !clause.value.starts_with('$') {
                Regex::new(&clause.value)?;
            }
        }
        Ok(())
    }
}

/// Allow-list of script digests. With no list, every script is allowed.
#[derive(Debug, Clone, Default)]
pub struct ScriptAuthorizer {
    digests: Option<HashSet<String>>,
}

impl ScriptAuthorizer {
    pub fn allow_all() -> Self {
        Self { digests: None }
    }

    pub fn from_digests<I, S>(digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            digests: Some(digests.into_iter().map(|d| d.into().to_lowercase()).collect()),
        }
    }

    /// Build the allow-list from configured digests plus every file of the
    /// configured script directory.
    pub fn from_config(config: &SelectionConfig) -> std::io::Result<Self> {
        if config.authorized_script_digests.is_empty() && config.authorized_script_dir.is_none() {
            return Ok(Self::allow_all());
        }
        let mut digests: HashSet<String> = config
            .authorized_script_digests
            .iter()
            .map(|d| d.to_lowercase())
            .collect();
        if let Some(dir) = &config.authorized_script_dir {
            digests.extend(load_dir_digests(dir)?);
        }
        Ok(Self {
            digests: Some(digests),
        })
    }

    pub fn is_restricted(&self) -> bool {
        self.digests.is_some()
    }

    /// Fail on the first script that is not on the allow-list.
    pub fn check(&self, scripts: &[SelectionScript]) -> CriteriaResult<()> {
        let Some(digests) = &self.digests else {
            return Ok(());
        };
        for script in scripts {
            let digest = script.digest();
            if !digests.contains(&digest) {
                return Err(CriteriaError::UnauthorizedScript(digest));
            }
        }
        Ok(())
    }
}

fn load_dir_digests(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut digests = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            let content = std::fs::read_to_string(&path)?;
            debug!(?path, "authorized selection script loaded");
            digests.push(content_digest(&content));
        }
    }
    Ok(digests)
}
