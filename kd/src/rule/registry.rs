//! Rule trait and the name-to-rule registry

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::context::Context;
use super::error::BuildError;
use super::result::RuleResult;

/// Whether a rule's value is cached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Deterministic producer; results are committed to the cache
    Build,
    /// Side-effecting operation; never cached
    Action,
}

/// A named, versioned build function
///
/// The body runs on a blocking thread and may do file and process IO.
/// Bumping `version` invalidates every cached result of the rule.
pub trait Rule: Send + Sync {
    fn version(&self) -> &str {
        "1"
    }

    fn kind(&self) -> RuleKind {
        RuleKind::Build
    }

    fn build(&self, ctx: &Context) -> Result<RuleResult, BuildError>;
}

/// Rule backed by a closure
pub struct FnRule<F> {
    version: String,
    kind: RuleKind,
    body: F,
}

/// Wrap a closure as a build rule at version "1"
pub fn rule_fn<F>(body: F) -> FnRule<F>
where
    F: Fn(&Context) -> Result<RuleResult, BuildError> + Send + Sync + 'static,
{
    FnRule {
        version: "1".to_string(),
        kind: RuleKind::Build,
        body,
    }
}

impl<F> FnRule<F> {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Mark as an uncached action
    pub fn action(mut self) -> Self {
        self.kind = RuleKind::Action;
        self
    }
}

impl<F> Rule for FnRule<F>
where
    F: Fn(&Context) -> Result<RuleResult, BuildError> + Send + Sync + 'static,
{
    fn version(&self) -> &str {
        &self.version
    }

    fn kind(&self) -> RuleKind {
        self.kind
    }

    fn build(&self, ctx: &Context) -> Result<RuleResult, BuildError> {
        (self.body)(ctx)
    }
}

/// Rules addressable by `namespace.name`
///
/// Project manifests may import a namespace under an alias; `alias.name`
/// then resolves to `namespace.name`.
#[derive(Default)]
pub struct RuleRegistry {
    rules: HashMap<String, Arc<dyn Rule>>,
    imports: RwLock<HashMap<String, String>>,
}

impl RuleRegistry {
    /// Registry with no rules (for testing)
    pub fn empty() -> Self {
        debug!("RuleRegistry::empty: called");
        Self::default()
    }

    /// Registry with the built-in plugins
    pub fn standard() -> Self {
        debug!("RuleRegistry::standard: called");
        let mut registry = Self::empty();
        crate::plugins::register_builtins(&mut registry);
        registry
    }

    /// Register `rule` as `namespace.name`, replacing any previous rule
    pub fn register(&mut self, namespace: &str, name: &str, rule: impl Rule + 'static) -> &mut Self {
        let full = format!("{}.{}", namespace, name);
        debug!(rule = %full, "RuleRegistry::register: called");
        if self.rules.insert(full.clone(), Arc::new(rule)).is_some() {
            warn!(rule = %full, "RuleRegistry::register: replaced existing rule");
        }
        self
    }

    /// Replace the alias table
    pub fn set_imports(&self, imports: HashMap<String, String>) {
        debug!(count = imports.len(), "RuleRegistry::set_imports: called");
        if let Ok(mut current) = self.imports.write() {
            *current = imports;
        }
    }

    /// Resolve a possibly aliased name to its canonical name and rule
    pub fn resolve(&self, name: &str) -> Result<(String, Arc<dyn Rule>), BuildError> {
        if let Some(rule) = self.rules.get(name) {
            return Ok((name.to_string(), Arc::clone(rule)));
        }
        if let Some((alias, rest)) = name.split_once('.')
            && let Ok(imports) = self.imports.read()
            && let Some(namespace) = imports.get(alias)
        {
            let full = format!("{}.{}", namespace, rest);
            if let Some(rule) = self.rules.get(&full) {
                debug!(%name, %full, "RuleRegistry::resolve: resolved alias");
                return Ok((full, Arc::clone(rule)));
            }
        }
        Err(BuildError::UnknownRule(name.to_string()))
    }

    /// Canonical names of all rules, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
