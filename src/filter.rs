// System
use std::collections::BTreeSet;

// Third Party
use anyhow::Context;
use regex::Regex;

/// Namespaces that are never reported.
pub const DEFAULT_EXCLUDED_NAMESPACES: [&str; 5] =
    ["default", "kube-system", "kube-public", "local", "tools"];

/// Namespaces created per project, user or by Rancher are not reported either.
pub const DEFAULT_EXCLUDED_PATTERN: &str = "^(c|p|u|user|cattle)-";

/// Decides whether the resources of a namespace should ever be observed.
#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    excluded: BTreeSet<String>,
    pattern: Regex,
}

impl Default for NamespaceFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED_NAMESPACES, DEFAULT_EXCLUDED_PATTERN)
            .expect("default namespace exclusion pattern compiles")
    }
}

impl NamespaceFilter {
    pub fn new<I, S>(excluded: I, pattern: &str) -> Result<Self, anyhow::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("Invalid namespace exclusion pattern `{}`", pattern))?;
        Ok(Self {
            excluded: excluded.into_iter().map(Into::into).collect(),
            pattern,
        })
    }

    /// Returns `true` when resources in `namespace` may be reported.
    pub fn allows(&self, namespace: &str) -> bool {
        !self.excluded.contains(namespace) && !self.pattern.is_match(namespace)
    }
}
