//! Allow/deny evaluation for agent tool calls.

use metamcp_core::is_synthetic_tool;

/// Tool policy from an agent's configuration.
///
/// A name is allowed when it is not denied and either the allowlist is empty
/// or contains it. Synthetic gateway tools are never allowed regardless of
/// the lists; an agent calling back into `metamcp__ask` would recurse.
#[derive(Debug, Clone, Copy)]
pub struct ToolPolicy<'a> {
    allowed: &'a [String],
    denied: &'a [String],
}

impl<'a> ToolPolicy<'a> {
    pub fn new(allowed: &'a [String], denied: &'a [String]) -> Self {
        Self { allowed, denied }
    }

    pub fn is_allowed(&self, full_name: &str) -> bool {
        if is_synthetic_tool(full_name) {
            return false;
        }
        if self.denied.iter().any(|d| d == full_name) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.iter().any(|a| a == full_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lists_allow_everything_but_synthetics() {
        let policy = ToolPolicy::new(&[], &[]);
        assert!(policy.is_allowed("alpha__read"));
        assert!(!policy.is_allowed("metamcp__find"));
        assert!(!policy.is_allowed("metamcp__ask"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let allowed = vec!["alpha__read".to_string()];
        let denied = vec!["alpha__read".to_string()];
        let policy = ToolPolicy::new(&allowed, &denied);
        assert!(!policy.is_allowed("alpha__read"));
    }

    #[test]
    fn non_empty_allowlist_is_exclusive() {
        let allowed = vec!["alpha__read".to_string()];
        let policy = ToolPolicy::new(&allowed, &[]);
        assert!(policy.is_allowed("alpha__read"));
        assert!(!policy.is_allowed("alpha__write"));
    }
}
