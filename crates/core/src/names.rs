//! Full tool name codec and content hashing.
//!
//! A tool is addressed within a namespace as `serverName__toolName`. Server
//! names are unique per owner, so full names are unique by construction.

use sha2::{Digest, Sha256};

/// Separator between the server segment and the tool segment.
pub const TOOL_SEPARATOR: &str = "__";

/// Synthetic semantic-search tool exposed under smart discovery.
pub const FIND_TOOL_NAME: &str = "metamcp__find";

/// Synthetic ask-agent tool exposed under smart discovery.
pub const ASK_TOOL_NAME: &str = "metamcp__ask";

/// Whether a name refers to one of the gateway's own synthetic tools.
pub fn is_synthetic_tool(name: &str) -> bool {
    name == FIND_TOOL_NAME || name == ASK_TOOL_NAME
}

/// Build the full name a downstream client sees.
pub fn full_tool_name(server_name: &str, tool_name: &str) -> String {
    format!("{server_name}{TOOL_SEPARATOR}{tool_name}")
}

/// Split a full name on the *first* separator.
///
/// Returns `None` when the name carries no separator or either side is
/// empty; such names are malformed and cannot be dispatched.
pub fn split_tool_name(full_name: &str) -> Option<(&str, &str)> {
    let (server, tool) = full_name.split_once(TOOL_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Stable hash over a tool's descriptive fields.
///
/// The discovery index re-embeds a tool only when this changes. Fields are
/// joined with a unit separator so `("ab", "c")` and `("a", "bc")` hash
/// differently.
pub fn content_hash(name: &str, title: Option<&str>, description: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(title.unwrap_or_default().as_bytes());
    hasher.update([0x1f]);
    hasher.update(description.unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let full = full_tool_name("alpha", "read");
        assert_eq!(full, "alpha__read");
        assert_eq!(split_tool_name(&full), Some(("alpha", "read")));
    }

    #[test]
    fn split_takes_first_separator() {
        // Nested gateways produce names like meta__server__tool; the first
        // segment is the member server, the rest is forwarded verbatim.
        assert_eq!(
            split_tool_name("meta__files__read"),
            Some(("meta", "files__read"))
        );
    }

    #[test]
    fn malformed_names_do_not_split() {
        assert_eq!(split_tool_name("no-separator"), None);
        assert_eq!(split_tool_name("__tool"), None);
        assert_eq!(split_tool_name("server__"), None);
    }

    #[test]
    fn hash_is_field_boundary_aware() {
        assert_ne!(
            content_hash("ab", Some("c"), None),
            content_hash("a", Some("bc"), None)
        );
        assert_eq!(
            content_hash("read", None, Some("d")),
            content_hash("read", None, Some("d"))
        );
    }
}
