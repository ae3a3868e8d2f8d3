//! Key references in MCP tool output.
//!
//! Local MCP servers (reference managers, task trackers) list items as
//! `**Name** (Key: XYZ)` or as a `**Title:** ...` line followed later by an
//! `**Item Key:** ...` line. The agent collects these so follow-up calls can
//! pass real identifiers instead of titles.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// At most this many references are returned.
pub const MAX_KEY_REFERENCES: usize = 50;

static INLINE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*([^*\n]+?)\*\*\s*\(Key:\s*([^)\s]+)\s*\)").expect("valid inline key regex")
});

static TITLE_ITEM_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*Title:\*\*\s*([^\n]+?)\s*\n(?:[^\n]*\n)*?\s*\*\*Item Key:\*\*\s*([^\s*]+)")
        .expect("valid title/item key regex")
});

/// A name paired with the identifier a tool expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct McpKeyReference {
    pub name: String,
    pub key: String,
}

/// Extract key references from tool output texts, in order of appearance.
///
/// Duplicates (same name and key) are dropped; the result is capped at
/// [`MAX_KEY_REFERENCES`].
pub fn extract_mcp_key_reference<S: AsRef<str>>(texts: &[S]) -> Vec<McpKeyReference> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut refs = Vec::new();

    for text in texts {
        let text = text.as_ref();
        let mut found: Vec<(usize, &str, &str)> = INLINE_KEY_RE
            .captures_iter(text)
            .chain(TITLE_ITEM_KEY_RE.captures_iter(text))
            .filter_map(|c| {
                let whole = c.get(0)?;
                Some((whole.start(), c.get(1)?.as_str(), c.get(2)?.as_str()))
            })
            .collect();
        found.sort_by_key(|(pos, _, _)| *pos);

        for (_, name, key) in found {
            let name = name.trim();
            let key = key.trim();
            if name.is_empty() || key.is_empty() {
                continue;
            }
            if !seen.insert(format!("{name}::{key}")) {
                continue;
            }
            refs.push(McpKeyReference {
                name: name.to_string(),
                key: key.to_string(),
            });
            if refs.len() >= MAX_KEY_REFERENCES {
                return refs;
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_key_pattern() {
        let text = "Results:\n- **Attention Is All You Need** (Key: ABCD1234)\n- **BERT** (Key: EFGH5678)";
        let refs = extract_mcp_key_reference(&[text]);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "Attention Is All You Need");
        assert_eq!(refs[0].key, "ABCD1234");
        assert_eq!(refs[1].key, "EFGH5678");
    }

    #[test]
    fn test_title_item_key_pattern() {
        let text = "**Title:** Deep Learning\n**Authors:** LeCun et al.\n**Year:** 2015\n**Item Key:** QWER9876\n";
        let refs = extract_mcp_key_reference(&[text]);
        assert_eq!(
            refs,
            vec![McpKeyReference {
                name: "Deep Learning".into(),
                key: "QWER9876".into()
            }]
        );
    }

    #[test]
    fn test_dedup_across_texts() {
        let a = "**Paper** (Key: K1)";
        let b = "**Paper** (Key: K1) and **Paper** (Key: K2)";
        let refs = extract_mcp_key_reference(&[a, b]);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].key, "K2");
    }

    #[test]
    fn test_cap_at_fifty() {
        let text: String = (0..80).map(|i| format!("**Item {i}** (Key: K{i})\n")).collect();
        let refs = extract_mcp_key_reference(&[text]);
        assert_eq!(refs.len(), MAX_KEY_REFERENCES);
        assert_eq!(refs[49].key, "K49");
    }

    #[test]
    fn test_no_references() {
        assert!(extract_mcp_key_reference(&["nothing here"]).is_empty());
        assert!(extract_mcp_key_reference::<&str>(&[]).is_empty());
    }
}
