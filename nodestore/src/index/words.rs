use crate::document::{self, Document};
use std::collections::BTreeSet;

/// Split `content` into a set of lowercase words. Characters outside
/// `allowed` separate words.
pub fn words(content: &str, allowed: &str) -> BTreeSet<String> {
    let cleaned: String = content
        .to_lowercase()
        .chars()
        .map(|c| if allowed.contains(c) && c != ' ' { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().map(str::to_string).collect()
}

/// The whole phrase as one token: normalized like `words`, with single
/// spaces between the words.
pub fn phrase(content: &str, allowed: &str) -> String {
    let cleaned: String = content
        .to_lowercase()
        .chars()
        .map(|c| if allowed.contains(c) && c != ' ' { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Turns a node into indexable text.
pub trait Extractor: Send + Sync {
    fn content(&self, node: &Document, id: &str) -> String;

    /// Words to index instead of tokenizing `content`.
    fn words(&self, _node: &Document, _id: &str) -> Option<Vec<String>> {
        None
    }
}

/// Indexes every scalar leaf of the node.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl Extractor for DefaultExtractor {
    fn content(&self, node: &Document, _id: &str) -> String {
        document::to_text(node)
    }
}

impl<F> Extractor for F
where
    F: Fn(&Document, &str) -> String + Send + Sync,
{
    fn content(&self, node: &Document, id: &str) -> String {
        self(node, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_INDEX_CHARS;
    use serde_json::json;

    #[test]
    fn test_words_are_a_lowercase_set() {
        let found = words("Peter NASH, peter-nash!", DEFAULT_INDEX_CHARS);
        let expected: BTreeSet<String> = ["nash", "peter"].iter().map(|s| s.to_string()).collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_phrase_collapses_separators() {
        assert_eq!(phrase("  Jo,   Nas ", DEFAULT_INDEX_CHARS), "jo nas");
        assert!(words("!!!", DEFAULT_INDEX_CHARS).is_empty());
    }

    #[test]
    fn test_extractors() {
        let node = json!({"name": "Peter Nash", "age": 25});
        assert_eq!(DefaultExtractor.content(&node, "x"), "25 Peter Nash");

        let by_name = |node: &Document, _: &str| node["name"].as_str().unwrap_or_default().to_string();
        assert_eq!(by_name.content(&node, "x"), "Peter Nash");
        assert_eq!(by_name.words(&node, "x"), None);
    }
}
