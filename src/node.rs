use std::fmt::Write;
use std::ops::Range;

use crate::grammars::GlobalRuleRef;

/// What the incremental updater needs to know about a begin/end node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct BlockInfo {
    /// The begin/end rule that opened the block
    pub rule: GlobalRuleRef,
    /// Byte length of the begin delimiter match
    pub begin_len: usize,
    /// Byte length of the end delimiter match, 0 if the block was never closed
    pub end_len: usize,
    /// The end regex was filled with text captured outside the begin delimiter
    pub end_outside_begin: bool,
}

/// A named region of the parsed text.
///
/// Children are fully contained in their parent, sorted by start and never overlap.
/// Two nodes are equal if they have the same region, name and children.
#[derive(Debug, Clone)]
pub struct Node {
    /// Byte span within the text (start inclusive, end exclusive)
    pub region: Range<usize>,
    /// Scope name, eg `keyword.control.c`. Empty for anonymous nodes.
    pub name: String,
    pub children: Vec<Node>,
    pub(crate) block: Option<BlockInfo>,
}

/// A contiguous piece of text along with the names of all the nodes enclosing it,
/// from outermost to innermost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSpan<'a> {
    pub range: Range<usize>,
    pub scopes: Vec<&'a str>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.region == other.region && self.name == other.name && self.children == other.children
    }
}

impl Eq for Node {}

impl Node {
    pub fn new(name: impl Into<String>, region: Range<usize>) -> Self {
        Self {
            region,
            name: name.into(),
            children: Vec::new(),
            block: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Whether this node was produced by a begin/end pattern
    pub fn is_block(&self) -> bool {
        self.block.is_some()
    }

    /// For blocks, the region between the begin and end delimiters
    pub fn content_region(&self) -> Option<Range<usize>> {
        let block = self.block?;
        let start = (self.region.start + block.begin_len).min(self.region.end);
        let end = self.region.end.saturating_sub(block.end_len).max(start);
        Some(start..end)
    }

    /// Moves this node to account for an edit at `pos` changing the text length by `delta`.
    ///
    /// Nodes starting at or after `pos` are shifted, nodes straddling it are stretched or
    /// shrunk and their children adjusted the same way. Nodes before `pos` are untouched.
    pub fn adjust(&mut self, pos: usize, delta: isize) {
        if self.region.start >= pos {
            self.shift(pos, delta);
        } else if self.region.end >= pos {
            self.region.end = self.region.end.saturating_add_signed(delta).max(pos);
            for child in &mut self.children {
                child.adjust(pos, delta);
            }
        }
    }

    /// Shifts the whole subtree, never moving anything before `floor`
    fn shift(&mut self, floor: usize, delta: isize) {
        let start = self.region.start.saturating_add_signed(delta).max(floor);
        let end = self.region.end.saturating_add_signed(delta).max(start);
        self.region = start..end;
        for child in &mut self.children {
            child.shift(floor, delta);
        }
    }

    /// Names of the nodes containing `pos`, outermost first. Anonymous nodes are skipped.
    pub fn scopes_at(&self, pos: usize) -> Vec<&str> {
        let mut out = Vec::new();
        let mut node = self;
        if !node.region.contains(&pos) {
            return out;
        }
        loop {
            if !node.name.is_empty() {
                out.push(node.name.as_str());
            }
            match node.children.iter().find(|c| c.region.contains(&pos)) {
                Some(child) => node = child,
                None => return out,
            }
        }
    }

    /// Flattens the tree into contiguous spans covering the whole node region.
    ///
    /// Text not covered by any child is attributed to the innermost node around it, so
    /// concatenating the text of every span gives back the text of the region.
    pub fn spans(&self) -> Vec<ScopeSpan<'_>> {
        let mut out = Vec::new();
        let mut scopes = Vec::new();
        self.collect_spans(&mut scopes, &mut out);
        out
    }

    fn collect_spans<'a>(&'a self, scopes: &mut Vec<&'a str>, out: &mut Vec<ScopeSpan<'a>>) {
        let named = !self.name.is_empty();
        if named {
            scopes.push(&self.name);
        }

        let mut pos = self.region.start;
        for child in &self.children {
            if child.region.start > pos {
                out.push(ScopeSpan {
                    range: pos..child.region.start,
                    scopes: scopes.clone(),
                });
            }
            child.collect_spans(scopes, out);
            pos = pos.max(child.region.end);
        }
        if pos < self.region.end {
            out.push(ScopeSpan {
                range: pos..self.region.end,
                scopes: scopes.clone(),
            });
        }

        if named {
            scopes.pop();
        }
    }

    /// Human readable tree, leaves showing the text they cover.
    ///
    /// ```text
    /// 0-3: "meta.block"
    ///   1-2: "" - Data: "x"
    /// ```
    pub fn dump(&self, text: &str) -> String {
        let mut out = String::new();
        self.format(text, 0, &mut out);
        out
    }

    fn format(&self, text: &str, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        let _ = write!(
            out,
            "{indent}{}-{}: {:?}",
            self.region.start, self.region.end, self.name
        );
        if self.is_leaf() {
            let data = text.get(self.region.clone()).unwrap_or_default();
            let _ = writeln!(out, " - Data: {data:?}");
            return;
        }
        out.push('\n');
        for child in &self.children {
            child.format(text, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Node {
        // "ab {cd} ef"
        let mut root = Node::new("source.t", 0..10);
        root.children.push(Node::new("kw", 0..2));
        let mut block = Node::new("meta.block", 3..7);
        block.children.push(Node::new("", 4..6));
        root.children.push(block);
        root.children.push(Node::new("kw", 8..10));
        root
    }

    #[test]
    fn spans_cover_whole_region() {
        let text = "ab {cd} ef";
        let root = tree();
        let spans = root.spans();
        let rebuilt: String = spans.iter().map(|s| &text[s.range.clone()]).collect();
        assert_eq!(rebuilt, text);
        assert_eq!(spans[0].scopes, vec!["source.t", "kw"]);
        assert_eq!(spans[1].range, 2..3);
        assert_eq!(spans[1].scopes, vec!["source.t"]);
        assert_eq!(spans[2].range, 3..4);
        assert_eq!(spans[2].scopes, vec!["source.t", "meta.block"]);
        // the anonymous node does not add a scope
        assert_eq!(spans[3].scopes, vec!["source.t", "meta.block"]);
    }

    #[test]
    fn adjust_shifts_and_stretches() {
        let mut root = tree();
        // insert 2 bytes inside the block content
        root.adjust(5, 2);
        assert_eq!(root.region, 0..12);
        assert_eq!(root.children[0].region, 0..2);
        assert_eq!(root.children[1].region, 3..9);
        assert_eq!(root.children[1].children[0].region, 4..8);
        assert_eq!(root.children[2].region, 10..12);

        // delete them again
        root.adjust(5, -2);
        assert_eq!(root, tree());
    }

    #[test]
    fn scopes_at_position() {
        let root = tree();
        assert_eq!(root.scopes_at(5), vec!["source.t", "meta.block"]);
        assert_eq!(root.scopes_at(0), vec!["source.t", "kw"]);
        assert!(root.scopes_at(42).is_empty());
    }

    #[test]
    fn dump_shows_leaf_text() {
        let out = tree().dump("ab {cd} ef");
        insta::assert_snapshot!(out, @r#"
        0-10: "source.t"
          0-2: "kw" - Data: "ab"
          3-7: "meta.block"
            4-6: "" - Data: "cd"
          8-10: "kw" - Data: "ef"
        "#);
    }
}
