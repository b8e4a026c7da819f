use std::ops::Range;
use std::sync::Arc;

use crate::error::{Error, ScopeTreeResult};
use crate::grammars::Grammar;
use crate::node::Node;
use crate::options::ParseOptions;
use crate::registry::Registry;

mod cache;
mod engine;
mod incremental;
mod stack;

pub use cache::CacheStats;

use engine::{Engine, floor_char_boundary};
use incremental::TextEdit;

/// One document being parsed with one grammar.
///
/// Owns the text, the last tree built for it and every cache derived from the grammars.
/// Borrows the registry to load the grammars that includes refer to.
pub struct ParsingContext<'r> {
    engine: Engine<'r>,
    text: String,
    root: Option<Node>,
    /// False when the last parse ran out of budget, `root` is then partial
    complete: bool,
    options: ParseOptions,
}

impl<'r> ParsingContext<'r> {
    pub fn new(registry: &'r Registry, grammar: Arc<Grammar>, text: impl Into<String>) -> Self {
        Self {
            engine: Engine::new(registry, grammar),
            text: text.into(),
            root: None,
            complete: false,
            options: ParseOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ParseOptions) -> Self {
        self.options = options;
        self
    }

    pub fn set_options(&mut self, options: ParseOptions) {
        self.options = options;
    }

    /// The base grammar
    pub fn grammar(&self) -> &Grammar {
        self.engine.base_grammar()
    }

    pub fn registry(&self) -> &'r Registry {
        self.engine.registry()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The last tree built, possibly partial if a parse ran out of budget
    pub fn root(&self) -> Option<&Node> {
        self.root.as_ref()
    }

    /// The text between `start` and `end`, empty if the range is reversed.
    /// Bounds are clamped to the text and moved back to char boundaries.
    pub fn text_slice(&self, start: usize, end: usize) -> &str {
        let start = floor_char_boundary(&self.text, start);
        let end = floor_char_boundary(&self.text, end);
        self.text.get(start..end).unwrap_or("")
    }

    /// Builds the tree of the whole text, or returns the current one if it is up to date.
    pub fn parse(&mut self) -> ScopeTreeResult<&Node> {
        if self.root.is_none() || !self.complete {
            let mut budget = self.options.start_budget();
            let outcome = self.engine.parse_range(&self.text, 0..self.text.len(), &mut budget);
            log::debug!(
                "Parsed {} bytes with {}, {} top-level nodes",
                self.text.len(),
                self.engine.base_grammar().scope_name,
                outcome.root.children.len()
            );
            self.complete = outcome.complete;
            self.root = Some(outcome.root);
            if !self.complete {
                return Err(Error::ParseIncomplete {
                    parsed_up_to: outcome.parsed_up_to,
                });
            }
        }
        self.root.as_ref().ok_or(Error::ParseIncomplete { parsed_up_to: 0 })
    }

    /// Parses only `region`, as if the text ended at its end, and returns its top-level nodes.
    /// The tree of the whole text is left untouched.
    pub fn parse_region(&mut self, region: Range<usize>) -> ScopeTreeResult<Vec<Node>> {
        let start = floor_char_boundary(&self.text, region.start);
        let end = floor_char_boundary(&self.text, region.end).max(start);
        let mut budget = self.options.start_budget();
        let outcome = self.engine.parse_range(&self.text, start..end, &mut budget);
        if !outcome.complete {
            return Err(Error::ParseIncomplete {
                parsed_up_to: outcome.parsed_up_to,
            });
        }
        Ok(outcome.root.children)
    }

    /// Replaces the whole text, the next `parse` starts from scratch.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.clear_cache();
    }

    /// Replaces `range` of the text by `replacement` and updates the tree so that it is the
    /// same as the one a full parse of the new text gives.
    pub fn edit(&mut self, range: Range<usize>, replacement: &str) -> ScopeTreeResult<&Node> {
        let start = floor_char_boundary(&self.text, range.start);
        let end = floor_char_boundary(&self.text, range.end).max(start);
        self.text.replace_range(start..end, replacement);
        let edit = TextEdit::new(start, end - start, replacement.len());
        self.engine.clear_matches();

        // Nothing to update from: a partial tree cannot be trusted
        if !self.complete {
            return self.parse();
        }
        let mut budget = self.options.start_budget();
        let Some(root) = self.root.as_mut() else {
            return self.parse();
        };
        let updated = incremental::update_children(
            root,
            &edit,
            &mut self.engine,
            &self.text,
            &mut budget,
        );
        self.complete = updated.is_ok();
        updated?;
        self.root.as_ref().ok_or(Error::ParseIncomplete { parsed_up_to: 0 })
    }

    /// Drops the tree and every cached match, resolved include and pattern list.
    pub fn clear_cache(&mut self) {
        self.engine.clear();
        self.root = None;
        self.complete = false;
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.engine.cache_stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::test_utils::{assert_well_formed, get_registry, registry_with};

    const C_SAMPLE: &str = concat!(
        "#include <stdio.h>\n",
        "int main() {\n",
        "    if (x) { return 1; }\n",
        "    /* note */\n",
        "    return \"a'b\";\n",
        "}\n",
    );

    fn parse(registry: &Registry, scope: &str, text: &str) -> Node {
        let mut ctx = registry.create_parsing_context(scope, text);
        ctx.parse().unwrap().clone()
    }

    fn names(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn match_rules_become_leaves() {
        let registry = registry_with(
            r#"{
                "scopeName": "source.foo",
                "patterns": [{ "match": "\\bfoo\\b", "name": "keyword.foo" }]
            }"#,
        );
        let root = parse(&registry, "source.foo", "foo bar foo");
        assert_eq!(root.name, "source.foo");
        assert_eq!(root.region, 0..11);
        assert_eq!(
            root.children,
            vec![Node::new("keyword.foo", 0..3), Node::new("keyword.foo", 8..11)]
        );
    }

    #[test]
    fn begin_end_wraps_nested_matches() {
        let registry = registry_with(
            r#"{
                "scopeName": "source.foo",
                "patterns": [{
                    "begin": "\\{", "end": "\\}", "name": "meta.block",
                    "patterns": [{ "match": "\\bfoo\\b", "name": "keyword.foo" }]
                }]
            }"#,
        );
        let root = parse(&registry, "source.foo", "{ foo }");
        assert_eq!(root.children.len(), 1);
        let block = &root.children[0];
        assert_eq!(block.name, "meta.block");
        assert_eq!(block.region, 0..7);
        assert_eq!(block.content_region(), Some(1..6));
        assert_eq!(block.children, vec![Node::new("keyword.foo", 2..5)]);

        // never closed: runs to the end of the text
        let root = parse(&registry, "source.foo", "{ foo");
        let block = &root.children[0];
        assert_eq!(block.region, 0..5);
        assert_eq!(block.content_region(), Some(1..5));
        assert_eq!(block.children, vec![Node::new("keyword.foo", 2..5)]);
    }

    #[test]
    fn end_uses_begin_captures() {
        let registry = get_registry();
        let root = parse(&registry, "source.c", r#""a'b" 'c'"#);
        assert_eq!(names(&root.children), vec!["string.quoted.c", "string.quoted.c"]);
        assert_eq!(root.children[0].region, 0..5);
        assert_eq!(root.children[1].region, 6..9);
        assert_eq!(
            names(&root.children[0].children),
            vec![
                "punctuation.definition.string.begin.c",
                "punctuation.definition.string.end.c"
            ]
        );
    }

    #[test]
    fn earliest_declared_pattern_wins_ties() {
        let registry = registry_with(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    { "match": "ab", "name": "first" },
                    { "match": "abc", "name": "second" },
                    {
                        "begin": "<", "end": ">", "name": "tag",
                        "patterns": [{ "match": ">", "name": "gt" }]
                    }
                ]
            }"#,
        );
        let root = parse(&registry, "source.t", "abc");
        assert_eq!(root.children, vec![Node::new("first", 0..2)]);

        // the end of the block wins over its nested patterns
        let root = parse(&registry, "source.t", "<a>");
        assert_eq!(root.children, vec![Node::new("tag", 0..3)]);
    }

    #[test]
    fn captures_are_nested_and_bounded() {
        let registry = registry_with(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    {
                        "match": "((a)(b))c", "name": "m",
                        "captures": {
                            "1": { "name": "outer" }, "2": { "name": "a" },
                            "3": { "name": "b" }, "4": { "name": "missing" }
                        }
                    },
                    {
                        "match": "x(?=(y))", "name": "look",
                        "captures": { "1": { "name": "ahead" } }
                    }
                ]
            }"#,
        );
        let root = parse(&registry, "source.t", "abc xy");
        let mut outer = Node::new("outer", 0..2);
        outer.children = vec![Node::new("a", 0..1), Node::new("b", 1..2)];
        let mut m = Node::new("m", 0..3);
        m.children = vec![outer];
        // the lookahead group is outside the match
        assert_eq!(root.children, vec![m, Node::new("look", 4..5)]);
    }

    #[test]
    fn content_name_wraps_block_content() {
        let registry = registry_with(
            r#"{
                "scopeName": "source.t",
                "patterns": [{
                    "begin": "\"", "end": "\"", "name": "string", "contentName": "string.content",
                    "patterns": [{ "match": "\\\\.", "name": "escape" }]
                }]
            }"#,
        );
        let root = parse(&registry, "source.t", r#""a\"b""#);
        let string = &root.children[0];
        assert_eq!(string.region, 0..6);
        let mut content = Node::new("string.content", 1..5);
        content.children = vec![Node::new("escape", 2..4)];
        assert_eq!(string.children, vec![content]);
    }

    #[test]
    fn bad_patterns_are_ignored() {
        let registry = registry_with(
            r##"{
                "scopeName": "source.t",
                "patterns": [
                    { "match": "(unclosed", "name": "bad" },
                    { "include": "#nope" },
                    { "include": "source.nowhere" },
                    { "include": "source.nowhere#rule" },
                    { "match": "ok", "name": "good" },
                    { "begin": "<", "end": "(", "name": "tag" }
                ]
            }"##,
        );
        let root = parse(&registry, "source.t", "ok (unclosed");
        assert_eq!(root.children, vec![Node::new("good", 0..2)]);

        // an end regex that does not compile never closes its block
        let root = parse(&registry, "source.t", "<a> ok");
        assert_eq!(root.children, vec![Node::new("tag", 0..6)]);
    }

    #[test]
    fn self_and_base_includes() {
        let mut registry = registry_with(
            r#"{
                "scopeName": "source.inner",
                "patterns": [
                    {
                        "begin": "\\[", "end": "\\]", "name": "self.block",
                        "patterns": [{ "include": "$self" }]
                    },
                    {
                        "begin": "\\(", "end": "\\)", "name": "base.block",
                        "patterns": [{ "include": "$base" }]
                    },
                    { "match": "IN", "name": "inner.kw" }
                ]
            }"#,
        );
        let outer: crate::grammars::RawGrammar = serde_json::from_str(
            r#"{
                "scopeName": "source.outer",
                "patterns": [{ "include": "source.inner" }, { "match": "OUT", "name": "outer.kw" }]
            }"#,
        )
        .unwrap();
        registry.add_grammar(outer.compile());

        let root = parse(&registry, "source.outer", "[OUT IN] (OUT IN)");
        assert_eq!(names(&root.children), vec!["self.block", "base.block"]);
        assert_eq!(root.children[0].children, vec![Node::new("inner.kw", 5..7)]);
        assert_eq!(
            root.children[1].children,
            vec![Node::new("outer.kw", 10..13), Node::new("inner.kw", 14..16)]
        );

        // on its own, the inner grammar is its own base
        let root = parse(&registry, "source.inner", "(OUT IN)");
        assert_eq!(root.children[0].children, vec![Node::new("inner.kw", 5..7)]);
    }

    #[test]
    fn embeds_other_grammars() {
        let registry = get_registry();
        let root = parse(&registry, "text.template", "a {{ int x; }} @foo");
        assert_eq!(names(&root.children), vec!["meta.embedded.c", "variable.other.marker"]);
        let embedded = &root.children[0];
        assert_eq!(embedded.region, 2..14);
        assert_eq!(
            names(&embedded.children),
            vec![
                "punctuation.section.embedded.template",
                "source.c.embedded",
                "punctuation.section.embedded.template"
            ]
        );
        assert_eq!(embedded.children[1].region, 4..12);
        assert_eq!(
            embedded.children[1].children,
            vec![Node::new("keyword.control.c", 5..8)]
        );
        assert_eq!(root.children[1].region, 15..19);
    }

    #[test]
    fn can_dump_c_tree() {
        let registry = get_registry();
        let text = "int f() { return 1; } // done";
        let root = parse(&registry, "source.c", text);
        insta::assert_snapshot!(root.dump(text), @r#"
        0-29: "source.c"
          0-3: "keyword.control.c" - Data: "int"
          4-5: "meta.function-call.c"
            4-5: "entity.name.function.c" - Data: "f"
          5-7: "meta.parens.c" - Data: "()"
          8-21: "meta.block.c"
            8-9: "punctuation.section.block.begin.c" - Data: "{"
            10-16: "keyword.control.c" - Data: "return"
            17-18: "constant.numeric.c" - Data: "1"
            20-21: "punctuation.section.block.end.c" - Data: "}"
          22-29: "comment.line.double-slash.c" - Data: "// done"
        "#);
    }

    #[test]
    fn trees_are_well_formed_and_deterministic() {
        let registry = get_registry();
        let first = parse(&registry, "source.c", C_SAMPLE);
        let second = parse(&registry, "source.c", C_SAMPLE);
        assert_eq!(first, second);
        assert_well_formed(&first);

        let rebuilt: String = first
            .spans()
            .iter()
            .map(|span| &C_SAMPLE[span.range.clone()])
            .collect();
        assert_eq!(rebuilt, C_SAMPLE);
    }

    #[test]
    fn parse_region_sees_only_the_region() {
        let registry = get_registry();
        let text = "int a; /* x */ int b;";
        let mut ctx = registry.create_parsing_context("source.c", text);
        // the comment is cut in the middle: it runs to the end of the region
        let nodes = ctx.parse_region(4..10).unwrap();
        assert_eq!(names(&nodes), vec!["comment.block.c"]);
        assert_eq!(nodes[0].region, 7..10);
        assert!(ctx.root().is_none());
    }

    #[test]
    fn text_slice_is_clamped() {
        let registry = get_registry();
        let ctx = registry.create_parsing_context("source.c", "int é;");
        assert_eq!(ctx.text_slice(0, 3), "int");
        assert_eq!(ctx.text_slice(4, 100), "é;");
        // inside the two bytes of `é`
        assert_eq!(ctx.text_slice(0, 5), "int ");
        assert_eq!(ctx.text_slice(3, 1), "");
    }

    #[test]
    fn budget_stops_parsing() {
        let registry = get_registry();
        let text = "int x;\n".repeat(100);
        let mut ctx = registry
            .create_parsing_context("source.c", text.as_str())
            .with_options(ParseOptions::new().max_steps(10));
        let Err(Error::ParseIncomplete { parsed_up_to }) = ctx.parse() else {
            panic!("expected an incomplete parse");
        };
        assert!(parsed_up_to < text.len());
        assert!(ctx.root().is_some_and(|root| root.children.len() < 100));

        ctx.set_options(ParseOptions::new());
        assert_eq!(ctx.parse().unwrap().children.len(), 100);
    }

    #[test]
    fn cancel_flag_stops_parsing() {
        let registry = get_registry();
        let flag = Arc::new(AtomicBool::new(true));
        let mut ctx = registry
            .create_parsing_context("source.c", "int x;")
            .with_options(ParseOptions::new().cancel_flag(flag));
        assert!(matches!(
            ctx.parse(),
            Err(Error::ParseIncomplete { parsed_up_to: 0 })
        ));
    }

    #[test]
    fn repeated_searches_hit_the_cache() {
        let registry = get_registry();
        let text = "int a; int b; return 1;";
        let mut ctx = registry.create_parsing_context("source.c", text);
        let first = ctx.parse_region(0..text.len()).unwrap();
        let after_first = ctx.cache_stats();
        assert!(after_first.misses > 0);

        let second = ctx.parse_region(0..text.len()).unwrap();
        let after_second = ctx.cache_stats();
        assert_eq!(first, second);
        assert_eq!(after_second.misses, after_first.misses);
        assert!(after_second.hits > after_first.hits);

        ctx.clear_cache();
        ctx.parse_region(0..text.len()).unwrap();
        assert!(ctx.cache_stats().misses > after_second.misses);
    }

    #[test]
    fn parse_reuses_current_tree() {
        let registry = get_registry();
        let mut ctx = registry.create_parsing_context("source.c", "int a;");
        ctx.parse().unwrap();
        let stats = ctx.cache_stats();
        ctx.parse().unwrap();
        assert_eq!(ctx.cache_stats(), stats);

        ctx.set_text("int a; int b;");
        assert!(ctx.root().is_none());
        assert_eq!(ctx.parse().unwrap().children.len(), 2);
    }

    fn check_edit(ctx: &mut ParsingContext, range: Range<usize>, replacement: &str) {
        let updated = ctx.edit(range.clone(), replacement).unwrap().clone();
        let expected = parse(ctx.registry(), &ctx.grammar().scope_name, ctx.text());
        assert_eq!(
            updated,
            expected,
            "edit {range:?} -> {replacement:?} gave a different tree for {:?}",
            ctx.text()
        );
        assert_well_formed(&updated);
    }

    #[test]
    fn edits_give_the_same_tree_as_a_full_parse() {
        let registry = get_registry();
        let mut ctx = registry.create_parsing_context("source.c", C_SAMPLE);
        ctx.parse().unwrap();

        let pos = ctx.text().find("1;").unwrap();
        check_edit(&mut ctx, pos..pos, "2");
        let pos = ctx.text().find("note").unwrap();
        check_edit(&mut ctx, pos..pos, "x ");
        let pos = ctx.text().find("return \"").unwrap();
        check_edit(&mut ctx, pos..pos, "{");
        check_edit(&mut ctx, pos..pos + 1, "");
        let pos = ctx.text().find("if").unwrap();
        check_edit(&mut ctx, pos..pos, "/*");
        check_edit(&mut ctx, pos..pos + 2, "");
        let pos = ctx.text().find("\"a").unwrap();
        check_edit(&mut ctx, pos..pos + 1, "'");
        check_edit(&mut ctx, 0..0, "// hi\n");
        let end = ctx.text().len();
        check_edit(&mut ctx, end..end, "int y;");
        let end = ctx.text().len();
        check_edit(&mut ctx, 0..end, "");
        check_edit(&mut ctx, 0..0, C_SAMPLE);
    }

    #[test]
    fn single_char_edits_anywhere() {
        let registry = get_registry();
        for pos in 0..C_SAMPLE.len() {
            let mut ctx = registry.create_parsing_context("source.c", C_SAMPLE);
            ctx.parse().unwrap();
            check_edit(&mut ctx, pos..pos, "x");

            let mut ctx = registry.create_parsing_context("source.c", C_SAMPLE);
            ctx.parse().unwrap();
            check_edit(&mut ctx, pos..pos + 1, "");
        }
    }

    #[test]
    fn edit_after_incomplete_parse_parses_again() {
        let registry = get_registry();
        let mut ctx = registry
            .create_parsing_context("source.c", C_SAMPLE)
            .with_options(ParseOptions::new().max_steps(3));
        assert!(ctx.parse().is_err());
        ctx.set_options(ParseOptions::new());
        check_edit(&mut ctx, 0..0, " ");
    }

    #[test]
    fn matches_running_across_lines_into_an_edit() {
        let registry = registry_with(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    { "match": "a[\\s\\S]*z", "name": "az" },
                    { "match": "\\w", "name": "w" }
                ]
            }"#,
        );
        let mut ctx = registry.create_parsing_context("source.t", "a x\ny");
        ctx.parse().unwrap();
        check_edit(&mut ctx, 4..4, "z");
        assert_eq!(
            ctx.root().unwrap().children,
            vec![Node::new("az", 0..5), Node::new("w", 5..6)]
        );
    }

    #[test]
    fn earlier_matches_growing_into_an_edited_block() {
        let registry = registry_with(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    { "match": "a\\{x*z", "name": "az" },
                    { "match": "a" },
                    {
                        "begin": "\\{", "end": "\\}", "name": "blk",
                        "patterns": [{ "match": "\\w" }]
                    }
                ]
            }"#,
        );
        let mut ctx = registry.create_parsing_context("source.t", "a{x}");
        ctx.parse().unwrap();
        check_edit(&mut ctx, 3..3, "z");
        assert_eq!(ctx.root().unwrap().children, vec![Node::new("az", 0..4)]);

        // the match starts two siblings before the block
        let registry = registry_with(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    { "match": "a[^}]*z", "name": "az" },
                    { "match": "\\w", "name": "w" },
                    { "begin": "\\{", "end": "\\}", "name": "blk" }
                ]
            }"#,
        );
        let mut ctx = registry.create_parsing_context("source.t", "a b {x}");
        ctx.parse().unwrap();
        check_edit(&mut ctx, 6..6, "z");
        assert_eq!(ctx.root().unwrap().children, vec![Node::new("az", 0..7)]);
    }

    #[test]
    fn edits_inside_content_wrappers() {
        let registry = registry_with(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    {
                        "begin": "\"", "end": "\"", "name": "string",
                        "contentName": "string.content",
                        "patterns": [{ "match": "\\w+", "name": "w" }]
                    },
                    { "match": "\\w+", "name": "word" }
                ]
            }"#,
        );
        let text = r#""ab cd" e "f g" h"#;
        let mut ctx = registry.create_parsing_context("source.t", text);
        ctx.parse().unwrap();
        check_edit(&mut ctx, 2..2, "x");
        check_edit(&mut ctx, 5..5, " ");
        // removes the closing quote of the first string
        let pos = ctx.text().find("\" e").unwrap();
        check_edit(&mut ctx, pos..pos + 1, "");
        check_edit(&mut ctx, pos..pos, "\"");
        check_edit(&mut ctx, 0..1, "");
    }

    #[test]
    fn zero_width_matches_always_move_forward() {
        let registry = registry_with(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    { "match": "(?=x)", "name": "empty" },
                    {
                        "begin": "(?=y)", "end": "(?!y)", "name": "ys",
                        "patterns": [{ "include": "$self" }]
                    },
                    { "begin": "(?=q)", "end": "(?=q)", "name": "nothing" }
                ]
            }"#,
        );

        let root = parse(&registry, "source.t", "xxyyq x");
        assert_well_formed(&root);
        // the nested begin re-enters its rule once per `y`, never twice at the same place
        let mut outer = Node::new("ys", 2..4);
        outer.children = vec![Node::new("ys", 3..4)];
        assert_eq!(root.children, vec![outer]);

        for text in ["", "qqq", "yy", "q\ny x"] {
            let root = parse(&registry, "source.t", text);
            assert_well_formed(&root);
            assert!(root.children.iter().all(|c| !c.is_empty()));
        }
    }
}
