use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::rc::Rc;
use std::sync::Arc;

use crate::grammars::{
    BASE_GRAMMAR_ID, BASE_ROOT_RULE_REF, BeginEnd, CaptureNames, GlobalRuleRef, Grammar,
    GrammarId, MatchRegions, ROOT_RULE_ID, Reference, Regex, Rule, search,
};
use crate::node::{BlockInfo, Node};
use crate::options::Budget;
use crate::parser::cache::{CacheStats, MatchCache, SetMatch, text_version};
use crate::parser::stack::{EndRegex, StackFrame, StateStack};
use crate::registry::Registry;

/// Byte offset of the character following `pos`, to force progress after zero-width matches
pub(crate) fn next_char(text: &str, pos: usize) -> usize {
    text[pos..]
        .chars()
        .next()
        .map_or(pos + 1, |c| pos + c.len_utf8())
}

/// Largest char boundary that is not after `pos`
pub(crate) fn floor_char_boundary(text: &str, pos: usize) -> usize {
    let mut pos = pos.min(text.len());
    while !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Builds the nodes of the named capture groups of a match.
///
/// Groups that are empty, fall outside the whole match or cross another group are ignored.
/// A group contained in another one becomes its child.
pub(crate) fn capture_nodes(names: &CaptureNames, regions: &MatchRegions) -> Vec<Node> {
    let Some(Some((match_start, match_end))) = regions.first().copied() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (index, name) in names {
        let Some(Some((start, end))) = regions.get(*index).copied() else {
            continue;
        };
        if start >= end || start < match_start || end > match_end {
            continue;
        }
        insert_nested(&mut out, Node::new(name.as_str(), start..end));
    }
    out
}

fn insert_nested(siblings: &mut Vec<Node>, node: Node) {
    if let Some(parent) = siblings
        .iter_mut()
        .find(|c| c.region.start <= node.region.start && node.region.end <= c.region.end)
    {
        insert_nested(&mut parent.children, node);
        return;
    }
    if siblings
        .iter()
        .any(|c| c.region.start < node.region.end && node.region.start < c.region.end)
    {
        #[cfg(feature = "debug")]
        log::trace!("[capture_nodes] Dropping crossing capture {:?}", node.region);
        return;
    }
    let idx = siblings.partition_point(|c| c.region.start < node.region.start);
    siblings.insert(idx, node);
}

/// Where a scan is at: the text it runs on, its position and the open blocks
pub(crate) struct Scanner<'t> {
    /// The text up to the end of the parsed region
    pub text: &'t str,
    pub version: u64,
    pub pos: usize,
    pub stack: StateStack,
}

impl<'t> Scanner<'t> {
    pub fn new(text: &'t str, version: u64, pos: usize, root: StackFrame) -> Self {
        Self {
            text,
            version,
            pos,
            stack: StateStack::new(root),
        }
    }
}

/// Result of a scan that may have run out of budget
#[derive(Debug)]
pub(crate) struct ScanOutcome {
    pub root: Node,
    pub complete: bool,
    /// Where scanning stopped
    pub parsed_up_to: usize,
}

/// The matching machinery of a parsing context.
///
/// Owns everything derived from the grammars for one document: the other grammars pulled
/// in by includes, resolved includes, flattened pattern sets and the match caches.
pub(crate) struct Engine<'r> {
    registry: &'r Registry,
    /// Index 0 is the base grammar, other grammars are added when an include needs them
    grammars: Vec<Arc<Grammar>>,
    grammar_ids: HashMap<String, GrammarId>,
    /// Scopes that are not in the registry, only warned about once
    missing_scopes: HashSet<String>,
    /// Include rule -> the rule it points to, `None` if it does not resolve
    includes: HashMap<GlobalRuleRef, Option<GlobalRuleRef>>,
    /// Rule with nested patterns -> the match and begin/end rules to try, in order
    pattern_cache: HashMap<GlobalRuleRef, Rc<[GlobalRuleRef]>>,
    cache: MatchCache,
}

impl<'r> Engine<'r> {
    pub fn new(registry: &'r Registry, base: Arc<Grammar>) -> Self {
        let mut grammar_ids = HashMap::new();
        grammar_ids.insert(base.scope_name.clone(), BASE_GRAMMAR_ID);
        Self {
            registry,
            grammars: vec![base],
            grammar_ids,
            missing_scopes: HashSet::new(),
            includes: HashMap::new(),
            pattern_cache: HashMap::new(),
            cache: MatchCache::default(),
        }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn base_grammar(&self) -> &Arc<Grammar> {
        &self.grammars[BASE_GRAMMAR_ID.as_index()]
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drops everything derived from the grammars, only the base grammar is kept
    pub fn clear(&mut self) {
        self.grammars.truncate(1);
        self.grammar_ids.retain(|_, id| *id == BASE_GRAMMAR_ID);
        self.missing_scopes.clear();
        self.includes.clear();
        self.pattern_cache.clear();
        self.cache.clear();
    }

    /// Drops the cached matches only, they are keyed by a text version that no longer exists
    pub fn clear_matches(&mut self) {
        self.cache.clear();
    }

    fn grammar_id_for_scope(&mut self, scope: &str) -> Option<GrammarId> {
        if let Some(id) = self.grammar_ids.get(scope) {
            return Some(*id);
        }
        if self.missing_scopes.contains(scope) {
            return None;
        }
        match self.registry.grammar_for_scope(scope) {
            Some(grammar) => {
                let id = GrammarId(self.grammars.len() as u16);
                self.grammars.push(grammar);
                self.grammar_ids.insert(scope.to_owned(), id);
                Some(id)
            }
            None => {
                log::warn!("Grammar {scope:?} is not in the registry, its includes are ignored");
                self.missing_scopes.insert(scope.to_owned());
                None
            }
        }
    }

    /// Resolves the target of an include rule, the first time it is needed
    fn resolve_include(&mut self, include_ref: GlobalRuleRef) -> Option<GlobalRuleRef> {
        if let Some(target) = self.includes.get(&include_ref) {
            return *target;
        }
        let grammar = self.grammars[include_ref.grammar.as_index()].clone();
        let Rule::Include(reference) = &grammar[include_ref.rule] else {
            return None;
        };

        let target = match reference {
            Reference::Self_ => Some(GlobalRuleRef {
                grammar: include_ref.grammar,
                rule: ROOT_RULE_ID,
            }),
            Reference::Base => Some(BASE_ROOT_RULE_REF),
            Reference::Local(name) => grammar.repository_rule(name).map(|rule| GlobalRuleRef {
                grammar: include_ref.grammar,
                rule,
            }),
            Reference::OtherComplete(scope) => {
                self.grammar_id_for_scope(scope).map(|grammar| GlobalRuleRef {
                    grammar,
                    rule: ROOT_RULE_ID,
                })
            }
            Reference::OtherSpecific(scope, name) => {
                self.grammar_id_for_scope(scope).and_then(|id| {
                    self.grammars[id.as_index()]
                        .repository_rule(name)
                        .map(|rule| GlobalRuleRef { grammar: id, rule })
                })
            }
        };

        if target.is_none() {
            log::warn!(
                "Unresolved include {reference:?} in grammar {}, it contributes no patterns",
                grammar.scope_name
            );
        }
        self.includes.insert(include_ref, target);
        target
    }

    /// The match and begin/end rules to try while `set` is the innermost open rule,
    /// in declaration order with includes expanded in place.
    pub fn candidates(&mut self, set: GlobalRuleRef) -> Rc<[GlobalRuleRef]> {
        if let Some(found) = self.pattern_cache.get(&set) {
            return found.clone();
        }

        let grammar = self.grammars[set.grammar.as_index()].clone();
        let patterns: &[_] = match &grammar[set.rule] {
            Rule::Group(patterns) => patterns,
            Rule::BeginEnd(b) => &b.patterns,
            Rule::Match(_) | Rule::Include(_) => &[],
        };

        let mut out = Vec::new();
        let mut visited = HashSet::new();
        for rule in patterns {
            self.collect_candidates(
                GlobalRuleRef {
                    grammar: set.grammar,
                    rule: *rule,
                },
                &mut visited,
                &mut out,
            );
        }

        #[cfg(feature = "debug")]
        log::debug!("[candidates] {} candidates for {set:?}", out.len());

        let out: Rc<[GlobalRuleRef]> = out.into();
        self.pattern_cache.insert(set, out.clone());
        out
    }

    fn collect_candidates(
        &mut self,
        rule_ref: GlobalRuleRef,
        visited: &mut HashSet<GlobalRuleRef>,
        out: &mut Vec<GlobalRuleRef>,
    ) {
        // Include cycles end here, and a rule reachable twice only matters the first time
        if !visited.insert(rule_ref) {
            return;
        }
        let grammar = self.grammars[rule_ref.grammar.as_index()].clone();
        match &grammar[rule_ref.rule] {
            Rule::Match(_) | Rule::BeginEnd(_) => out.push(rule_ref),
            Rule::Group(patterns) => {
                for rule in patterns {
                    self.collect_candidates(
                        GlobalRuleRef {
                            grammar: rule_ref.grammar,
                            rule: *rule,
                        },
                        visited,
                        out,
                    );
                }
            }
            Rule::Include(_) => {
                if let Some(target) = self.resolve_include(rule_ref) {
                    self.collect_candidates(target, visited, out);
                }
            }
        }
    }

    /// Finds the candidate of `set` matching leftmost from `pos`, the earliest declared one
    /// winning ties.
    pub fn search_in_patterns(
        &mut self,
        text: &str,
        version: u64,
        pos: usize,
        set: GlobalRuleRef,
    ) -> Option<SetMatch> {
        if let Some(found) = self.cache.get_set(set, version, pos) {
            return found;
        }

        let candidates = self.candidates(set);
        let mut best: Option<SetMatch> = None;
        for candidate in candidates.iter() {
            let grammar = &self.grammars[candidate.grammar.as_index()];
            let regex_id = match &grammar[candidate.rule] {
                Rule::Match(m) => m.regex,
                Rule::BeginEnd(b) => b.begin,
                Rule::Include(_) | Rule::Group(_) => continue,
            };
            let regex = &grammar[regex_id];
            let Some(compiled) = regex.compiled() else {
                continue;
            };
            let Some(regions) = self.cache.find_regex(
                (candidate.grammar, regex_id),
                compiled,
                regex.is_anchored(),
                text,
                version,
                pos,
            ) else {
                continue;
            };
            let Some((start, _)) = regions[0] else {
                continue;
            };

            if best.as_ref().is_none_or(|b| start < b.start()) {
                best = Some(SetMatch {
                    rule_ref: *candidate,
                    regions,
                });
                // nothing can match before the current position
                if start == pos {
                    break;
                }
            }
        }

        self.cache.insert_set(set, version, pos, best.clone());
        best
    }

    /// Scans `text[..range.end]` from `range.start` with the base grammar root patterns.
    /// Nothing after the end of the range is visible to the regexes.
    pub fn parse_range(
        &mut self,
        text: &str,
        range: Range<usize>,
        budget: &mut Budget,
    ) -> ScanOutcome {
        let text = &text[..range.end];
        let version = text_version(text);
        let root_name = self.base_grammar().scope_name.clone();
        let root = StackFrame::root(BASE_ROOT_RULE_REF, Node::new(root_name, range.clone()));
        let mut scanner = Scanner::new(text, version, range.start, root);

        let mut complete = true;
        loop {
            if !budget.step() {
                complete = false;
                break;
            }
            if !self.step(&mut scanner) {
                break;
            }
        }

        let parsed_up_to = if complete { range.end } else { scanner.pos };
        let mut root = self.finish(scanner, parsed_up_to);
        root.region = range;
        ScanOutcome {
            root,
            complete,
            parsed_up_to,
        }
    }

    /// One scan step: closes the innermost block, opens a new one or adds a match node.
    /// Returns false once nothing matches anymore.
    pub fn step(&mut self, scanner: &mut Scanner) -> bool {
        let pos = scanner.pos;
        if pos >= scanner.text.len() {
            return false;
        }

        #[cfg(feature = "debug")]
        log::trace!("[step] Scanning {pos}: {:?}", scanner.stack);

        let end_found = self.find_end(scanner);
        let patterns = scanner.stack.top().patterns;
        let best = self.search_in_patterns(scanner.text, scanner.version, pos, patterns);

        match (end_found, best) {
            // the end wins ties with nested patterns
            (Some(end), best)
                if best
                    .as_ref()
                    .is_none_or(|b| end[0].is_some_and(|(s, _)| s <= b.start())) =>
            {
                self.close_block(scanner, &end);
            }
            (_, Some(best)) => self.handle_match(scanner, best),
            (_, None) => return false,
        }
        true
    }

    fn find_end(&mut self, scanner: &Scanner) -> Option<MatchRegions> {
        let top = scanner.stack.top();
        let found = match &top.end {
            EndRegex::None | EndRegex::Never => None,
            EndRegex::Fixed(regex_id) => {
                let rule_ref = top.rule_ref?;
                let grammar = &self.grammars[rule_ref.grammar.as_index()];
                let regex = &grammar[*regex_id];
                self.cache.find_regex(
                    (rule_ref.grammar, *regex_id),
                    regex.compiled()?,
                    regex.is_anchored(),
                    scanner.text,
                    scanner.version,
                    scanner.pos,
                )
            }
            EndRegex::Resolved { regex, .. } => search(regex, scanner.text, scanner.pos),
        };
        found.filter(|regions| regions[0].is_some())
    }

    fn handle_match(&mut self, scanner: &mut Scanner, best: SetMatch) {
        let grammar = self.grammars[best.rule_ref.grammar.as_index()].clone();
        match &grammar[best.rule_ref.rule] {
            Rule::Match(m) => {
                let (start, end) = (best.start(), best.end());
                if end > start {
                    let mut node = Node::new(m.name.as_deref().unwrap_or_default(), start..end);
                    node.children = capture_nodes(&m.captures, &best.regions);
                    scanner.stack.top_mut().push_child(node);
                }
                scanner.pos = if end > scanner.pos {
                    end
                } else {
                    next_char(scanner.text, scanner.pos)
                };
            }
            Rule::BeginEnd(b) => {
                let pos = scanner.pos;
                if best.end() <= pos && scanner.stack.is_reentry(best.rule_ref, pos) {
                    #[cfg(feature = "debug")]
                    log::debug!(
                        "[handle_match] Zero-width begin re-entering {:?}, skipping a char",
                        best.rule_ref
                    );
                    scanner.pos = next_char(scanner.text, scanner.pos);
                    return;
                }
                self.open_block(scanner, best.rule_ref, b, &best.regions);
            }
            Rule::Include(_) | Rule::Group(_) => {
                unreachable!("candidates only hold rules with a regex")
            }
        }
    }

    fn open_block(
        &mut self,
        scanner: &mut Scanner,
        rule_ref: GlobalRuleRef,
        rule: &BeginEnd,
        regions: &MatchRegions,
    ) {
        let Some((start, end)) = regions[0] else {
            return;
        };
        let grammar = &self.grammars[rule_ref.grammar.as_index()];

        let mut end_outside_begin = false;
        let end_regex = match &grammar[rule.end] {
            Regex::Fixed(_) if grammar[rule.end].is_valid() => EndRegex::Fixed(rule.end),
            Regex::Fixed(_) => EndRegex::Never,
            re @ Regex::BackReference(_) => {
                // lookarounds can capture text on either side of the begin match
                end_outside_begin = regions.iter().flatten().any(|&(s, e)| s < start || e > end);
                let captured: Vec<_> = regions
                    .iter()
                    .map(|r| r.map(|(s, e)| scanner.text[s..e].to_owned()))
                    .collect();
                match re.resolve(&captured) {
                    Some((pattern, regex)) => EndRegex::Resolved {
                        pattern,
                        regex: Box::new(regex),
                    },
                    None => EndRegex::Never,
                }
            }
        };

        let mut node = Node::new(rule.name.as_deref().unwrap_or_default(), start..end);
        node.block = Some(BlockInfo {
            rule: rule_ref,
            begin_len: end - start,
            end_len: 0,
            end_outside_begin,
        });
        node.children = capture_nodes(&rule.begin_captures, regions);

        #[cfg(feature = "debug")]
        log::debug!("[open_block] {:?} at {start}-{end}, end={end_regex:?}", node.name);

        scanner.stack.push(StackFrame {
            rule_ref: Some(rule_ref),
            patterns: rule_ref,
            end: end_regex,
            node,
            content: rule
                .content_name
                .as_deref()
                .map(|name| Node::new(name, end..end)),
            enter_position: end,
        });
        scanner.pos = end;
    }

    fn close_block(&mut self, scanner: &mut Scanner, regions: &MatchRegions) {
        let Some((start, end)) = regions[0] else {
            return;
        };
        let pos = scanner.pos;
        let Some(mut frame) = scanner.stack.pop() else {
            return;
        };
        let end_captures = frame.rule_ref.and_then(|r| {
            match &self.grammars[r.grammar.as_index()][r.rule] {
                Rule::BeginEnd(b) => Some(capture_nodes(&b.end_captures, regions)),
                _ => None,
            }
        });

        if let Some(mut content) = frame.content.take() {
            content.region.end = start.max(content.region.start);
            if !content.is_empty() {
                frame.node.children.push(content);
            }
        }
        frame.node.children.extend(end_captures.unwrap_or_default());
        frame.node.region.end = end;
        if let Some(block) = &mut frame.node.block {
            block.end_len = end - start;
        }

        #[cfg(feature = "debug")]
        log::debug!("[close_block] {:?} at {}-{end}", frame.node.name, frame.node.region.start);

        let is_empty = frame.node.is_empty();
        if !is_empty {
            scanner.stack.top_mut().push_child(frame.node);
        }
        scanner.pos = if end > pos || !is_empty {
            end
        } else {
            // a zero-width block at the current position would be entered again
            next_char(scanner.text, pos)
        };
    }

    /// Closes every block still open at `end` and returns the root node
    pub fn finish(&mut self, mut scanner: Scanner, end: usize) -> Node {
        while let Some(mut frame) = scanner.stack.pop() {
            #[cfg(feature = "debug")]
            log::debug!("[finish] Unterminated block {:?} closed at {end}", frame.node.name);

            if let Some(mut content) = frame.content.take() {
                content.region.end = end.max(content.region.start);
                if !content.is_empty() {
                    frame.node.children.push(content);
                }
            }
            frame.node.region.end = end.max(frame.node.region.start);
            if !frame.node.is_empty() {
                scanner.stack.top_mut().push_child(frame.node);
            }
        }
        let mut root = scanner
            .stack
            .frames
            .pop()
            .map(|f| f.node)
            .unwrap_or_else(|| Node::new("", end..end));
        root.region.end = end.max(root.region.start);
        root
    }
}
