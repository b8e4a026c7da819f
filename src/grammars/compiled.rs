use std::collections::HashMap;
use std::ops::{Deref, Index};

use serde::{Deserialize, Serialize};

use crate::grammars::raw::{Captures, RawGrammar, RawRule};
use crate::grammars::regex::Regex;

/// Scope name of the fallback grammar
pub const PLAIN_TEXT_SCOPE: &str = "text.plain";

/// The root rule of every grammar, a group holding the top-level patterns
pub const ROOT_RULE_ID: RuleId = RuleId(0);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u32);

impl RuleId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl Deref for RuleId {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegexId(pub u32);

impl RegexId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Scope names of capture groups, sorted by group index.
/// Groups without a name are not stored.
pub type CaptureNames = Vec<(usize, String)>;

/// Allowed include values:
///  * Scope Name, e.g. `source.c`
///  * Top level scope reference, e.g. `source.c#block`
///  * Relative scope reference, e.g. `#block`
///  * self, e.g. `$self`
///  * base, e.g. `$base`
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Reference {
    Self_,
    Base,
    Local(String),
    OtherComplete(String),
    OtherSpecific(String, String),
}

impl From<&str> for Reference {
    fn from(value: &str) -> Self {
        match value.trim() {
            "$self" => Self::Self_,
            "$base" => Self::Base,
            s if s.starts_with('#') => Self::Local(s[1..].to_string()),
            s => match s.split_once('#') {
                Some((scope, rule)) => Self::OtherSpecific(scope.to_string(), rule.to_string()),
                None => Self::OtherComplete(s.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub name: Option<String>,
    pub regex: RegexId,
    pub captures: CaptureNames,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeginEnd {
    pub name: Option<String>,
    pub content_name: Option<String>,
    pub begin: RegexId,
    pub begin_captures: CaptureNames,
    pub end: RegexId,
    pub end_captures: CaptureNames,
    pub patterns: Vec<RuleId>,
}

/// A pattern of a grammar. Each variant is exclusive: a file pattern having both `include`
/// and `match` is an include, like in vscode-textmate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rule {
    Match(Match),
    BeginEnd(BeginEnd),
    /// Resolved by the parsing context the first time it is needed
    Include(Reference),
    /// Only nested patterns, eg `{ "patterns": [...] }` in a repository.
    /// Never matches by itself, its patterns are spliced in place.
    Group(Vec<RuleId>),
}

impl Rule {
    pub fn name(&self) -> Option<&str> {
        match self {
            Rule::Match(m) => m.name.as_deref(),
            Rule::BeginEnd(b) => b.name.as_deref(),
            Rule::Include(_) | Rule::Group(_) => None,
        }
    }
}

/// The immutable, shareable model of one grammar.
///
/// Nothing in here changes once compiled: per-document state (resolved includes, match
/// caches) lives in the parsing context.
#[derive(Debug, Serialize, Deserialize)]
pub struct Grammar {
    pub name: Option<String>,
    pub scope_name: String,
    pub file_types: Vec<String>,
    pub first_line_match: Option<Regex>,
    pub hide_from_user: bool,
    pub regexes: Vec<Regex>,
    pub rules: Vec<Rule>,
    pub repository: HashMap<String, RuleId>,
}

impl Index<RuleId> for Grammar {
    type Output = Rule;

    fn index(&self, index: RuleId) -> &Self::Output {
        &self.rules[index.as_index()]
    }
}

impl Index<RegexId> for Grammar {
    type Output = Regex;

    fn index(&self, index: RegexId) -> &Self::Output {
        &self.regexes[index.as_index()]
    }
}

impl Grammar {
    pub fn from_raw_grammar(raw: RawGrammar) -> Self {
        let mut grammar = Self {
            name: raw.name,
            scope_name: raw.scope_name.trim().to_string(),
            file_types: raw
                .file_types
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            first_line_match: raw.first_line_match.map(Regex::fixed),
            hide_from_user: raw.hide_from_user,
            regexes: Vec::new(),
            rules: Vec::new(),
            repository: HashMap::new(),
        };

        let root_rule = RawRule {
            patterns: raw.patterns,
            ..Default::default()
        };
        let root_rule_id = grammar.compile_rule(root_rule);
        debug_assert_eq!(root_rule_id, ROOT_RULE_ID);

        // Sorted so rule ids are stable from one load to the next
        let mut entries: Vec<_> = raw.repository.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, entry) in entries {
            let id = grammar.compile_rule(entry.into());
            grammar.repository.insert(name, id);
        }

        grammar
    }

    /// A grammar without any pattern: the whole text is a single anonymous region.
    pub fn plain_text() -> Self {
        Self::from_raw_grammar(RawGrammar {
            name: Some("Plain Text".to_owned()),
            scope_name: PLAIN_TEXT_SCOPE.to_owned(),
            file_types: vec!["txt".to_owned()],
            ..Default::default()
        })
    }

    /// The name shown to users, falling back to the scope name
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.scope_name)
    }

    pub fn root_patterns(&self) -> &[RuleId] {
        match &self[ROOT_RULE_ID] {
            Rule::Group(patterns) => patterns,
            _ => &[],
        }
    }

    pub fn repository_rule(&self, name: &str) -> Option<RuleId> {
        self.repository.get(name).copied()
    }

    /// Whether `line` matches the grammar's `firstLineMatch`
    pub fn matches_first_line(&self, line: &str) -> bool {
        self.first_line_match
            .as_ref()
            .is_some_and(|re| re.find(line, 0, &[]).is_some())
    }

    fn compile_rule(&mut self, raw_rule: RawRule) -> RuleId {
        let id = RuleId(self.rules.len() as u32);

        // push a placeholder to reserve its spot
        self.rules.push(Rule::Group(Vec::new()));

        let rule = if let Some(include) = raw_rule.include {
            // vscode ignores other rule contents if there's an include
            Rule::Include(include.as_str().into())
        } else if let Some(pat) = raw_rule.match_ {
            Rule::Match(Match {
                name: raw_rule.name,
                regex: self.compile_regex(pat, false),
                captures: capture_names(raw_rule.captures),
            })
        } else if let Some(begin_pat) = raw_rule.begin {
            if let Some(end_pat) = raw_rule.end {
                let begin_captures = if raw_rule.begin_captures.is_empty() {
                    raw_rule.captures.clone()
                } else {
                    raw_rule.begin_captures
                };
                let end_captures = if raw_rule.end_captures.is_empty() {
                    raw_rule.captures
                } else {
                    raw_rule.end_captures
                };
                let begin = self.compile_regex(begin_pat, false);
                let end = self.compile_regex(end_pat, true);
                let patterns = self.compile_patterns(raw_rule.patterns);
                Rule::BeginEnd(BeginEnd {
                    name: raw_rule.name,
                    content_name: raw_rule.content_name,
                    begin,
                    begin_captures: capture_names(begin_captures),
                    end,
                    end_captures: capture_names(end_captures),
                    patterns,
                })
            } else {
                // a rule that has begin without end is just a match, probably a typo
                let captures = if raw_rule.begin_captures.is_empty() {
                    raw_rule.captures
                } else {
                    raw_rule.begin_captures
                };
                Rule::Match(Match {
                    name: raw_rule.name,
                    regex: self.compile_regex(begin_pat, false),
                    captures: capture_names(captures),
                })
            }
        } else {
            Rule::Group(self.compile_patterns(raw_rule.patterns))
        };

        self.rules[id.as_index()] = rule;
        id
    }

    /// Only `end` regexes can refer to the captures of another regex
    fn compile_regex(&mut self, pattern: String, is_end: bool) -> RegexId {
        let regex_id = RegexId(self.regexes.len() as u32);
        let regex = if is_end {
            Regex::new(pattern)
        } else {
            Regex::fixed(pattern)
        };
        self.regexes.push(regex);
        regex_id
    }

    fn compile_patterns(&mut self, rules: Vec<RawRule>) -> Vec<RuleId> {
        rules.into_iter().map(|r| self.compile_rule(r)).collect()
    }
}

fn capture_names(captures: Captures) -> CaptureNames {
    captures
        .0
        .into_iter()
        .filter_map(|(index, capture)| capture.name.map(|name| (index, name)))
        .collect()
}
