mod compiled;
mod raw;
mod regex;

pub use compiled::*;
pub use raw::{GrammarFormat, GrammarHeader, RawGrammar};
pub use regex::{CapturedText, MatchRegions, Regex, has_backreferences, resolve_backreferences};
pub(crate) use regex::search;

/// Index of a grammar inside a parsing context. The base grammar is always 0.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct GrammarId(pub u16);

impl GrammarId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// A rule of a given grammar of a parsing context
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GlobalRuleRef {
    pub grammar: GrammarId,
    pub rule: RuleId,
}

pub const BASE_GRAMMAR_ID: GrammarId = GrammarId(0);

pub const BASE_ROOT_RULE_REF: GlobalRuleRef = GlobalRuleRef {
    grammar: BASE_GRAMMAR_ID,
    rule: ROOT_RULE_ID,
};
