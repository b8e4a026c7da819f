use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::grammars::{GlobalRuleRef, GrammarId, MatchRegions, RegexId, search};

/// Identifies the exact text a parse runs on. Cached matches are only valid for the
/// same version.
pub(crate) fn text_version(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Counters of the match caches of a parsing context.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Pattern set searches answered from the cache
    pub hits: u64,
    /// Pattern set searches that had to look at their candidates
    pub misses: u64,
    /// Single regex searches answered from the cache
    pub regex_hits: u64,
    /// Single regex searches that ran oniguruma
    pub regex_misses: u64,
}

/// The winning candidate of a pattern set search
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SetMatch {
    /// The match or begin/end rule that matched
    pub rule_ref: GlobalRuleRef,
    pub regions: MatchRegions,
}

impl SetMatch {
    pub fn start(&self) -> usize {
        self.regions[0].map(|(s, _)| s).unwrap_or_default()
    }

    pub fn end(&self) -> usize {
        self.regions[0].map(|(_, e)| e).unwrap_or_default()
    }
}

#[derive(Debug)]
struct RegexEntry {
    version: u64,
    /// Position the search started from
    from: usize,
    result: Option<MatchRegions>,
}

/// Memoizes regex searches.
///
/// Two levels:
///  * pattern set searches, keyed by the exact set, text version and position
///  * single regex searches: a leftmost result found from `p0` is still the leftmost result
///    from any `p` in `p0..=start`, and no result from `p0` means no result from any later
///    position. Regexes using `\G` are only reused for the exact same position.
#[derive(Debug, Default)]
pub(crate) struct MatchCache {
    sets: HashMap<(GlobalRuleRef, u64, usize), Option<SetMatch>>,
    regexes: HashMap<(GrammarId, RegexId), RegexEntry>,
    stats: CacheStats,
}

impl MatchCache {
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.sets.clear();
        self.regexes.clear();
    }

    pub fn get_set(
        &mut self,
        set: GlobalRuleRef,
        version: u64,
        pos: usize,
    ) -> Option<Option<SetMatch>> {
        match self.sets.get(&(set, version, pos)) {
            Some(found) => {
                self.stats.hits += 1;
                Some(found.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert_set(
        &mut self,
        set: GlobalRuleRef,
        version: u64,
        pos: usize,
        found: Option<SetMatch>,
    ) {
        self.sets.insert((set, version, pos), found);
    }

    /// Leftmost match of a grammar regex in `text` from `from`, reusing a previous search when
    /// it gives the same answer.
    pub fn find_regex(
        &mut self,
        key: (GrammarId, RegexId),
        re: &onig::Regex,
        anchored: bool,
        text: &str,
        version: u64,
        from: usize,
    ) -> Option<MatchRegions> {
        if let Some(entry) = self.regexes.get(&key)
            && entry.version == version
            && (entry.from == from || (!anchored && entry.from < from))
        {
            let reusable = match &entry.result {
                None => true,
                Some(regions) => regions[0].is_some_and(|(start, _)| start >= from),
            };
            if reusable {
                self.stats.regex_hits += 1;
                return entry.result.clone();
            }
        }

        self.stats.regex_misses += 1;
        let result = search(re, text, from);
        self.regexes.insert(
            key,
            RegexEntry {
                version,
                from,
                result: result.clone(),
            },
        );
        result
    }
}
