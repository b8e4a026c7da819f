use std::borrow::Cow;
use std::fmt;

use onig::{Region, SearchOptions};
use serde::{Deserialize, Serialize};

/// Byte offsets of every capture group of a match, group 0 being the whole match.
/// Groups that did not participate in the match are `None`.
pub type MatchRegions = Vec<Option<(usize, usize)>>;

/// Text captured by a begin match, indexed by group, used to fill back-references
/// of the paired end regex.
pub type CapturedText = Vec<Option<String>>;

/// Runs a leftmost search of `re` on the full `text`, starting at `from`.
///
/// The whole text is given to oniguruma, not a slice, so lookbehinds and `\b` see the
/// characters before `from`.
pub(crate) fn search(re: &onig::Regex, text: &str, from: usize) -> Option<MatchRegions> {
    if from > text.len() {
        return None;
    }
    let mut region = Region::new();
    re.search_with_options(
        text,
        from,
        text.len(),
        SearchOptions::SEARCH_OPTION_NONE,
        Some(&mut region),
    )?;
    Some((0..region.len()).map(|i| region.pos(i)).collect())
}

/// Whether the pattern refers to a capture group of another regex, eg `\1`.
///
/// Escaped backslashes and character classes are skipped: `\\1` is a backslash followed by
/// `1` and `[\1]` is an octal escape in a class.
pub fn has_backreferences(pattern: &str) -> bool {
    scan_backreferences(pattern, |_| Some(String::new())).is_some_and(|(_, found)| found)
}

/// Walks the pattern, calling `replace` for every back-reference outside a character class.
/// Returns the rewritten pattern and whether any back-reference was seen, or `None` if
/// `replace` gave up.
fn scan_backreferences(
    pattern: &str,
    mut replace: impl FnMut(usize) -> Option<String>,
) -> Option<(String, bool)> {
    let mut out = String::with_capacity(pattern.len());
    let mut found = false;
    let mut class_depth = 0usize;
    // Set right after an opening `[` (or `[^`), where a `]` is a literal
    let mut class_start = false;
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let Some(next) = chars.next() else {
                    out.push(c);
                    break;
                };
                if class_depth == 0 && matches!(next, '1'..='9') {
                    found = true;
                    let index = next as usize - '0' as usize;
                    out.push_str(&replace(index)?);
                } else {
                    out.push(c);
                    out.push(next);
                }
                class_start = false;
                continue;
            }
            '[' => {
                class_depth += 1;
                out.push(c);
                if chars.peek() == Some(&'^') {
                    out.push('^');
                    chars.next();
                }
                class_start = true;
                continue;
            }
            ']' if class_depth > 0 && !class_start => class_depth -= 1,
            _ => {}
        }
        class_start = false;
        out.push(c);
    }

    Some((out, found))
}

/// Escapes regex metacharacters so the captured text is matched literally.
fn escape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '^' | '$' | '.' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']' | '{' | '}'
                | '-' | ',' | '#'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Replaces the back-references of `pattern` with the escaped text of the begin captures.
///
/// Returns `None` when a referenced group did not capture anything: such an end regex can
/// never match.
pub fn resolve_backreferences(pattern: &str, captured: &[Option<String>]) -> Option<String> {
    scan_backreferences(pattern, |index| {
        captured
            .get(index)
            .and_then(|c| c.as_deref())
            .map(escape_literal)
    })
    .map(|(out, _)| out)
}

/// A regex compiled once and reused for every match.
pub struct FixedRegex {
    pattern: String,
    /// `None` if the pattern failed to compile: the regex never matches
    compiled: Option<onig::Regex>,
    /// `\G` matches at the search start so results depend on where the search started
    anchored: bool,
}

impl FixedRegex {
    fn new(pattern: String) -> Self {
        let compiled = match onig::Regex::new(&pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!("Invalid regex {pattern:?}, it will never match: {e}");
                None
            }
        };
        let anchored = pattern.contains("\\G");
        Self {
            pattern,
            compiled,
            anchored,
        }
    }
}

/// A regex from a grammar.
///
/// Which variant is used is decided once, when the grammar is compiled, by looking for
/// back-references in the pattern.
pub enum Regex {
    /// No back-references: compiled when the grammar is compiled
    Fixed(FixedRegex),
    /// Refers to captures of the paired begin match: compiled for each begin/end pairing
    /// once the captured text is known
    BackReference(String),
}

impl fmt::Debug for Regex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.pattern())
    }
}

impl PartialEq for Regex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern() == other.pattern()
    }
}

impl Regex {
    /// A regex that may refer to the captures of another one, like the `end` of a
    /// begin/end pattern.
    pub fn new(pattern: String) -> Self {
        if has_backreferences(&pattern) {
            Self::BackReference(pattern)
        } else {
            Self::Fixed(FixedRegex::new(pattern))
        }
    }

    /// A regex where `\1` can only refer to its own groups, like `match` and `begin`.
    pub fn fixed(pattern: String) -> Self {
        Self::Fixed(FixedRegex::new(pattern))
    }

    pub fn pattern(&self) -> &str {
        match self {
            Regex::Fixed(f) => &f.pattern,
            Regex::BackReference(p) => p,
        }
    }

    pub fn has_backreferences(&self) -> bool {
        matches!(self, Regex::BackReference(_))
    }

    /// Whether the pattern uses `\G`, in which case a match found from one position
    /// cannot be reused for another
    pub fn is_anchored(&self) -> bool {
        match self {
            Regex::Fixed(f) => f.anchored,
            Regex::BackReference(p) => p.contains("\\G"),
        }
    }

    /// False if the pattern did not compile. Back-reference regexes can only be checked once
    /// resolved so they are always considered valid here.
    pub fn is_valid(&self) -> bool {
        match self {
            Regex::Fixed(f) => f.compiled.is_some(),
            Regex::BackReference(_) => true,
        }
    }

    /// The compiled regex, only available for fixed regexes
    pub(crate) fn compiled(&self) -> Option<&onig::Regex> {
        match self {
            Regex::Fixed(f) => f.compiled.as_ref(),
            Regex::BackReference(_) => None,
        }
    }

    /// Compiles a back-reference regex with the text captured by its begin match, returning
    /// the resolved pattern along with it.
    /// Returns `None` if a referenced group is missing or if the result does not compile.
    pub fn resolve(&self, captured: &[Option<String>]) -> Option<(String, onig::Regex)> {
        let Regex::BackReference(pattern) = self else {
            return None;
        };
        let resolved = resolve_backreferences(pattern, captured)?;
        match onig::Regex::new(&resolved) {
            Ok(re) => Some((resolved, re)),
            Err(e) => {
                log::warn!("Back-reference regex {resolved:?} did not compile: {e}");
                None
            }
        }
    }

    /// Finds the leftmost match starting at or after `from`.
    ///
    /// `captured` is only used by back-reference regexes.
    pub fn find(
        &self,
        text: &str,
        from: usize,
        captured: &[Option<String>],
    ) -> Option<MatchRegions> {
        match self {
            Regex::Fixed(f) => search(f.compiled.as_ref()?, text, from),
            Regex::BackReference(_) => search(&self.resolve(captured)?.1, text, from),
        }
    }
}

/// Only the pattern and its variant are serialized, fixed regexes are compiled again on load
#[derive(Serialize, Deserialize)]
enum RegexRepr<'a> {
    Fixed(Cow<'a, str>),
    BackReference(Cow<'a, str>),
}

impl Serialize for Regex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let repr = match self {
            Regex::Fixed(f) => RegexRepr::Fixed(Cow::Borrowed(&f.pattern)),
            Regex::BackReference(p) => RegexRepr::BackReference(Cow::Borrowed(p)),
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Regex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match RegexRepr::deserialize(deserializer)? {
            RegexRepr::Fixed(p) => Regex::fixed(p.into_owned()),
            RegexRepr::BackReference(p) => Regex::BackReference(p.into_owned()),
        })
    }
}
