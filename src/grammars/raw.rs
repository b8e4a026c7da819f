use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, ScopeTreeResult};
use crate::grammars::compiled::Grammar;

/// A capture group that assigns a scope name to matched text
///
/// # Examples
/// ```json
/// {
///   "1": { "name": "entity.name.function.js" },
///   "2": { "name": "punctuation.definition.parameters.begin.js" }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCapture {
    /// The scope name to assign to the captured text.
    /// Entries without a name do not produce nodes.
    #[serde(default)]
    pub name: Option<String>,
}

/// Captures keyed by group index. Group 0 is the whole match.
///
/// Grammar files use string keys (`"1"`), keys that are not integers are ignored.
#[derive(Debug, Clone, Default)]
pub struct Captures(pub BTreeMap<usize, RawCapture>);

impl Captures {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Captures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = HashMap::<String, RawCapture>::deserialize(deserializer)?;
        let mut out = BTreeMap::new();
        for (key, capture) in raw {
            match key.trim().parse::<usize>() {
                Ok(index) => {
                    out.insert(index, capture);
                }
                Err(_) => log::warn!("Ignoring capture with non-numeric key {key:?}"),
            }
        }
        Ok(Captures(out))
    }
}

/// One pattern definition as written in a grammar file.
///
/// The file format does not tag the kind of pattern: it is a match pattern if `match` is set,
/// a begin/end pattern if `begin` is set, an include if `include` is set and otherwise a plain
/// group of nested `patterns`. The classification happens when compiling.
///
/// # Examples
/// ```json
/// { "match": "\\b(if|else)\\b", "name": "keyword.control.c" }
/// ```
///
/// ```json
/// {
///   "name": "string.quoted.double.c",
///   "begin": "\"",
///   "end": "\"",
///   "patterns": [{ "include": "#escapes" }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all(deserialize = "camelCase"))]
pub struct RawRule {
    pub name: Option<String>,
    pub content_name: Option<String>,
    #[serde(rename(deserialize = "match"))]
    pub match_: Option<String>,
    pub begin: Option<String>,
    pub end: Option<String>,
    pub include: Option<String>,
    /// Fallback for `beginCaptures`/`endCaptures` and the captures of match patterns
    pub captures: Captures,
    pub begin_captures: Captures,
    pub end_captures: Captures,
    pub patterns: Vec<RawRule>,
}

/// Repository values are usually a single pattern but some grammars use a bare array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RepositoryEntry {
    Rule(RawRule),
    List(Vec<RawRule>),
}

impl From<RepositoryEntry> for RawRule {
    fn from(entry: RepositoryEntry) -> Self {
        match entry {
            RepositoryEntry::Rule(rule) => rule,
            RepositoryEntry::List(patterns) => RawRule {
                patterns,
                ..Default::default()
            },
        }
    }
}

/// Top-level structure representing a complete grammar file
///
/// # Examples
/// ```json
/// {
///   "name": "C",
///   "scopeName": "source.c",
///   "fileTypes": ["c", "h"],
///   "firstLineMatch": "-[*]-( Mode:)? C -[*]-",
///   "patterns": [{ "include": "#block" }],
///   "repository": {
///     "block": { "begin": "\\{", "end": "\\}", "name": "meta.block.c" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct RawGrammar {
    /// Human-readable name of the language, eg "C++"
    #[serde(default)]
    pub name: Option<String>,
    /// Unique identifier for this grammar, eg "source.c++"
    #[serde(default)]
    pub scope_name: String,
    /// File extensions this grammar applies to, without the leading dot
    #[serde(default)]
    pub file_types: Vec<String>,
    /// Optional regex to identify files by their first line content
    #[serde(default)]
    pub first_line_match: Option<String>,
    /// Root patterns, tried in order
    #[serde(default)]
    pub patterns: Vec<RawRule>,
    /// Named pattern definitions that can be referenced by `#name` includes
    #[serde(default)]
    pub repository: HashMap<String, RepositoryEntry>,
    /// Grammars only meant to be embedded are not listed to users
    #[serde(default)]
    pub hide_from_user: bool,
}

/// The formats grammar files are written in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GrammarFormat {
    Json,
    /// Property list, the format of TextMate `.tmLanguage` files
    Plist,
}

impl GrammarFormat {
    /// The format of a grammar file from its extension, `None` if it is not a grammar file
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(GrammarFormat::Json),
            "tmlanguage" | "plist" => Some(GrammarFormat::Plist),
            _ => None,
        }
    }

    fn read<T: DeserializeOwned>(self, path: &Path) -> ScopeTreeResult<T> {
        match self {
            GrammarFormat::Json => Ok(serde_json::from_str(&fs::read_to_string(path)?)?),
            GrammarFormat::Plist => Ok(plist::from_file(path)?),
        }
    }
}

/// Reads a grammar file, as JSON unless its extension says otherwise, and checks that it has
/// a scope name
fn read_grammar_file<T: DeserializeOwned>(
    path: &Path,
    scope_name: impl Fn(&T) -> &str,
) -> ScopeTreeResult<T> {
    let format = GrammarFormat::from_path(path).unwrap_or(GrammarFormat::Json);
    let value = format.read(path)?;
    if scope_name(&value).trim().is_empty() {
        return Err(Error::InvalidGrammar {
            path: path.to_path_buf(),
            reason: "missing scopeName".to_owned(),
        });
    }
    Ok(value)
}

impl RawGrammar {
    /// Loads a `.json` or `.tmLanguage` grammar file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ScopeTreeResult<Self> {
        read_grammar_file(path.as_ref(), |raw: &Self| raw.scope_name.as_str())
    }

    /// Compile this raw grammar into the immutable grammar model
    pub fn compile(self) -> Grammar {
        Grammar::from_raw_grammar(self)
    }
}

/// The few fields the registry needs to index a grammar file without compiling it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct GrammarHeader {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scope_name: String,
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default)]
    pub first_line_match: Option<String>,
    #[serde(default)]
    pub hide_from_user: bool,
}

impl GrammarHeader {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ScopeTreeResult<Self> {
        read_grammar_file(path.as_ref(), |header: &Self| header.scope_name.as_str())
    }
}
