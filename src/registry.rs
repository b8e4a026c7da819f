use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, ScopeTreeResult};
use crate::grammars::{
    Grammar, GrammarFormat, GrammarHeader, PLAIN_TEXT_SCOPE, RawGrammar, Regex,
};
use crate::parser::ParsingContext;

/// Reads and compiles a grammar file.
pub fn load_grammar(path: impl AsRef<Path>) -> ScopeTreeResult<Grammar> {
    Ok(RawGrammar::load_from_file(path)?.compile())
}

/// What the registry knows about a grammar without loading it
struct GrammarEntry {
    /// `None` for grammars added already compiled
    path: Option<PathBuf>,
    display_name: String,
    first_line_match: Option<Regex>,
    hidden: bool,
}

#[cfg(feature = "dump")]
#[derive(serde::Serialize, serde::Deserialize)]
struct Dump<G> {
    grammars: Vec<G>,
}

/// All the grammars known to the application.
///
/// Scanning a directory only reads the grammar headers: a grammar is fully loaded and
/// compiled the first time something asks for it, and kept afterwards. A grammar that fails
/// to load is reported once and then treated as missing.
pub struct Registry {
    entries: HashMap<String, GrammarEntry>,
    scope_by_file_type: HashMap<String, String>,
    loaded: papaya::HashMap<String, Option<Arc<Grammar>>>,
    plain: Arc<Grammar>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut scopes: Vec<_> = self.entries.keys().collect();
        scopes.sort();
        f.debug_struct("Registry")
            .field("scopes", &scopes)
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

impl Registry {
    /// A registry with only the plain text grammar
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            scope_by_file_type: HashMap::new(),
            loaded: papaya::HashMap::new(),
            plain: Arc::new(Grammar::plain_text()),
        }
    }

    /// Registers every grammar file of `dir`: `.json` files and `.tmLanguage` property lists.
    ///
    /// Subdirectories are not visited. Files that cannot be read or have no scope name are
    /// skipped with a warning.
    pub fn from_dir(dir: impl AsRef<Path>) -> ScopeTreeResult<Self> {
        let mut registry = Self::new();
        registry.scan_dir(dir)?;
        Ok(registry)
    }

    /// Same as `from_dir`, adding to the existing grammars
    pub fn scan_dir(&mut self, dir: impl AsRef<Path>) -> ScopeTreeResult<()> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && GrammarFormat::from_path(&path).is_some() {
                paths.push(path);
            }
        }
        // Later files win on conflicts, keep it the same on every platform
        paths.sort();

        for path in paths {
            match GrammarHeader::load_from_file(&path) {
                Ok(header) => {
                    log::debug!("Found grammar {} in {}", header.scope_name, path.display());
                    let scope = header.scope_name.trim().to_owned();
                    self.register(
                        scope,
                        GrammarEntry {
                            path: Some(path),
                            display_name: header
                                .name
                                .unwrap_or_else(|| header.scope_name.clone()),
                            first_line_match: header.first_line_match.map(Regex::fixed),
                            hidden: header.hide_from_user,
                        },
                        &header.file_types,
                    );
                }
                Err(e) => log::warn!("Skipping grammar {}: {e}", path.display()),
            }
        }
        Ok(())
    }

    fn register(&mut self, scope: String, entry: GrammarEntry, file_types: &[String]) {
        for file_type in file_types {
            self.scope_by_file_type
                .insert(normalize_file_type(file_type), scope.clone());
        }
        if self.entries.insert(scope.clone(), entry).is_some() {
            log::debug!("Grammar {scope} replaced");
        }
        self.loaded.pin().remove(&scope);
    }

    /// Adds an already compiled grammar, replacing any grammar with the same scope name.
    pub fn add_grammar(&mut self, grammar: Grammar) -> Arc<Grammar> {
        let grammar = Arc::new(grammar);
        let scope = grammar.scope_name.clone();
        self.register(
            scope.clone(),
            GrammarEntry {
                path: None,
                display_name: grammar.display_name().to_owned(),
                first_line_match: grammar
                    .first_line_match
                    .as_ref()
                    .map(|re| Regex::fixed(re.pattern().to_owned())),
                hidden: grammar.hide_from_user,
            },
            &grammar.file_types,
        );
        self.loaded.pin().insert(scope, Some(grammar.clone()));
        grammar
    }

    /// Reads, compiles and adds the grammar at `path`.
    pub fn add_grammar_from_path(
        &mut self,
        path: impl AsRef<Path>,
    ) -> ScopeTreeResult<Arc<Grammar>> {
        let grammar = load_grammar(path)?;
        Ok(self.add_grammar(grammar))
    }

    pub fn contains_grammar(&self, scope: &str) -> bool {
        self.entries.contains_key(scope)
    }

    /// The plain text grammar used when nothing else fits
    pub fn default_grammar(&self) -> Arc<Grammar> {
        self.plain.clone()
    }

    /// Returns the grammar with that scope name, loading it on first use.
    pub fn grammar_for_scope(&self, scope: &str) -> Option<Arc<Grammar>> {
        let loaded = self.loaded.pin();
        if let Some(grammar) = loaded.get(scope) {
            return grammar.clone();
        }

        let Some(entry) = self.entries.get(scope) else {
            return (scope == PLAIN_TEXT_SCOPE).then(|| self.plain.clone());
        };
        let path = entry.path.as_ref()?;
        let grammar = match load_grammar(path) {
            Ok(grammar) => {
                log::debug!("Loaded grammar {scope} from {}", path.display());
                Some(Arc::new(grammar))
            }
            Err(e) => {
                log::warn!("Failed to load grammar {scope} from {}: {e}", path.display());
                None
            }
        };
        // Another thread may have loaded it meanwhile, keep the first one
        loaded.get_or_insert(scope.to_owned(), grammar).clone()
    }

    /// Same as `grammar_for_scope`, but a missing grammar or one that fails to load is an error.
    pub fn grammar(&self, scope: &str) -> ScopeTreeResult<Arc<Grammar>> {
        self.grammar_for_scope(scope)
            .ok_or_else(|| Error::GrammarNotFound(scope.to_owned()))
    }

    /// Grammar declaring `file_type` (eg `rs` or `.rs`) in its `fileTypes`
    pub fn grammar_for_extension(&self, file_type: &str) -> Option<Arc<Grammar>> {
        let scope = self.scope_by_file_type.get(&normalize_file_type(file_type))?;
        self.grammar_for_scope(scope)
    }

    /// Grammar for a file path, by its full file name first (eg `Makefile`) then its extension
    pub fn grammar_for_path(&self, path: impl AsRef<Path>) -> Option<Arc<Grammar>> {
        let path = path.as_ref();
        let by_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| self.grammar_for_extension(name));
        by_name.or_else(|| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .and_then(|ext| self.grammar_for_extension(ext))
        })
    }

    /// Grammar whose `firstLineMatch` matches `line`. Ties go to the smallest scope name.
    pub fn grammar_for_first_line(&self, line: &str) -> Option<Arc<Grammar>> {
        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .first_line_match
                    .as_ref()
                    .is_some_and(|re| re.find(line, 0, &[]).is_some())
            })
            .map(|(scope, _)| scope)
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .find_map(|scope| self.grammar_for_scope(scope))
    }

    /// `(scope name, display name)` of every grammar not hidden from users, sorted by
    /// display name.
    pub fn scope_and_display_names(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.hidden)
            .map(|(scope, entry)| (scope.clone(), entry.display_name.clone()))
            .collect();
        out.sort_by(|a, b| a.1.to_lowercase().cmp(&b.1.to_lowercase()).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Creates a parsing context for `text`.
    ///
    /// `scope_or_path` is tried as a scope name, then as a file path, then the first line of
    /// the text is matched against `firstLineMatch`. The plain text grammar is used if
    /// nothing fits.
    pub fn create_parsing_context(
        &self,
        scope_or_path: &str,
        text: impl Into<String>,
    ) -> ParsingContext<'_> {
        let text = text.into();
        let grammar = self
            .grammar_for_scope(scope_or_path)
            .or_else(|| self.grammar_for_path(scope_or_path))
            .or_else(|| self.grammar_for_first_line(text.lines().next().unwrap_or_default()))
            .unwrap_or_else(|| {
                log::debug!("No grammar for {scope_or_path:?}, using plain text");
                self.default_grammar()
            });
        ParsingContext::new(self, grammar, text)
    }

    #[cfg(feature = "dump")]
    /// Loads every grammar and writes them, compiled, to a compressed binary file.
    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> ScopeTreeResult<()> {
        let mut scopes: Vec<_> = self.entries.keys().collect();
        scopes.sort();
        let grammars: Vec<_> = scopes
            .into_iter()
            .filter_map(|scope| self.grammar_for_scope(scope))
            .collect();
        let dump = Dump {
            grammars: grammars.iter().map(|g| g.as_ref()).collect(),
        };

        let encoded = bitcode::serialize(&dump)?;
        let compressed = zstd::encode_all(encoded.as_slice(), 3)?;
        std::fs::write(path, compressed)?;
        Ok(())
    }

    #[cfg(feature = "dump")]
    /// Reads a file written by `dump_to_file`. Every grammar is already loaded.
    pub fn load_from_file(path: impl AsRef<Path>) -> ScopeTreeResult<Self> {
        let compressed = std::fs::read(path)?;
        let encoded = zstd::decode_all(compressed.as_slice())?;
        let dump: Dump<Grammar> = bitcode::deserialize(&encoded)?;

        let mut registry = Self::new();
        for grammar in dump.grammars {
            registry.add_grammar(grammar);
        }
        Ok(registry)
    }
}

fn normalize_file_type(file_type: &str) -> String {
    file_type.trim().trim_start_matches('.').to_lowercase()
}
