use std::fmt;
use std::io;
use std::path::PathBuf;

pub(crate) type ScopeTreeResult<T> = Result<T, Error>;

/// Errors that can occur during scopetree usage
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred when reading a grammar file
    /// or a dump file if the `dump` feature is enabled
    Io(io::Error),

    /// JSON parsing failed when loading a grammar.
    Json(serde_json::Error),

    /// Property list parsing failed when loading a `.tmLanguage` grammar.
    Plist(plist::Error),

    /// Bitcode encoding or decoding failed.
    #[cfg(feature = "dump")]
    Bitcode(bitcode::Error),

    /// The grammar file parsed but is not a usable grammar, eg it has no `scopeName`.
    #[allow(missing_docs)]
    InvalidGrammar { path: PathBuf, reason: String },

    /// A grammar was not found in the registry.
    GrammarNotFound(String),

    /// Parsing stopped before reaching the end of the text, either because the step/time
    /// budget ran out or because the caller cancelled it.
    /// The partial tree is still available from the parsing context.
    ParseIncomplete {
        /// Byte offset up to which the text was scanned
        parsed_up_to: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Json(err) => write!(f, "JSON parsing error: {}", err),
            Error::Plist(err) => write!(f, "plist parsing error: {}", err),
            #[cfg(feature = "dump")]
            Error::Bitcode(err) => write!(f, "bitcode error: {}", err),
            Error::InvalidGrammar { path, reason } => {
                write!(f, "invalid grammar '{}': {}", path.display(), reason)
            }
            Error::GrammarNotFound(name) => write!(f, "grammar '{}' not found", name),
            Error::ParseIncomplete { parsed_up_to } => {
                write!(f, "parse incomplete, stopped at byte {}", parsed_up_to)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::Plist(err) => Some(err),
            #[cfg(feature = "dump")]
            Error::Bitcode(err) => Some(err),
            Error::InvalidGrammar { .. }
            | Error::GrammarNotFound(_)
            | Error::ParseIncomplete { .. } => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<plist::Error> for Error {
    fn from(err: plist::Error) -> Self {
        Error::Plist(err)
    }
}

#[cfg(feature = "dump")]
impl From<bitcode::Error> for Error {
    fn from(err: bitcode::Error) -> Self {
        Error::Bitcode(err)
    }
}
