//! Builds a tree of named regions out of a text using TextMate grammars, and keeps it up to
//! date as the text is edited.
//!
//! ```no_run
//! use scopetree::Registry;
//!
//! let registry = Registry::from_dir("grammars").unwrap();
//! let mut ctx = registry.create_parsing_context("main.c", "int main() { return 0; }");
//! let root = ctx.parse().unwrap().clone();
//! println!("{}", root.dump(ctx.text()));
//! ```
mod error;
pub mod grammars;
mod node;
mod options;
mod parser;
mod registry;

#[cfg(test)]
mod test_utils;

pub use error::Error;
pub use grammars::{Grammar, PLAIN_TEXT_SCOPE, RawGrammar};
pub use node::{Node, ScopeSpan};
pub use options::ParseOptions;
pub use parser::{CacheStats, ParsingContext};
pub use registry::{Registry, load_grammar};
