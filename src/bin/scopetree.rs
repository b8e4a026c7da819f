//! Prints the scope tree of a file.
//!
//! Usage:
//!   scopetree --grammars `<dir>` `<path>` [--scope `<scope>`] [--spans]
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use scopetree::{Error, ParseOptions, Registry};

#[derive(Parser)]
#[command(name = "scopetree")]
#[command(about = "Prints the scope tree built by a TextMate grammar for a file")]
struct Args {
    /// File to parse
    file: PathBuf,

    /// Directory holding the `.json` and `.tmLanguage` grammars
    #[arg(short, long)]
    grammars: PathBuf,

    /// Scope name of the grammar to use, found from the file name or first line otherwise
    #[arg(short, long)]
    scope: Option<String>,

    /// Stops after that many scan steps
    #[arg(long)]
    max_steps: Option<usize>,

    /// Stops after that many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Prints one line per span with its scope stack instead of the tree
    #[arg(long)]
    spans: bool,

    /// Lists the grammars found in the directory and exits
    #[arg(long)]
    list: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let registry = match Registry::from_dir(&args.grammars) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Error loading grammars from {}: {e}", args.grammars.display());
            return ExitCode::FAILURE;
        }
    };

    if args.list {
        for (scope, name) in registry.scope_and_display_names() {
            println!("{name}: {scope}");
        }
        return ExitCode::SUCCESS;
    }

    let text = match fs::read_to_string(&args.file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error reading {}: {e}", args.file.display());
            return ExitCode::FAILURE;
        }
    };

    let mut options = ParseOptions::new();
    if let Some(max) = args.max_steps {
        options = options.max_steps(max);
    }
    if let Some(ms) = args.timeout_ms {
        options = options.time_budget(Duration::from_millis(ms));
    }

    let lookup = match &args.scope {
        Some(scope) => {
            if let Err(e) = registry.grammar(scope) {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
            scope.clone()
        }
        None => args.file.to_string_lossy().into_owned(),
    };
    let mut ctx = registry
        .create_parsing_context(&lookup, text)
        .with_options(options);

    let complete = match ctx.parse() {
        Ok(_) => true,
        Err(Error::ParseIncomplete { parsed_up_to }) => {
            eprintln!("Stopped at byte {parsed_up_to}, the tree below is partial");
            false
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let Some(root) = ctx.root() else {
        return ExitCode::FAILURE;
    };
    if args.spans {
        for span in root.spans() {
            println!(
                "{}-{}: {:?} {}",
                span.range.start,
                span.range.end,
                ctx.text_slice(span.range.start, span.range.end),
                span.scopes.join(" ")
            );
        }
    } else {
        print!("{}", root.dump(ctx.text()));
    }

    if complete {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
