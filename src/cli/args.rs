//! Defines the command-line arguments and subcommands for the Stencil CLI.
//!
//! This module uses the `clap` crate with its "derive" feature to create a
//! declarative and type-safe argument parsing structure.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// The main CLI argument structure.
#[derive(Debug, Parser)]
#[command(
    name = "stencil",
    version,
    about = "Compile, inspect and render Stencil templates."
)]
pub struct StencilArgs {
    #[command(flatten)]
    pub env: EnvArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options that shape the environment every command runs against.
#[derive(Debug, Args)]
pub struct EnvArgs {
    /// Environment configuration file (YAML, or JSON by extension).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Enable an extension by alias or identifier. Repeatable.
    #[arg(long = "extension", short = 'e', global = true)]
    pub extensions: Vec<String>,

    /// Drop the first newline after a block tag.
    #[arg(long, global = true)]
    pub trim_blocks: bool,

    /// Keep a single trailing newline at the end of templates.
    #[arg(long, global = true)]
    pub keep_trailing_newline: bool,
}

/// An enumeration of all available CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Full pipeline: preprocess, lex, filter, parse, compile, render.
    Render {
        /// The template file to render.
        #[arg(required = true)]
        file: PathBuf,
        /// Variables file (JSON, or YAML by extension).
        #[arg(long)]
        vars: Option<PathBuf>,
        /// A single string variable as `name=value`. Repeatable.
        #[arg(long = "var", value_parser = parse_key_value)]
        var: Vec<(String, String)>,
    },
    /// Print the token stream after the filter chain.
    Tokens {
        /// The template file to tokenize.
        #[arg(required = true)]
        file: PathBuf,
    },
    /// Print the parsed AST as JSON.
    Ast {
        /// The template file to parse.
        #[arg(required = true)]
        file: PathBuf,
    },
    /// Print the compiled program listing and its SHA-256 digest.
    Compile {
        /// The template file to compile.
        #[arg(required = true)]
        file: PathBuf,
        /// Print only the digest.
        #[arg(long)]
        digest: bool,
    },
    /// Compile every template under a directory and report failures.
    Check {
        /// The directory to walk.
        #[arg(default_value = "templates")]
        path: PathBuf,
        /// File extensions treated as templates.
        #[arg(long, value_delimiter = ',', default_value = "html,txt,j2,jinja,tmpl")]
        ext: Vec<String>,
    },
    /// List the extensions of the configured environment.
    Extensions,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))
}
