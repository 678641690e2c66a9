//! The Stencil Command-Line Interface.
//!
//! This module is the main entry point for all CLI commands and orchestrates
//! the core library functions. Every command builds one [`Environment`] from
//! the global options, then runs part or all of the pipeline on its input.

use std::fs;
use std::path::Path;
use std::process;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use crate::cli::args::{Command, EnvArgs, StencilArgs};
use crate::environment::{Environment, EnvironmentConfig};
use crate::TemplateError;

pub mod args;
pub mod output;

/// The main entry point for the CLI.
pub fn run() {
    init_tracing();
    let args = StencilArgs::parse();

    let result = build_environment(&args.env).and_then(|env| match args.command {
        Command::Render { file, vars, var } => handle_render(&env, &file, vars.as_deref(), var),
        Command::Tokens { file } => handle_tokens(&env, &file),
        Command::Ast { file } => handle_ast(&env, &file),
        Command::Compile { file, digest } => handle_compile(&env, &file, digest),
        Command::Check { path, ext } => handle_check(&env, &path, &ext),
        Command::Extensions => handle_extensions(&env),
    });

    if let Err(e) = result {
        output::print_error(e);
        process::exit(1);
    }
}

/// Installs a stderr subscriber filtered by `RUST_LOG` (default `warn`).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_environment(args: &EnvArgs) -> Result<Environment, TemplateError> {
    let mut config = match &args.config {
        Some(path) => EnvironmentConfig::from_path(path)?,
        None => EnvironmentConfig::default(),
    };
    config.extensions.extend(args.extensions.iter().cloned());
    config.trim_blocks |= args.trim_blocks;
    config.keep_trailing_newline |= args.keep_trailing_newline;
    Environment::new(config)
}

fn read_template(path: &Path) -> Result<(String, String), TemplateError> {
    let source = fs::read_to_string(path).map_err(|err| {
        err_msg!(Io, "cannot read '{}': {}", path.display(), err).with_cause(err)
    })?;
    Ok((path.display().to_string(), source))
}

fn io_error(err: std::io::Error) -> TemplateError {
    TemplateError::from(err)
}

// ============================================================================
// COMMAND HANDLERS
// ============================================================================

fn handle_render(
    env: &Environment,
    file: &Path,
    vars: Option<&Path>,
    var: Vec<(String, String)>,
) -> Result<(), TemplateError> {
    let (name, source) = read_template(file)?;
    let template = env.from_source(&source, &name)?;

    let mut json = match vars {
        Some(path) => load_vars(path)?,
        None => serde_json::Value::Object(serde_json::Map::new()),
    };
    if let serde_json::Value::Object(map) = &mut json {
        for (key, value) in var {
            map.insert(key, serde_json::Value::String(value));
        }
    }

    let rendered = template
        .render_json(json)
        .map_err(|err| err.with_template(Some(&name), &source))?;
    print!("{}", rendered);
    Ok(())
}

/// Reads a variables file. The document must be an object; an empty file
/// counts as no variables.
fn load_vars(path: &Path) -> Result<serde_json::Value, TemplateError> {
    let text = fs::read_to_string(path).map_err(io_error)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let json: serde_json::Value = if is_json {
        serde_json::from_str(&text).map_err(|err| {
            err_msg!(Configuration, "invalid variables file: {}", err).with_cause(err)
        })?
    } else {
        serde_yaml::from_str(&text).map_err(|err| {
            err_msg!(Configuration, "invalid variables file: {}", err).with_cause(err)
        })?
    };
    if json.is_null() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    if !json.is_object() {
        return Err(err_msg!(
            Configuration,
            "variables file must contain an object, got {}: '{}'",
            json_kind(&json),
            path.display()
        ));
    }
    Ok(json)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn handle_tokens(env: &Environment, file: &Path) -> Result<(), TemplateError> {
    let (name, source) = read_template(file)?;
    let source = env.preprocess(&source, Some(&name), Some(&name))?;
    let mut out = output::stdout();
    let mut last_line = 1;
    for token in env.tokenize(&source) {
        let token = token.map_err(|err| err.with_template(Some(&name), &source))?;
        last_line = token.line;
        output::print_token(&mut out, &token).map_err(io_error)?;
    }
    let eof = crate::syntax::Token::bare(last_line, crate::syntax::TokenKind::Eof);
    output::print_token(&mut out, &eof).map_err(io_error)?;
    Ok(())
}

fn handle_ast(env: &Environment, file: &Path) -> Result<(), TemplateError> {
    let (name, source) = read_template(file)?;
    let ast = env.parse(&source, Some(&name), Some(&name))?;
    let json = serde_json::to_string_pretty(&ast)
        .map_err(|err| err_msg!(Runtime, "cannot serialize AST: {}", err).with_cause(err))?;
    println!("{}", json);
    Ok(())
}

fn handle_compile(env: &Environment, file: &Path, digest_only: bool) -> Result<(), TemplateError> {
    let (name, source) = read_template(file)?;
    let program = env.compile(&source, Some(&name), Some(&name))?;
    if !digest_only {
        print!("{}", program);
    }
    println!("sha256 {}", program.digest());
    Ok(())
}

fn handle_check(env: &Environment, root: &Path, extensions: &[String]) -> Result<(), TemplateError> {
    let mut out = output::stdout();
    let mut checked = 0;
    let mut failed = 0;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            err_msg!(Io, "cannot walk '{}': {}", root.display(), err).with_cause(err)
        })?;
        let path = entry.path();
        let is_template = entry.file_type().is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|e| e == ext));
        if !is_template {
            continue;
        }
        checked += 1;
        let (name, source) = read_template(path)?;
        debug!(template = %name, "checking");
        match env.compile(&source, Some(&name), Some(&name)) {
            Ok(_) => output::print_check_result(&mut out, &name, true).map_err(io_error)?,
            Err(err) => {
                failed += 1;
                output::print_check_result(&mut out, &name, false).map_err(io_error)?;
                output::print_error(err);
            }
        }
    }
    output::print_check_summary(&mut out, checked, failed).map_err(io_error)?;
    info!(checked, failed, "check finished");
    if failed > 0 {
        return Err(err_msg!(
            Syntax,
            "{} of {} template(s) failed to compile",
            failed,
            checked
        ));
    }
    Ok(())
}

fn handle_extensions(env: &Environment) -> Result<(), TemplateError> {
    for extension in env.extensions().iter() {
        let tags = extension.tags().join(", ");
        println!(
            "{}  priority={}  tags=[{}]",
            extension.identifier(),
            extension.priority(),
            tags
        );
    }
    Ok(())
}
