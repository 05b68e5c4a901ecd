//! fparse - formula evaluation and analysis tool

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use formula_parser::{
    compile, extract_dependencies, extract_dependencies_with_ranges, fold, interpret,
    parse_formula, CompositeVariableProvider, ExpressionVariableProvider, FormulaExpr,
    FunctionRegistry, MapVariableProvider, NativeCompiler, NativeOptions, OptLevel,
    ResolvedRange, Value, VariableProvider,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fparse")]
#[command(author, version, about = "Formula evaluation and analysis tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a formula and print its value
    Eval {
        /// Formula text, e.g. "SQRT([A]) * 2"
        formula: String,

        /// Variable value (NAME=VALUE); values that are not numbers are text
        #[arg(short, long = "var", value_parser = parse_assignment)]
        vars: Vec<(String, String)>,

        /// Variable defined by a formula (NAME=FORMULA)
        #[arg(short, long = "define", value_parser = parse_assignment)]
        defines: Vec<(String, String)>,

        /// Evaluation strategy
        #[arg(short, long, value_enum, default_value_t = Backend::Interpret)]
        backend: Backend,

        /// Fold constant subexpressions before evaluating
        #[arg(short, long)]
        fold: bool,

        /// Maximum nesting depth accepted by the native backend
        #[arg(long, default_value_t = NativeOptions::default().max_depth)]
        max_depth: usize,

        /// Optimization level of the native backend
        #[arg(long, value_enum, default_value_t = Optimization::Speed)]
        opt_level: Optimization,
    },

    /// Print a formula with its constant subexpressions folded
    Fold {
        /// Formula text
        formula: String,
    },

    /// List the variables a formula reads
    Deps {
        /// Formula text
        formula: String,

        /// Also print the range bounds of each variable
        #[arg(short, long)]
        ranges: bool,
    },

    /// Check a CSV file of Name,Expression,Expected rows
    Check {
        /// CSV file
        input: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Interpret,
    Closure,
    Native,
}

#[derive(Clone, Copy, ValueEnum)]
enum Optimization {
    None,
    Speed,
    SpeedAndSize,
}

impl From<Optimization> for OptLevel {
    fn from(level: Optimization) -> Self {
        match level {
            Optimization::None => OptLevel::None,
            Optimization::Speed => OptLevel::Speed,
            Optimization::SpeedAndSize => OptLevel::SpeedAndSize,
        }
    }
}

fn main() -> Result<ExitCode> {
    // Only install a subscriber when RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .init();
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Eval {
            formula,
            vars,
            defines,
            backend,
            fold,
            max_depth,
            opt_level,
        } => {
            let options = NativeOptions {
                max_depth,
                opt_level: opt_level.into(),
            };
            evaluate(&formula, vars, defines, backend, fold, options)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Fold { formula } => {
            show_folded(&formula)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Deps { formula, ranges } => {
            show_dependencies(&formula, ranges)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { input } => check(&input),
    }
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

fn parse(formula: &str) -> Result<FormulaExpr> {
    parse_formula(formula).with_context(|| format!("Failed to parse '{}'", formula))
}

fn evaluate(
    formula: &str,
    vars: Vec<(String, String)>,
    defines: Vec<(String, String)>,
    backend: Backend,
    fold_constants: bool,
    options: NativeOptions,
) -> Result<()> {
    let functions = FunctionRegistry::global();

    let mut expr = parse(formula)?;
    if fold_constants {
        expr = fold(&expr, functions);
        tracing::debug!(folded = %expr, "folded formula");
    }

    let values: MapVariableProvider = vars
        .into_iter()
        .map(|(name, value)| {
            let value = match value.parse::<f64>() {
                Ok(n) => Value::Number(n),
                Err(_) => Value::Text(value),
            };
            (name, value)
        })
        .collect();
    let provider = CompositeVariableProvider::build(|handle| {
        vec![
            Box::new(ExpressionVariableProvider::new(defines).within(handle))
                as Box<dyn VariableProvider>,
            Box::new(values),
        ]
    });

    let value = match backend {
        Backend::Interpret => interpret(&expr, provider.as_ref(), functions),
        Backend::Closure => compile(&expr).evaluate(provider.as_ref(), functions),
        Backend::Native => NativeCompiler::new(options)
            .compile(&expr)
            .context("Failed to compile formula")?
            .evaluate(provider.as_ref(), functions),
    }
    .with_context(|| format!("Failed to evaluate '{}'", formula))?;

    println!("{}", value);
    Ok(())
}

fn show_folded(formula: &str) -> Result<()> {
    let expr = parse(formula)?;
    println!("{}", fold(&expr, FunctionRegistry::global()));
    Ok(())
}

fn show_dependencies(formula: &str, ranges: bool) -> Result<()> {
    let expr = parse(formula)?;

    if !ranges {
        for name in extract_dependencies(&expr) {
            println!("{}", name);
        }
        return Ok(());
    }

    let bound = |value: Option<Value>| value.map(|v| v.to_string()).unwrap_or_default();
    for dependency in extract_dependencies_with_ranges(&expr).into_values() {
        println!(
            "{}\t{}\t{}",
            dependency.name,
            bound(dependency.lower),
            bound(dependency.upper)
        );
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckRow {
    name: String,
    expression: String,
    expected: f64,
}

fn check(input: &Path) -> Result<ExitCode> {
    let mut reader = csv::Reader::from_path(input)
        .with_context(|| format!("Failed to open '{}'", input.display()))?;
    let rows = reader
        .deserialize()
        .collect::<Result<Vec<CheckRow>, _>>()
        .with_context(|| format!("Failed to read '{}'", input.display()))?;
    if rows.is_empty() {
        bail!("'{}' has no rows", input.display());
    }

    let vars = ExpressionVariableProvider::new(
        rows.iter()
            .map(|row| (row.name.clone(), row.expression.clone())),
    );

    let mut failures = 0;
    for row in &rows {
        let expected = Value::Number(row.expected);
        match vars.lookup(&row.name, &ResolvedRange::UNBOUNDED) {
            Ok(Some(actual)) if actual == expected => {}
            Ok(actual) => {
                failures += 1;
                let actual = actual.unwrap_or_default();
                eprintln!(
                    "{}: expected {}, got {} ({})",
                    row.name, expected, actual, row.expression
                );
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: {} ({})", row.name, e, row.expression);
            }
        }
    }

    eprintln!(
        "Validated {} entries from '{}' ({} failed)",
        rows.len(),
        input.display(),
        failures
    );
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("Rate = 0.25").unwrap(),
            ("Rate".to_string(), "0.25".to_string())
        );
        assert_eq!(
            parse_assignment("Total=[Net]*2").unwrap(),
            ("Total".to_string(), "[Net]*2".to_string())
        );
        assert!(parse_assignment("Rate").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_eval_arguments() {
        let cli = Cli::try_parse_from([
            "fparse", "eval", "[A] * 2", "--var", "A=3", "--backend", "native", "--fold",
        ])
        .unwrap();
        match cli.command {
            Commands::Eval {
                formula,
                vars,
                backend,
                fold,
                ..
            } => {
                assert_eq!(formula, "[A] * 2");
                assert_eq!(vars, vec![("A".to_string(), "3".to_string())]);
                assert!(matches!(backend, Backend::Native));
                assert!(fold);
            }
            _ => panic!("expected eval"),
        }
    }
}
