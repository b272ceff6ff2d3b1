//! price-check — 校验价格表并按给定 token 数试算费用
//!
//! Usage:
//!   price-check <path> [--input N] [--output M]
//!
//! `<path>` is a single `*.json` file or a directory of them. A file holds
//! either one price table (named after the file stem) or an object mapping
//! model ids to tables. With `--input`/`--output`, the cost of that many
//! tokens is printed for every valid model. Exit code 1 on any invalid table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use llm_gateway_core::tokens::{CompletionPriceInfo, ToolInvocations};
use llm_gateway_core::types::TokenUsage;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

struct Args {
    path: PathBuf,
    input: Option<u64>,
    output: Option<u64>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut path = None;
    let mut input = None;
    let mut output = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--input" => {
                let v = args.next().context("--input needs a token count")?;
                input = Some(v.parse().with_context(|| format!("invalid --input '{}'", v))?);
            }
            "--output" => {
                let v = args.next().context("--output needs a token count")?;
                output = Some(v.parse().with_context(|| format!("invalid --output '{}'", v))?);
            }
            "help" | "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if other.starts_with("--") => bail!("unknown option: {}", other),
            other => path = Some(PathBuf::from(other)),
        }
    }
    let path = path.context("missing price table path")?;
    Ok(Args { path, input, output })
}

fn print_usage() {
    println!(
        r#"price-check — 价格表校验工具

USAGE:
    price-check <PATH> [--input N] [--output M]

ARGS:
    <PATH>          A price table JSON file or a directory of them

OPTIONS:
    --input N       Prompt tokens to price against every table
    --output M      Completion tokens to price against every table

ENVIRONMENT:
    RUST_LOG        Log filter (default: warn)"#
    );
}

fn table_files(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("cannot read directory {}", path.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    files.sort();
    Ok(files)
}

/// Every (model, table) in one file. A top-level `mode` key marks a single table.
fn load_tables(file: &Path) -> anyhow::Result<Vec<(String, anyhow::Result<CompletionPriceInfo>)>> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))?;
    let value: Value = serde_json::from_str(&raw).with_context(|| format!("{} is not JSON", file.display()))?;
    let parse = |v: &Value| -> anyhow::Result<CompletionPriceInfo> {
        Ok(CompletionPriceInfo::from_json_str(&v.to_string())?)
    };
    match value {
        Value::Object(ref map) if map.contains_key("mode") => {
            let model = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(vec![(model, parse(&value))])
        }
        Value::Object(map) => Ok(map.iter().map(|(model, v)| (model.clone(), parse(v))).collect()),
        _ => bail!("{}: expected a JSON object", file.display()),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args().map_err(|e| {
        print_usage();
        e
    })?;
    let files = table_files(&args.path)?;
    if files.is_empty() {
        bail!("no *.json price tables under {}", args.path.display());
    }

    let mut valid = BTreeMap::new();
    let mut errors = Vec::new();
    for file in &files {
        let tables = match load_tables(file) {
            Ok(tables) => tables,
            Err(e) => {
                errors.push(format!("  {}: {:#}", file.display(), e));
                continue;
            }
        };
        for (model, table) in tables {
            match table {
                Ok(info) => {
                    tracing::debug!(model = %model, file = %file.display(), "price table valid");
                    valid.insert(model, info);
                }
                Err(e) => errors.push(format!("  {} ({}): {:#}", model, file.display(), e)),
            }
        }
    }

    println!("=== {} valid price table(s) ===", valid.len());
    let usage = (args.input.is_some() || args.output.is_some())
        .then(|| TokenUsage::new(args.input.unwrap_or(0), args.output.unwrap_or(0)));
    for (model, info) in &valid {
        match &usage {
            None => println!("  {}", model),
            Some(usage) => match info.cost(usage, &ToolInvocations::new()) {
                Ok(cost) => println!(
                    "  {}: input {} + output {} = {}",
                    model, cost.input, cost.output, cost.total
                ),
                Err(e) => println!("  {}: {}", model, e),
            },
        }
    }

    if errors.is_empty() {
        return Ok(());
    }
    println!("\n=== {} invalid price table(s) ===", errors.len());
    for err in &errors {
        println!("{}", err);
    }
    std::process::exit(1);
}
