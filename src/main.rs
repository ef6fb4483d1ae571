use anyhow::{Context, Result};
use clap::Parser;
use jar_obfuscator::cli::{Cli, Commands, ObfuscateArgs, OutputFormat};
use jar_obfuscator::config::{resolve_config, ObfuscatorConfig};
use jar_obfuscator::pipeline::{inspect_jar, JarSummary, ObfuscationContext, ObfuscationReport, Obfuscator};
use jar_obfuscator::scan::{default_output_path, mirrored_output, scan_jars};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jar_obfuscator=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_cli()?;

    match cli.command.clone() {
        Commands::Obfuscate(args) => {
            let mut config = resolve_config(&cli)?;
            config.apply_args(&args);
            if !config.any_pass_enabled() {
                anyhow::bail!(
                    "Nothing to do: enable a pass (--rename, --strings, --flow, --anti-debug, \
                     --bind-hash, --bind-dir, --password) or use --all"
                );
            }
            obfuscate(&args, config)?;
        }
        Commands::Inspect { jar, format } => {
            let summary = inspect_jar(&jar)?;
            print_output(&summary, format, inspect_text)?;
        }
    }

    Ok(())
}

fn parse_cli() -> Result<Cli> {
    let args: Vec<String> = std::env::args().collect();
    Ok(Cli::parse_from(rewrite_args_for_implicit_obfuscate(args)))
}

/// `jar-obfuscator app.jar --all` means `jar-obfuscator obfuscate app.jar --all`.
fn rewrite_args_for_implicit_obfuscate(mut args: Vec<String>) -> Vec<String> {
    if args.len() <= 1 {
        return args;
    }

    let subcommands = ["obfuscate", "inspect", "help"];

    let mut idx = 1usize;
    while idx < args.len() {
        let a = args[idx].as_str();
        if a == "--" {
            idx += 1;
            break;
        }

        if a == "--config" {
            idx += 2;
            continue;
        }

        if a.starts_with('-') {
            idx += 1;
            continue;
        }

        break;
    }

    if idx < args.len() && !subcommands.contains(&args[idx].as_str()) {
        // Flags given before the jar belong to `obfuscate` too.
        args.insert(1, "obfuscate".to_string());
    }

    args
}

#[derive(Debug, Serialize)]
struct BatchReport {
    input_root: String,
    output_root: String,
    jars: Vec<ObfuscationReport>,
    failed: Vec<BatchFailure>,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct BatchFailure {
    jar: String,
    error: String,
}

fn obfuscate(args: &ObfuscateArgs, config: ObfuscatorConfig) -> Result<()> {
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input));

    if !args.input.is_dir() {
        let report = Obfuscator::new(ObfuscationContext {
            input: args.input.clone(),
            output,
            config,
        })
        .run()?;
        return print_output(&report, args.format, report_text);
    }

    let batch = obfuscate_dir(&args.input, &output, &config)?;
    print_output(&batch, args.format, batch_text)?;
    if !batch.failed.is_empty() {
        anyhow::bail!("{} of {} jars failed", batch.failed.len(), batch.failed.len() + batch.jars.len());
    }
    Ok(())
}

/// Every jar below `input_root` goes to the same relative path below `output_root`.
fn obfuscate_dir(input_root: &Path, output_root: &Path, config: &ObfuscatorConfig) -> Result<BatchReport> {
    let start = Instant::now();
    let jars: Vec<PathBuf> = scan_jars(input_root)?
        .into_iter()
        .filter(|jar| !jar.starts_with(output_root))
        .collect();
    if jars.is_empty() {
        anyhow::bail!("No jars found below {}", input_root.display());
    }
    info!(count = jars.len(), root = %input_root.display(), "jars found");

    let mut reports = Vec::with_capacity(jars.len());
    let mut failed = Vec::new();
    for jar in &jars {
        let ctx = ObfuscationContext {
            input: jar.clone(),
            output: mirrored_output(input_root, jar, output_root),
            config: batch_config(config, input_root, jar),
        };
        match Obfuscator::new(ctx).run() {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!(jar = %jar.display(), "{e:#}");
                failed.push(BatchFailure {
                    jar: jar.to_string_lossy().to_string(),
                    error: format!("{e:#}"),
                });
            }
        }
    }

    Ok(BatchReport {
        input_root: input_root.to_string_lossy().to_string(),
        output_root: output_root.to_string_lossy().to_string(),
        jars: reports,
        failed,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Settings for one jar of a batch: the mapping goes to `<mapping dir>/<relative jar path>.json`
/// and a fixed seed is mixed with the jar's relative path, so no two jars share keys or
/// passwords while reruns stay reproducible.
fn batch_config(config: &ObfuscatorConfig, input_root: &Path, jar: &Path) -> ObfuscatorConfig {
    let mut config = config.clone();
    if let Some(mapping) = &config.rename.mapping {
        let mut path = mirrored_output(input_root, jar, mapping).into_os_string();
        path.push(".json");
        config.rename.mapping = Some(PathBuf::from(path));
    }
    if let Some(seed) = config.seed {
        let relative = jar.strip_prefix(input_root).unwrap_or(jar);
        let mut hasher = Sha256::new();
        hasher.update(seed.to_le_bytes());
        hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        config.seed = Some(u64::from_le_bytes(head));
    }
    config
}

fn print_output<T: Serialize>(value: &T, format: OutputFormat, text: fn(&T) -> String) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value).context("Failed to serialize output")?,
        OutputFormat::Text => text(value),
    };
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn report_text(report: &ObfuscationReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("input: {}\n", report.input));
    out.push_str(&format!("output: {}\n", report.output));
    out.push_str(&format!("classes: {}\n", report.classes));
    out.push_str(&format!("resources: {}\n", report.resources));
    out.push_str(&format!("passes: {}\n", report.passes.join(", ")));
    if !report.injected_classes.is_empty() {
        out.push_str(&format!("injected_classes: {}\n", report.injected_classes.join(", ")));
    }
    let stats = &report.stats;
    out.push_str(&format!("renamed_classes: {}\n", stats.renamed_classes));
    out.push_str(&format!("encrypted_strings: {}\n", stats.encrypted_strings));
    out.push_str(&format!("dead_branches: {}\n", stats.dead_branches));
    out.push_str(&format!("guarded_methods: {}\n", stats.guarded_methods));
    out.push_str(&format!("guarded_entry_points: {}\n", stats.guarded_entry_points));
    if let Some(before) = &report.main_class_before {
        out.push_str(&format!(
            "main_class: {before} -> {}\n",
            report.main_class_after.as_deref().unwrap_or(before)
        ));
    }
    if let Some(pw) = &report.generated_password {
        out.push_str(&format!("generated_password: {pw}\n"));
    }
    out.push_str(&format!("seed: {}\n", report.seed));
    out.push_str(&format!("output_sha256: {}\n", report.output_sha256));
    out.push_str(&format!("duration_ms: {}\n", report.duration_ms));
    out
}

fn batch_text(batch: &BatchReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("input_root: {}\n", batch.input_root));
    out.push_str(&format!("output_root: {}\n", batch.output_root));
    out.push_str(&format!("duration_ms: {}\n", batch.duration_ms));
    for r in &batch.jars {
        out.push_str(&format!(
            "- {} -> {} (classes: {}, sha256: {})\n",
            r.input, r.output, r.classes, r.output_sha256
        ));
        if let Some(pw) = &r.generated_password {
            out.push_str(&format!("  generated_password: {pw}\n"));
        }
    }
    for f in &batch.failed {
        out.push_str(&format!("- {} FAILED: {}\n", f.jar, f.error));
    }
    out
}

fn inspect_text(summary: &JarSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("jar: {}\n", summary.jar));
    out.push_str(&format!(
        "main_class: {}\n",
        summary.main_class.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!("signed: {}\n", summary.signed));
    out.push_str(&format!("classes: {}\n", summary.class_count));
    for c in &summary.classes {
        out.push_str(&format!(
            "- {} extends {} (version {}, {} fields, {} methods)\n",
            c.name,
            c.super_name.as_deref().unwrap_or("-"),
            c.version,
            c.fields,
            c.methods
        ));
    }
    out.push_str(&format!("resources: {}\n", summary.resource_count));
    for r in &summary.resources {
        out.push_str(&format!("- {r}\n"));
    }
    out
}
