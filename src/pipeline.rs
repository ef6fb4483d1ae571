//! Reads a jar, runs the passes over its classes and writes the result.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::classfile::ClassFile;
use crate::config::ObfuscatorConfig;
use crate::crypto;
use crate::error::ClassResult;
use crate::jar::{self, JarEntry};
use crate::passes::{
    order_passes, AntiDebugPass, BindingPass, ClassScope, FinishContext, FlowPass, Pass,
    PassContext, PassStats, PasswordPass, RenamePass, StringsPass, TracePass,
};

pub struct ObfuscationContext {
    pub input: PathBuf,
    pub output: PathBuf,
    pub config: ObfuscatorConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObfuscationReport {
    pub input: String,
    pub output: String,
    pub classes: usize,
    pub resources: usize,
    pub passes: Vec<String>,
    pub injected_classes: Vec<String>,
    #[serde(flatten)]
    pub stats: PassStats,
    pub main_class_before: Option<String>,
    pub main_class_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_password: Option<String>,
    pub seed: u64,
    pub output_sha256: String,
    pub duration_ms: u64,
}

pub struct Obfuscator {
    ctx: ObfuscationContext,
}

impl Obfuscator {
    pub fn new(ctx: ObfuscationContext) -> Self {
        Self { ctx }
    }

    pub fn run(&self) -> Result<ObfuscationReport> {
        let start = Instant::now();
        let ObfuscationContext {
            input,
            output,
            config,
        } = &self.ctx;
        ensure_distinct(input, output)?;

        let contents = jar::read_jar(input)?;
        info!(
            jar = %input.display(),
            classes = contents.classes.len(),
            resources = contents.resources.len(),
            "jar read"
        );

        let seed = config.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let generated_password = (config.password.enabled && config.password.password.is_none())
            .then(|| crypto::generate_password(&mut rng));
        let password = config.password.password.clone().or_else(|| generated_password.clone());

        let mut passes = build_passes(config, password.as_deref());
        if passes.is_empty() {
            anyhow::bail!(
                "Nothing to do: enable a pass (--rename, --strings, --flow, --anti-debug, \
                 --bind-hash, --bind-dir, --password) or use --all"
            );
        }
        order_passes(&mut passes);
        let pass_names: Vec<String> = passes.iter().map(|p| p.kind().to_string()).collect();

        let mut classes = contents
            .classes
            .par_iter()
            .map(|e| ClassFile::parse(&e.data).with_context(|| format!("Failed to parse class {}", e.name)))
            .collect::<Result<Vec<_>>>()?;
        let old_names = classes
            .iter()
            .map(ClassFile::this_name)
            .collect::<ClassResult<Vec<_>>>()?;

        let main_before = contents.manifest.as_ref().and_then(jar::Manifest::main_class);
        let runtime_package = config.runtime_package.trim_matches('/').replace('.', "/");
        {
            let ctx = PassContext {
                classes: &classes,
                main_class: main_before.as_deref(),
                runtime_package: &runtime_package,
            };
            for pass in passes.iter_mut() {
                let kind = pass.kind();
                pass.init(&ctx, &mut rng)
                    .with_context(|| format!("Failed to initialize the {kind} pass"))?;
            }
        }

        let passes_ref = &passes;
        let per_class = classes
            .par_iter_mut()
            .enumerate()
            .map(|(index, class)| -> Result<PassStats> {
                let mut scope = ClassScope {
                    index,
                    class_name: old_names[index].clone(),
                    rng: StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
                };
                let mut stats = PassStats::default();
                for pass in passes_ref {
                    stats += pass.transform(class, &mut scope).with_context(|| {
                        format!("The {} pass failed on {}", pass.kind(), scope.class_name)
                    })?;
                }
                Ok(stats)
            })
            .collect::<Result<Vec<_>>>()?;
        let mut stats = PassStats::default();
        for s in per_class {
            stats += s;
        }

        let mut runtime = Vec::new();
        let mut runtime_names = HashSet::new();
        for pass in &passes {
            for class in pass.runtime_classes()? {
                if runtime_names.insert(class.this_name()?) {
                    runtime.push(class);
                }
            }
        }

        for pass in passes.iter_mut() {
            let kind = pass.kind();
            pass.finish(&FinishContext {
                stats: &stats,
                classes: classes.len(),
            })
            .with_context(|| format!("Failed to finish the {kind} pass"))?;
        }

        let mapping: BTreeMap<String, String> = passes
            .iter()
            .find_map(|p| p.class_mapping())
            .cloned()
            .unwrap_or_default();
        let main_after = main_before
            .as_ref()
            .map(|m| mapping.get(m).cloned().unwrap_or_else(|| m.clone()));
        let mut manifest = contents.manifest.clone();
        if let (Some(manifest), Some(main)) = (manifest.as_mut(), main_after.as_deref()) {
            manifest.set_main_class(main);
        }

        let mut class_entries = classes
            .par_iter_mut()
            .zip(contents.classes.par_iter())
            .zip(old_names.par_iter())
            .map(|((class, entry), old)| -> Result<JarEntry> {
                let new = class.this_name()?;
                let data = class
                    .to_bytes()
                    .with_context(|| format!("Failed to write class {new}"))?;
                Ok(JarEntry {
                    name: output_entry_name(&entry.name, old, &new),
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let taken: HashSet<&str> = class_entries
            .iter()
            .map(|e| e.name.as_str())
            .chain(contents.resources.iter().map(|e| e.name.as_str()))
            .collect();
        let mut injected = Vec::with_capacity(runtime.len());
        let mut runtime_entries = Vec::with_capacity(runtime.len());
        for mut class in runtime {
            let name = class.this_name()?;
            let entry_name = format!("{name}.class");
            if taken.contains(entry_name.as_str()) {
                anyhow::bail!(
                    "Generated class {name} clashes with an entry of the jar; choose another runtime_package"
                );
            }
            let data = class
                .to_bytes()
                .with_context(|| format!("Failed to write generated class {name}"))?;
            runtime_entries.push(JarEntry {
                name: entry_name,
                data,
            });
            injected.push(name);
        }
        class_entries.extend(runtime_entries);

        let directories = used_directories(&contents.directories, &class_entries, &contents.resources);
        if let Some(parent) = output.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        jar::write_jar(
            output,
            manifest.as_ref(),
            &directories,
            &class_entries,
            &contents.resources,
        )?;
        let output_sha256 = sha256_file(output)?;

        if let Some(pw) = &generated_password {
            warn!("generated password, keep it: {pw}");
        }
        let report = ObfuscationReport {
            input: input.to_string_lossy().to_string(),
            output: output.to_string_lossy().to_string(),
            classes: classes.len(),
            resources: contents.resources.len(),
            passes: pass_names,
            injected_classes: injected,
            stats,
            main_class_before: main_before,
            main_class_after: main_after,
            generated_password,
            seed,
            output_sha256,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            output = %output.display(),
            duration_ms = report.duration_ms,
            "jar written"
        );
        Ok(report)
    }
}

/// Passes enabled by `config`, in no particular order.
pub fn build_passes(config: &ObfuscatorConfig, password: Option<&str>) -> Vec<Box<dyn Pass>> {
    let mut passes: Vec<Box<dyn Pass>> = Vec::new();
    if config.binding.enabled() {
        passes.push(Box::new(BindingPass::new(
            config.binding.expected_hash.clone(),
            config.binding.expected_dir.clone(),
        )));
    }
    if config.password.enabled
        && let Some(pw) = password
    {
        passes.push(Box::new(PasswordPass::new(pw)));
    }
    if config.anti_debug.enabled {
        passes.push(Box::new(AntiDebugPass::new(config.anti_debug.marker.clone())));
    }
    if config.flow.enabled {
        passes.push(Box::new(FlowPass::new(config.flow.dead_branches)));
    }
    if config.strings.enabled {
        passes.push(Box::new(StringsPass::new()));
    }
    if config.rename.enabled {
        passes.push(Box::new(RenamePass::new(
            config.rename.prefix.clone(),
            config.rename.keep.clone(),
            config.rename.mapping.clone(),
        )));
    }
    if !passes.is_empty() && tracing::enabled!(tracing::Level::DEBUG) {
        passes.push(Box::new(TracePass));
    }
    passes
}

fn ensure_distinct(input: &Path, output: &Path) -> Result<()> {
    let same = match (input.canonicalize(), output.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => input == output,
    };
    if same {
        anyhow::bail!("Output must differ from the input: {}", output.display());
    }
    Ok(())
}

/// Keeps the entry's directory prefix when the class is renamed.
fn output_entry_name(entry: &str, old: &str, new: &str) -> String {
    if old == new {
        return entry.to_string();
    }
    match entry.strip_suffix(&format!("{old}.class")) {
        Some(prefix) => format!("{prefix}{new}.class"),
        None => format!("{new}.class"),
    }
}

/// Directory entries that still have something below them.
fn used_directories(directories: &[String], classes: &[JarEntry], resources: &[JarEntry]) -> Vec<String> {
    let files: Vec<&str> = classes
        .iter()
        .chain(resources)
        .map(|e| e.name.as_str())
        .collect();
    let kept: Vec<String> = directories
        .iter()
        .filter(|d| files.iter().any(|f| f.starts_with(d.as_str())))
        .cloned()
        .collect();
    if kept.len() != directories.len() {
        debug!(dropped = directories.len() - kept.len(), "empty directories dropped");
    }
    kept
}

fn sha256_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&data)))
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassSummary {
    pub name: String,
    pub super_name: Option<String>,
    pub version: u16,
    pub fields: usize,
    pub methods: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JarSummary {
    pub jar: String,
    pub main_class: Option<String>,
    pub class_count: usize,
    pub resource_count: usize,
    pub signed: bool,
    pub classes: Vec<ClassSummary>,
    pub resources: Vec<String>,
}

pub fn inspect_jar(path: &Path) -> Result<JarSummary> {
    let contents = jar::read_jar(path)?;
    let classes = contents
        .classes
        .par_iter()
        .map(|e| -> Result<ClassSummary> {
            let class = ClassFile::parse(&e.data).with_context(|| format!("Failed to parse class {}", e.name))?;
            Ok(ClassSummary {
                name: class.this_name()?,
                super_name: class.super_name()?,
                version: class.major,
                fields: class.fields.len(),
                methods: class.methods.len(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(JarSummary {
        jar: path.to_string_lossy().to_string(),
        main_class: contents.manifest.as_ref().and_then(jar::Manifest::main_class),
        class_count: classes.len(),
        resource_count: contents.resources.len(),
        signed: contents.resources.iter().any(|e| jar::is_signature_file(&e.name)),
        classes,
        resources: contents.resources.into_iter().map(|e| e.name).collect(),
    })
}
