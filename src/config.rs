use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::{Cli, ObfuscateArgs};
use crate::passes::antidebug::DEFAULT_MARKER;
use crate::passes::flow::DEFAULT_DEAD_BRANCHES;
use crate::passes::rename::DEFAULT_PREFIX;

pub const LOCAL_CONFIG_FILE: &str = "jar-obfuscator.toml";
pub const DEFAULT_RUNTIME_PACKAGE: &str = "obf";

/// Settings read from TOML. Every section may be left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObfuscatorConfig {
    /// Seed for keys, salts and anchor choice. Random when unset.
    pub seed: Option<u64>,
    /// Package, in internal form, of the generated support classes.
    pub runtime_package: String,
    pub rename: RenameConfig,
    pub strings: StringsConfig,
    pub flow: FlowConfig,
    pub anti_debug: AntiDebugConfig,
    pub binding: BindingConfig,
    pub password: PasswordConfig,
}

impl Default for ObfuscatorConfig {
    fn default() -> Self {
        Self {
            seed: None,
            runtime_package: DEFAULT_RUNTIME_PACKAGE.to_string(),
            rename: RenameConfig::default(),
            strings: StringsConfig::default(),
            flow: FlowConfig::default(),
            anti_debug: AntiDebugConfig::default(),
            binding: BindingConfig::default(),
            password: PasswordConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenameConfig {
    pub enabled: bool,
    pub prefix: String,
    pub keep: Vec<String>,
    pub mapping: Option<PathBuf>,
}

impl Default for RenameConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: DEFAULT_PREFIX.to_string(),
            keep: Vec::new(),
            mapping: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StringsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    pub enabled: bool,
    pub dead_branches: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dead_branches: DEFAULT_DEAD_BRANCHES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AntiDebugConfig {
    pub enabled: bool,
    pub marker: String,
}

impl Default for AntiDebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            marker: DEFAULT_MARKER.to_string(),
        }
    }
}

/// Enabled as soon as one of the two values is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BindingConfig {
    pub expected_hash: Option<String>,
    pub expected_dir: Option<String>,
}

impl BindingConfig {
    pub fn enabled(&self) -> bool {
        self.expected_hash.is_some() || self.expected_dir.is_some()
    }
}

/// With `enabled` and no `password`, one is generated per run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PasswordConfig {
    pub enabled: bool,
    pub password: Option<String>,
}

impl ObfuscatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// Command-line flags win over the file. Pass flags only ever switch passes on.
    pub fn apply_args(&mut self, args: &ObfuscateArgs) {
        if args.all {
            self.rename.enabled = true;
            self.strings.enabled = true;
            self.flow.enabled = true;
            self.anti_debug.enabled = true;
        }
        self.rename.enabled |= args.rename;
        self.strings.enabled |= args.strings;
        self.flow.enabled |= args.flow;
        self.anti_debug.enabled |= args.anti_debug;
        if args.bind_hash.is_some() {
            self.binding.expected_hash = args.bind_hash.clone();
        }
        if args.bind_dir.is_some() {
            self.binding.expected_dir = args.bind_dir.clone();
        }
        if let Some(password) = &args.password {
            self.password.enabled = true;
            if password.is_some() {
                self.password.password = password.clone();
            }
        }
        if args.seed.is_some() {
            self.seed = args.seed;
        }
        if let Some(n) = args.dead_branches {
            self.flow.dead_branches = n;
        }
        self.rename.keep.extend(args.keep.iter().cloned());
        if args.mapping.is_some() {
            self.rename.mapping = args.mapping.clone();
        }
    }

    pub fn any_pass_enabled(&self) -> bool {
        self.rename.enabled
            || self.strings.enabled
            || self.flow.enabled
            || self.anti_debug.enabled
            || self.binding.enabled()
            || self.password.enabled
    }
}

/// `--config`, then `./jar-obfuscator.toml`, then `<config dir>/jar-obfuscator/config.toml`.
pub fn resolve_config_path(cli: &Cli) -> Result<Option<PathBuf>> {
    if let Some(p) = cli.config.clone() {
        if !p.is_file() {
            anyhow::bail!("Config file not found: {}", p.display());
        }
        return Ok(Some(p));
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Ok(Some(local));
    }

    Ok(user_config_path().filter(|p| p.is_file()))
}

pub fn resolve_config(cli: &Cli) -> Result<ObfuscatorConfig> {
    match resolve_config_path(cli)? {
        Some(path) => ObfuscatorConfig::load(&path),
        None => Ok(ObfuscatorConfig::default()),
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("jar-obfuscator").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config: ObfuscatorConfig = toml::from_str("").unwrap();
        assert_eq!(config, ObfuscatorConfig::default());
        assert_eq!(config.flow.dead_branches, 3);
        assert_eq!(config.anti_debug.marker, "-agentlib:jdwp");
        assert!(!config.any_pass_enabled());
    }

    #[test]
    fn sections_are_read() {
        let config: ObfuscatorConfig = toml::from_str(
            r#"
seed = 42
runtime_package = "com/acme/rt"

[rename]
enabled = true
keep = ["com.acme.api."]

[flow]
enabled = true
dead_branches = 5

[binding]
expected_dir = "/opt/app"
"#,
        )
        .unwrap();
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.runtime_package, "com/acme/rt");
        assert_eq!(config.rename.prefix, "C");
        assert_eq!(config.rename.keep, ["com.acme.api."]);
        assert_eq!(config.flow.dead_branches, 5);
        assert!(config.binding.enabled());
        assert!(!config.strings.enabled);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<ObfuscatorConfig>("[rename]\nenable = true\n").is_err());
    }

    #[test]
    fn flags_override_the_file() {
        let mut config = ObfuscatorConfig::default();
        config.flow.dead_branches = 8;
        config.rename.keep = vec!["a.".into()];
        let args = ObfuscateArgs {
            all: true,
            password: Some(None),
            dead_branches: Some(1),
            keep: vec!["b.".into()],
            seed: Some(7),
            ..Default::default()
        };
        config.apply_args(&args);
        assert!(config.rename.enabled && config.strings.enabled && config.flow.enabled);
        assert!(config.anti_debug.enabled);
        assert!(config.password.enabled);
        assert_eq!(config.password.password, None);
        assert_eq!(config.flow.dead_branches, 1);
        assert_eq!(config.rename.keep, ["a.", "b."]);
        assert_eq!(config.seed, Some(7));
        assert!(!config.binding.enabled());
    }

    #[test]
    fn explicit_config_must_exist() -> Result<()> {
        let dir = temp_path("jar-obfuscator-config");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("obf.toml");
        std::fs::write(&path, "[strings]\nenabled = true\n")?;

        let cli = Cli {
            command: crate::cli::Commands::Inspect {
                jar: PathBuf::from("app.jar"),
                format: crate::cli::OutputFormat::Json,
            },
            config: Some(path.clone()),
        };
        assert_eq!(resolve_config_path(&cli)?, Some(path.clone()));
        assert!(resolve_config(&cli)?.strings.enabled);

        let missing = Cli {
            config: Some(dir.join("missing.toml")),
            ..cli
        };
        assert!(resolve_config_path(&missing).is_err());
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}
