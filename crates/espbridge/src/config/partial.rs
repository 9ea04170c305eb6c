use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use super::diagnostics::{
    Diagnostic, Error, LoadError, MergeConflictLocation, MergeError, SourceInfo, Warning,
};
use super::LogLevel;
use crate::probe::TransportMode;
use crate::relay::HealthMethod;

type Field<T> = Option<toml::Spanned<T>>;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    #[serde(default)]
    pub imports: Vec<String>,

    pub logging: Option<PartialLoggingConfig>,
    pub relay: Option<PartialRelayConfig>,
    pub probe: Option<PartialProbeConfig>,
    pub client: Option<PartialClientConfig>,

    /// Source information for error reporting (not serialized)
    #[serde(skip)]
    pub source: Option<SourceInfo>,

    /// Where each accepted field came from, keyed by dotted path. Filled in
    /// by `merge` so validation can point at the winning definition.
    #[serde(skip)]
    pub origins: HashMap<String, MergeConflictLocation>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialLoggingConfig {
    pub level: Field<LogLevel>,
    pub overrides: Option<HashMap<String, toml::Spanned<LogLevel>>>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialRelayConfig {
    pub listen: Field<String>,
    pub port: Field<u16>,
    pub forward_timeout_ms: Field<u64>,
    pub preflight: Option<PartialPreflightConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialPreflightConfig {
    pub enabled_for_register: Field<bool>,
    pub enabled_for_control: Field<bool>,
    pub path: Field<String>,
    pub method: Field<HealthMethod>,
    pub timeout_ms: Field<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialProbeConfig {
    pub timeout_ms: Field<u64>,
    pub ladder: Field<Vec<TransportMode>>,
    pub proxy_url: Field<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialClientConfig {
    pub relay_url: Field<String>,
    pub state_file: Field<PathBuf>,
    pub timeout_ms: Field<u64>,
}

/// First-wins bookkeeping shared by every field during a merge.
#[derive(Default)]
struct Merger {
    origins: HashMap<String, MergeConflictLocation>,
    diagnostics: Vec<Diagnostic>,
}

impl Merger {
    /// Record `path` as set in `source`. Returns false, and records a
    /// conflict, if an earlier file already set it.
    fn accept(&mut self, path: &str, span: std::ops::Range<usize>, source: &SourceInfo) -> bool {
        let location = MergeConflictLocation {
            file_path: source.file_path.clone(),
            span,
            content: source.content.clone(),
        };

        match self.origins.get(path) {
            Some(previous) => {
                self.diagnostics.push(Diagnostic::Error(Error::Merge(MergeError {
                    field_path: path.to_string(),
                    message: format!(
                        "'{}' is set in both '{}' and '{}'",
                        path,
                        previous.file_path.display(),
                        location.file_path.display()
                    ),
                    conflicts: vec![previous.clone(), location],
                })));
                false
            }
            None => {
                self.origins.insert(path.to_string(), location);
                true
            }
        }
    }

    fn field<T>(&mut self, path: &str, slot: &mut Field<T>, incoming: Field<T>, source: &SourceInfo) {
        if let Some(value) = incoming {
            if self.accept(path, value.span(), source) {
                *slot = Some(value);
            }
        }
    }
}

impl PartialConfig {
    /// Load a single config file without processing imports
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            error: e,
        })?;

        let mut config: PartialConfig = toml::from_str(&content).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            error: e,
        })?;

        config.source = Some(SourceInfo {
            file_path: path.to_path_buf(),
            content,
        });

        Ok(config)
    }

    /// Load config files with import resolution
    ///
    /// Imports are loaded depth-first before the file that names them, and
    /// relative imports resolve against the importing file's directory.
    pub fn load_with_imports(paths: &[PathBuf]) -> Result<Vec<Self>, LoadError> {
        let mut chain = HashSet::new();
        let mut loaded = HashSet::new();
        let mut all_configs = Vec::new();

        for path in paths {
            Self::load_recursive(path, &mut chain, &mut loaded, &mut all_configs)?;
        }

        Ok(all_configs)
    }

    /// `chain` holds the files on the current import path and detects
    /// cycles. `loaded` holds every file already pushed, so a file imported
    /// from two places is only merged once.
    fn load_recursive(
        path: &Path,
        chain: &mut HashSet<PathBuf>,
        loaded: &mut HashSet<PathBuf>,
        configs: &mut Vec<Self>,
    ) -> Result<(), LoadError> {
        let canonical_path = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());

        if chain.contains(&canonical_path) {
            return Err(LoadError::ImportCycle {
                path: canonical_path,
                cycle: chain.iter().cloned().collect(),
            });
        }
        if loaded.contains(&canonical_path) {
            tracing::debug!("Skipping '{}', already loaded", path.display());
            return Ok(());
        }
        chain.insert(canonical_path.clone());

        let config = Self::from_file(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        for import in &config.imports {
            let import = PathBuf::from(import);
            let resolved = if import.is_absolute() {
                import
            } else {
                base_dir.join(import)
            };
            Self::load_recursive(&resolved, chain, loaded, configs)?;
        }

        configs.push(config);
        chain.remove(&canonical_path);
        loaded.insert(canonical_path);

        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.imports.is_empty()
            && self.logging.is_none()
            && self.relay.is_none()
            && self.probe.is_none()
            && self.client.is_none()
    }

    /// Merge multiple partial configs together
    ///
    /// The first file to set a field wins. Every later definition of the
    /// same field is reported as a merge error, and merging carries on so
    /// that all conflicts are reported at once.
    pub fn merge<I>(configs: I) -> (Self, Vec<Diagnostic>)
    where
        I: IntoIterator<Item = Self>,
    {
        let mut result = PartialConfig::default();
        let mut merger = Merger::default();

        for config in configs {
            let source = config.source.clone().unwrap_or_else(|| SourceInfo {
                file_path: PathBuf::from("<unknown>"),
                content: String::new(),
            });

            if config.is_empty() {
                merger.diagnostics.push(Diagnostic::Warning(Warning::EmptyConfig {
                    file_path: source.file_path.clone(),
                }));
            }
            result.imports.extend(config.imports);

            if let Some(logging) = config.logging {
                let merged = result.logging.get_or_insert_with(Default::default);
                merger.field("logging.level", &mut merged.level, logging.level, &source);

                for (target, level) in logging.overrides.unwrap_or_default() {
                    let path = format!("logging.overrides.{}", target);
                    if merger.accept(&path, level.span(), &source) {
                        merged
                            .overrides
                            .get_or_insert_with(HashMap::new)
                            .insert(target, level);
                    }
                }
            }

            if let Some(relay) = config.relay {
                let merged = result.relay.get_or_insert_with(Default::default);
                merger.field("relay.listen", &mut merged.listen, relay.listen, &source);
                merger.field("relay.port", &mut merged.port, relay.port, &source);
                merger.field(
                    "relay.forward_timeout_ms",
                    &mut merged.forward_timeout_ms,
                    relay.forward_timeout_ms,
                    &source,
                );

                if let Some(preflight) = relay.preflight {
                    let into = merged.preflight.get_or_insert_with(Default::default);
                    merger.field(
                        "relay.preflight.enabled_for_register",
                        &mut into.enabled_for_register,
                        preflight.enabled_for_register,
                        &source,
                    );
                    merger.field(
                        "relay.preflight.enabled_for_control",
                        &mut into.enabled_for_control,
                        preflight.enabled_for_control,
                        &source,
                    );
                    merger.field("relay.preflight.path", &mut into.path, preflight.path, &source);
                    merger.field(
                        "relay.preflight.method",
                        &mut into.method,
                        preflight.method,
                        &source,
                    );
                    merger.field(
                        "relay.preflight.timeout_ms",
                        &mut into.timeout_ms,
                        preflight.timeout_ms,
                        &source,
                    );
                }
            }

            if let Some(probe) = config.probe {
                let merged = result.probe.get_or_insert_with(Default::default);
                merger.field("probe.timeout_ms", &mut merged.timeout_ms, probe.timeout_ms, &source);
                merger.field("probe.ladder", &mut merged.ladder, probe.ladder, &source);
                merger.field("probe.proxy_url", &mut merged.proxy_url, probe.proxy_url, &source);
            }

            if let Some(client) = config.client {
                let merged = result.client.get_or_insert_with(Default::default);
                merger.field("client.relay_url", &mut merged.relay_url, client.relay_url, &source);
                merger.field(
                    "client.state_file",
                    &mut merged.state_file,
                    client.state_file,
                    &source,
                );
                merger.field("client.timeout_ms", &mut merged.timeout_ms, client.timeout_ms, &source);
            }
        }

        result.origins = merger.origins;
        (result, merger.diagnostics)
    }
}
