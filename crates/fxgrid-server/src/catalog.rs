//! Known-plugin catalog and plugin scanning.
//!
//! Scanning turns candidate ids (bundle paths, built-in ids) into
//! [`PluginDescription`]s. With isolation enabled every candidate is described
//! by a throwaway child process, so a plugin that crashes while being
//! inspected only loses its own registration. Candidates that keep failing are
//! excluded from later scans.

use crate::builtin::BuiltinScanner;
use crate::config::ServerConfig;
use fxgrid_protocol::{GridError, PluginDescription, PluginFormat, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

/// Everything learned from scanning, optionally persisted as one JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginCatalog {
    known: Vec<PluginDescription>,
    excluded: BTreeSet<String>,
    failures: HashMap<String, u32>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path`; a missing file gives an empty catalog bound to `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut catalog = if path.exists() {
            let json = std::fs::read_to_string(path)?;
            serde_json::from_str::<PluginCatalog>(&json)?
        } else {
            Self::default()
        };
        catalog.path = Some(path.to_path_buf());
        Ok(catalog)
    }

    /// Writes the catalog to its file, if it has one.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn known(&self) -> &[PluginDescription] {
        &self.known
    }

    pub fn excluded(&self) -> impl Iterator<Item = &str> {
        self.excluded.iter().map(String::as_str)
    }

    /// True if a known plugin was scanned from `id`.
    pub fn is_known(&self, id: &str) -> bool {
        self.known.iter().any(|d| d.file_or_identifier == id)
    }

    pub fn find(&self, id: &str) -> Option<&PluginDescription> {
        self.known.iter().find(|d| d.file_or_identifier == id)
    }

    pub fn is_excluded(&self, id: &str) -> bool {
        self.excluded.contains(id)
    }

    pub fn failures(&self, id: &str) -> u32 {
        self.failures.get(id).copied().unwrap_or(0)
    }

    /// Adds or replaces descriptions, unique by identity.
    pub fn add_known(&mut self, descs: Vec<PluginDescription>) {
        for desc in descs {
            match self.known.iter_mut().find(|d| d.is_duplicate_of(&desc)) {
                Some(existing) => *existing = desc,
                None => self.known.push(desc),
            }
        }
    }

    pub fn record_success(&mut self, id: &str) {
        self.failures.remove(id);
    }

    /// Counts a failed scan. Returns true once `id` is excluded.
    pub fn record_failure(&mut self, id: &str, threshold: u32) -> bool {
        let count = self.failures.entry(id.to_string()).or_insert(0);
        *count += 1;
        if *count >= threshold.max(1) {
            self.excluded.insert(id.to_string());
        }
        self.excluded.contains(id)
    }

    pub fn exclude(&mut self, id: &str) {
        self.excluded.insert(id.to_string());
    }

    /// Gives an excluded candidate another chance.
    pub fn include(&mut self, id: &str) {
        self.excluded.remove(id);
        self.failures.remove(id);
    }
}

/// Discovers and describes the plugins of one format.
pub trait FormatScanner: Send + Sync {
    fn format(&self) -> PluginFormat;

    /// Candidate ids available under `config`.
    fn search(&self, config: &ServerConfig) -> Vec<String>;

    /// Describes every plugin behind `id`; shells may hold several.
    fn describe(&self, id: &str) -> Result<Vec<PluginDescription>>;
}

/// Finds plugin bundles in the configured and standard folders.
///
/// Describing a bundle needs the hosting engine; without one the description
/// carries the bundle name and path.
#[derive(Debug, Clone)]
pub struct FolderScanner {
    format: PluginFormat,
}

impl FolderScanner {
    pub fn new(format: PluginFormat) -> Self {
        Self { format }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self.format {
            PluginFormat::Vst3 => &["vst3"],
            PluginFormat::Vst2 => &["vst", "dll", "so"],
            PluginFormat::AudioUnit => &["component"],
            PluginFormat::Builtin => &[],
        }
    }

    fn is_plugin_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map(|ext| self.extensions().contains(&ext))
            .unwrap_or(false)
    }

    pub fn folders(&self, config: &ServerConfig) -> Vec<PathBuf> {
        let mut folders = match self.format {
            PluginFormat::Vst3 => config.vst3_folders.clone(),
            PluginFormat::Vst2 => config.vst2_folders.clone(),
            _ => Vec::new(),
        };
        let skip_standard = config.vst_no_standard_folders
            && matches!(self.format, PluginFormat::Vst3 | PluginFormat::Vst2);
        if !skip_standard {
            folders.extend(standard_folders(self.format));
        }
        folders
    }

    fn collect(&self, dir: &Path, found: &mut Vec<String>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if self.is_plugin_file(&path) {
                found.push(path.to_string_lossy().into_owned());
            } else if path.is_dir() {
                self.collect(&path, found);
            }
        }
    }
}

impl FormatScanner for FolderScanner {
    fn format(&self) -> PluginFormat {
        self.format
    }

    fn search(&self, config: &ServerConfig) -> Vec<String> {
        let mut found = Vec::new();
        for folder in self.folders(config) {
            if folder.is_dir() {
                self.collect(&folder, &mut found);
            }
        }
        found.sort();
        found.dedup();
        found
    }

    fn describe(&self, id: &str) -> Result<Vec<PluginDescription>> {
        let path = Path::new(id);
        if !self.is_plugin_file(path) || !path.exists() {
            return Err(GridError::ScanFailed {
                id: id.to_string(),
                reason: format!("not a {} bundle", self.format),
            });
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(id)
            .to_string();
        Ok(vec![PluginDescription::new(name, self.format, id)])
    }
}

fn home() -> String {
    std::env::var("HOME").unwrap_or_default()
}

fn standard_folders(format: PluginFormat) -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        let sub = match format {
            PluginFormat::Vst3 => "VST3",
            PluginFormat::Vst2 => "VST",
            PluginFormat::AudioUnit => "Components",
            PluginFormat::Builtin => return Vec::new(),
        };
        vec![
            PathBuf::from(format!("/Library/Audio/Plug-Ins/{}", sub)),
            PathBuf::from(format!("{}/Library/Audio/Plug-Ins/{}", home(), sub)),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        let _ = home;
        match format {
            PluginFormat::Vst3 => vec![
                PathBuf::from("C:\\Program Files\\Common Files\\VST3"),
                PathBuf::from("C:\\Program Files (x86)\\Common Files\\VST3"),
            ],
            PluginFormat::Vst2 => vec![
                PathBuf::from("C:\\Program Files\\VstPlugins"),
                PathBuf::from("C:\\Program Files\\Common Files\\VST2"),
                PathBuf::from("C:\\Program Files (x86)\\VstPlugins"),
            ],
            _ => Vec::new(),
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        match format {
            PluginFormat::Vst3 => vec![
                PathBuf::from("/usr/lib/vst3"),
                PathBuf::from("/usr/local/lib/vst3"),
                PathBuf::from(format!("{}/.vst3", home())),
            ],
            PluginFormat::Vst2 => vec![
                PathBuf::from("/usr/lib/vst"),
                PathBuf::from("/usr/local/lib/vst"),
                PathBuf::from(format!("{}/.vst", home())),
            ],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanIsolation {
    InProcess,
    /// Runs `<exe> scan --id <id> --format <format>` per candidate.
    ChildProcess { exe: PathBuf },
}

/// Runs scans and merges their results into the shared catalog.
pub struct PluginScanner {
    scanners: Vec<Arc<dyn FormatScanner>>,
    catalog: Arc<Mutex<PluginCatalog>>,
    config: ServerConfig,
    isolation: ScanIsolation,
}

impl PluginScanner {
    pub fn new(config: ServerConfig, catalog: PluginCatalog) -> Self {
        Self {
            scanners: Vec::new(),
            catalog: Arc::new(Mutex::new(catalog)),
            config,
            isolation: ScanIsolation::InProcess,
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn FormatScanner>) -> Self {
        self.scanners.push(scanner);
        self
    }

    /// Built-in processors plus folder discovery for every plugin format.
    pub fn with_default_scanners(self) -> Self {
        self.with_scanner(Arc::new(BuiltinScanner))
            .with_scanner(Arc::new(FolderScanner::new(PluginFormat::Vst3)))
            .with_scanner(Arc::new(FolderScanner::new(PluginFormat::Vst2)))
            .with_scanner(Arc::new(FolderScanner::new(PluginFormat::AudioUnit)))
    }

    pub fn isolation(mut self, isolation: ScanIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn catalog(&self) -> &Arc<Mutex<PluginCatalog>> {
        &self.catalog
    }

    pub fn known(&self) -> Vec<PluginDescription> {
        self.catalog.lock().known().to_vec()
    }

    fn enabled(&self, format: PluginFormat) -> bool {
        match format {
            PluginFormat::Builtin => true,
            PluginFormat::Vst3 => self.config.enable_vst3,
            PluginFormat::Vst2 => self.config.enable_vst2,
            PluginFormat::AudioUnit => self.config.enable_au,
        }
    }

    fn scanner(&self, format: PluginFormat) -> Option<&Arc<dyn FormatScanner>> {
        self.scanners.iter().find(|s| s.format() == format)
    }

    /// Describes one candidate without touching the catalog.
    pub fn describe(&self, id: &str, format: PluginFormat) -> Result<Vec<PluginDescription>> {
        match &self.isolation {
            ScanIsolation::InProcess => {
                let scanner = self.scanner(format).ok_or_else(|| GridError::ScanFailed {
                    id: id.to_string(),
                    reason: format!("no scanner for {}", format),
                })?;
                scanner.describe(id)
            }
            ScanIsolation::ChildProcess { exe } => describe_in_child(exe, id, format),
        }
    }

    /// Scans one candidate and records the outcome. Excluded candidates are
    /// skipped.
    pub fn scan_plugin(&self, id: &str, format: PluginFormat) -> bool {
        let ok = self.scan_one(id, format);
        self.persist();
        ok
    }

    fn scan_one(&self, id: &str, format: PluginFormat) -> bool {
        if self.catalog.lock().is_excluded(id) {
            tracing::debug!("Skipping excluded plugin {}", id);
            return false;
        }

        match self.describe(id, format) {
            Ok(descs) if !descs.is_empty() => {
                tracing::info!("Scanned {} ({} plugin(s))", id, descs.len());
                let mut catalog = self.catalog.lock();
                catalog.add_known(descs);
                catalog.record_success(id);
                true
            }
            result => {
                let reason = match result {
                    Err(e) => e.to_string(),
                    Ok(_) => "no plugins found".to_string(),
                };
                tracing::warn!("Scan of {} failed: {}", id, reason);
                let threshold = self.config.scan_failure_threshold;
                if self.catalog.lock().record_failure(id, threshold) {
                    tracing::warn!("Excluding {} after repeated scan failures", id);
                }
                false
            }
        }
    }

    fn candidates(&self, include: &[String]) -> Vec<(String, PluginFormat)> {
        let catalog = self.catalog.lock();
        let mut candidates = Vec::new();
        for scanner in &self.scanners {
            let format = scanner.format();
            if !self.enabled(format) {
                continue;
            }
            for id in scanner.search(&self.config) {
                if !include.is_empty() && !include.iter().any(|name| matches_name(&id, name)) {
                    continue;
                }
                if catalog.is_known(&id) || catalog.is_excluded(&id) {
                    continue;
                }
                candidates.push((id, format));
            }
        }
        candidates
    }

    /// Scans every new candidate, restricted to `include` when it is not
    /// empty. Returns how many candidates scanned successfully.
    pub fn scan_for_plugins(&self, include: &[String]) -> usize {
        let candidates = self.candidates(include);
        tracing::info!("Scanning {} plugin candidate(s)", candidates.len());

        let scanned = if self.config.parallel_plugin_load && candidates.len() > 1 {
            let workers = thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .min(candidates.len());
            let per_worker = candidates.len().div_ceil(workers);
            thread::scope(|scope| {
                let handles: Vec<_> = candidates
                    .chunks(per_worker)
                    .map(|chunk| {
                        scope.spawn(move || {
                            chunk
                                .iter()
                                .filter(|(id, format)| self.scan_one(id, *format))
                                .count()
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or(0))
                    .sum()
            })
        } else {
            candidates
                .iter()
                .filter(|(id, format)| self.scan_one(id, *format))
                .count()
        };

        self.persist();
        scanned
    }

    /// True if `name` is known, scanning it first if needed.
    pub fn ensure_known(&self, name: &str) -> bool {
        {
            let catalog = self.catalog.lock();
            if catalog
                .known()
                .iter()
                .any(|d| matches_name(&d.file_or_identifier, name) || d.name == name)
            {
                return true;
            }
        }
        let candidate = self
            .scanners
            .iter()
            .filter(|s| self.enabled(s.format()))
            .find_map(|s| {
                s.search(&self.config)
                    .into_iter()
                    .find(|id| matches_name(id, name))
                    .map(|id| (id, s.format()))
            });
        match candidate {
            Some((id, format)) => self.scan_one(&id, format),
            None => {
                tracing::warn!("No plugin candidate named {}", name);
                false
            }
        }
    }

    pub fn persist(&self) {
        if let Err(e) = self.catalog.lock().save() {
            tracing::error!("Failed to save plugin catalog: {}", e);
        }
    }
}

/// A candidate matches by full id or by bundle name.
fn matches_name(id: &str, name: &str) -> bool {
    id == name
        || Path::new(id)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| stem == name)
            .unwrap_or(false)
}

fn describe_in_child(exe: &Path, id: &str, format: PluginFormat) -> Result<Vec<PluginDescription>> {
    let output = Command::new(exe)
        .args(["scan", "--id", id, "--format", format.name()])
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| GridError::ScanFailed {
            id: id.to_string(),
            reason: format!("failed to start scan process: {}", e),
        })?;

    if !output.status.success() {
        tracing::error!("Scan process for {} exited with {}", id, output.status);
        return Err(GridError::ScanFailed {
            id: id.to_string(),
            reason: format!("scan process exited with {}", output.status),
        });
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}
