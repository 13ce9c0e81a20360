//! Decides what actually needs to be recompiled.

use crate::{
    cache::{CacheLoad, CacheRecord, IncrementalCache},
    deps::DependencyMap,
    error::{JavacError, Result},
    sources::SourceFile,
    utils,
};
use rayon::prelude::*;
use std::{
    collections::BTreeSet,
    fmt, fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// One aspect of how incremental rebuild detection operates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IncrementalPolicy {
    /// Rebuild everything when the option fingerprint changed.
    Options,
    /// Rebuild everything when a dependency is newer than the previous build.
    Dependencies,
    /// Per-file source-tree change detection against the build state file.
    Sources,
    /// Per-file comparison of source mtime against output mtime.
    Classes,
    /// Modifier for [`Sources`](Self::Sources)/[`Classes`](Self::Classes): any added file
    /// forces a full rebuild.
    Additions,
    /// Whole-module granularity; requires a fully modular project without filters.
    Modules,
    /// Incremental detection disabled, every build compiles everything.
    None,
}

impl fmt::Display for IncrementalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IncrementalPolicy::Options => "options",
            IncrementalPolicy::Dependencies => "dependencies",
            IncrementalPolicy::Sources => "sources",
            IncrementalPolicy::Classes => "classes",
            IncrementalPolicy::Additions => "additions",
            IncrementalPolicy::Modules => "modules",
            IncrementalPolicy::None => "none",
        };
        f.write_str(name)
    }
}

/// A validated set of [`IncrementalPolicy`] aspects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicySet(BTreeSet<IncrementalPolicy>);

impl PolicySet {
    /// Validates the aspect combination:
    ///
    /// - the set must not be empty
    /// - `None` excludes every other aspect
    /// - `Modules` excludes `Sources`, `Classes` and `Additions`
    /// - `Additions` only modifies `Sources` or `Classes`
    pub fn new(aspects: impl IntoIterator<Item = IncrementalPolicy>) -> Result<Self> {
        let set: BTreeSet<_> = aspects.into_iter().collect();
        if set.is_empty() {
            return Err(JavacError::config("incremental build policy set is empty"));
        }
        if set.contains(&IncrementalPolicy::None) && set.len() > 1 {
            return Err(JavacError::config("incremental policy \"none\" excludes all other aspects"));
        }
        if set.contains(&IncrementalPolicy::Modules) {
            for conflict in [IncrementalPolicy::Sources, IncrementalPolicy::Classes, IncrementalPolicy::Additions] {
                if set.contains(&conflict) {
                    return Err(JavacError::config(format!(
                        "incremental policy \"modules\" cannot be combined with \"{conflict}\""
                    )));
                }
            }
        }
        if set.contains(&IncrementalPolicy::Additions)
            && !set.contains(&IncrementalPolicy::Sources)
            && !set.contains(&IncrementalPolicy::Classes)
        {
            return Err(JavacError::config(
                "incremental policy \"additions\" is a modifier for \"sources\" or \"classes\"",
            ));
        }
        Ok(Self(set))
    }

    /// The default detection: source tree plus options plus dependencies.
    pub fn standard() -> Self {
        Self(BTreeSet::from([
            IncrementalPolicy::Options,
            IncrementalPolicy::Dependencies,
            IncrementalPolicy::Sources,
        ]))
    }

    pub fn contains(&self, aspect: IncrementalPolicy) -> bool {
        self.0.contains(&aspect)
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::standard()
    }
}

/// The outcome of [`IncrementalBuild::plan`].
#[derive(Debug)]
pub struct Plan {
    /// Whether anything needs compiling at all.
    pub should_compile: bool,
    /// When set, every source recompiles and this is the user-visible cause.
    pub rebuild_cause: Option<String>,
}

/// Change detection against the persisted state of the previous build.
#[derive(Debug)]
pub struct IncrementalBuild {
    /// Where the binary build state lives.
    pub cache_path: PathBuf,
    pub policy: PolicySet,
    /// Grace on mtime comparison, absorbing filesystem timestamp imprecision.
    pub stale_window_ms: i64,
    /// File extensions considered when scanning dependencies for changes.
    pub dependency_extensions: BTreeSet<String>,
    /// Extension of output files, for deleting the outputs of removed sources.
    pub output_extension: String,
}

impl IncrementalBuild {
    pub fn new(cache_path: impl Into<PathBuf>, policy: PolicySet) -> Self {
        Self {
            cache_path: cache_path.into(),
            policy,
            stale_window_ms: 0,
            dependency_extensions: BTreeSet::from(["class".to_string(), "jar".to_string()]),
            output_extension: "class".to_string(),
        }
    }

    /// Computes which of `sources` must recompile, marking them in place.
    ///
    /// A full rebuild marks everything and carries a cause; an up-to-date tree marks nothing.
    /// Outputs orphaned by removed sources are deleted here.
    pub fn plan(
        &self,
        sources: &mut [SourceFile],
        dependencies: &DependencyMap,
        options_fingerprint: u32,
    ) -> Result<Plan> {
        if self.policy.contains(IncrementalPolicy::None) {
            return Ok(self.rebuild_all(sources, "incremental build is disabled"));
        }
        if self.policy.contains(IncrementalPolicy::Modules) {
            self.ensure_modules_applicable(sources)?;
        }

        let prior = match IncrementalCache::load(&self.cache_path) {
            CacheLoad::FirstBuild => {
                return Ok(self.rebuild_all(sources, "no build state file of a previous build"));
            }
            CacheLoad::Corrupt(reason) => {
                return Ok(self
                    .rebuild_all(sources, format!("the build state file could not be read ({reason})")));
            }
            CacheLoad::Loaded(prior) => prior,
        };

        if self.policy.contains(IncrementalPolicy::Options)
            && prior.options_fingerprint != options_fingerprint
        {
            return Ok(self.rebuild_all(sources, "compiler options changed since the previous build"));
        }

        if self.policy.contains(IncrementalPolicy::Dependencies) {
            if let Some(hit) = self.newer_dependency(dependencies, prior.build_time) {
                return Ok(self.rebuild_all(
                    sources,
                    format!("dependency \"{}\" is newer than the previous build", hit.display()),
                ));
            }
        }

        if self.policy.contains(IncrementalPolicy::Sources) || self.policy.contains(IncrementalPolicy::Modules) {
            if let Some(plan) = self.source_tree_check(sources, &prior)? {
                return Ok(plan);
            }
        } else if self.policy.contains(IncrementalPolicy::Classes) {
            self.class_check(sources);
        }

        if self.policy.contains(IncrementalPolicy::Modules) {
            self.widen_to_modules(sources)?;
        }

        let dirty = sources.iter().filter(|s| s.new_or_modified).count();
        trace!(total = sources.len(), dirty, "incremental plan computed");
        Ok(Plan { should_compile: dirty > 0, rebuild_cause: None })
    }

    /// Builds the state to persist after a successful compilation.
    pub fn state_after_build(&self, sources: &[SourceFile], options_fingerprint: u32, build_time: i64) -> IncrementalCache {
        let files = sources
            .iter()
            .map(|s| {
                (
                    s.path.clone(),
                    CacheRecord {
                        source_root: s.directory.root.clone(),
                        output_root: s.directory.output.clone(),
                        explicit_output: None,
                        last_modified: s.last_modified,
                    },
                )
            })
            .collect();
        IncrementalCache { build_time, options_fingerprint, files }
    }

    fn rebuild_all(&self, sources: &mut [SourceFile], cause: impl Into<String>) -> Plan {
        let cause = cause.into();
        info!("Recompiling the module because {cause}");
        for source in sources.iter_mut() {
            source.new_or_modified = true;
        }
        Plan { should_compile: !sources.is_empty(), rebuild_cause: Some(cause) }
    }

    /// `Modules` granularity only applies to a fully modular project without any
    /// include/exclude filters.
    fn ensure_modules_applicable(&self, sources: &[SourceFile]) -> Result<()> {
        for source in sources {
            let dir = &source.directory;
            if dir.module.is_none() && dir.module_info().is_none() {
                return Err(JavacError::config(
                    "the \"modules\" incremental policy requires all sources to be modular",
                ));
            }
            if !dir.includes.is_empty() || !dir.excludes.is_empty() {
                return Err(JavacError::config(
                    "the \"modules\" incremental policy cannot be used with include/exclude filters",
                ));
            }
        }
        Ok(())
    }

    /// Per-file diff of the current tree against the previous build.
    ///
    /// Returns a full-rebuild plan when the whole tree must recompile, `None` when the
    /// per-file marks are the answer.
    fn source_tree_check(&self, sources: &mut [SourceFile], prior: &IncrementalCache) -> Result<Option<Plan>> {
        let mut remaining = prior.files.clone();
        let mut added = 0usize;

        for source in sources.iter_mut() {
            match remaining.remove(&source.path) {
                Some(record) => {
                    if source.ignore_modification {
                        continue;
                    }
                    let drifted = (source.last_modified - record.last_modified).abs() > self.stale_window_ms;
                    let output = record.output_file(&source.path, &source.directory.output_extension);
                    if drifted || !output.exists() {
                        trace!(
                            file = %source.path.display(),
                            drifted,
                            "marking modified source"
                        );
                        source.new_or_modified = true;
                    }
                }
                None => {
                    trace!(file = %source.path.display(), "marking added source");
                    source.new_or_modified = true;
                    added += 1;
                }
            }
        }

        if !remaining.is_empty() {
            for (path, record) in &remaining {
                self.delete_outputs(path, record);
            }
            return Ok(Some(self.rebuild_all(sources, "of added or removed source files")));
        }
        if !sources.is_empty() && sources.iter().all(|s| s.new_or_modified) {
            return Ok(Some(self.rebuild_all(sources, "every source file changed")));
        }
        if self.policy.contains(IncrementalPolicy::Additions) && added > 0 {
            return Ok(Some(self.rebuild_all(sources, "of added source files")));
        }
        Ok(None)
    }

    /// The cheaper per-file mode: compare each source against its own output file.
    fn class_check(&self, sources: &mut [SourceFile]) {
        for source in sources.iter_mut() {
            if source.ignore_modification {
                continue;
            }
            let stale = match utils::mtime_millis(source.output_path()) {
                Ok(output_mtime) => source.last_modified - output_mtime > self.stale_window_ms,
                Err(_) => true,
            };
            if stale {
                source.new_or_modified = true;
            }
        }
    }

    /// Expands per-file marks to whole modules.
    fn widen_to_modules(&self, sources: &mut [SourceFile]) -> Result<()> {
        let mut dirty_modules = BTreeSet::new();
        for source in sources.iter().filter(|s| s.new_or_modified) {
            if let Some(module) = source.directory.module_name()? {
                dirty_modules.insert(module);
            }
        }
        for source in sources.iter_mut() {
            if let Some(module) = source.directory.module_name()? {
                if dirty_modules.contains(&module) {
                    source.new_or_modified = true;
                }
            }
        }
        Ok(())
    }

    /// Deletes the output of a removed source, along with `Foo$Inner.class` style siblings when
    /// the output kind is `.class`.
    fn delete_outputs(&self, source: &Path, record: &CacheRecord) {
        let output = record.output_file(source, &self.output_extension);
        debug!("deleting orphaned output \"{}\"", output.display());
        let _ = fs::remove_file(&output);

        if self.output_extension != "class" {
            return;
        }
        let (Some(parent), Some(stem)) = (output.parent(), output.file_stem()) else { return };
        let prefix = format!("{}$", stem.to_string_lossy());
        let Ok(entries) = fs::read_dir(parent) else { return };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".class") {
                debug!("deleting orphaned nested-class output \"{name}\"");
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// Scans every dependency path for a relevant file at least as new as `since`.
    ///
    /// Paths are scanned in parallel; the first hit wins and forces a full rebuild.
    fn newer_dependency(&self, dependencies: &DependencyMap, since: i64) -> Option<PathBuf> {
        let roots: Vec<PathBuf> = dependencies.all_paths().map(Path::to_path_buf).collect();
        roots.into_par_iter().find_map_any(|root| self.newest_under(&root, since))
    }

    fn newest_under(&self, root: &Path, since: i64) -> Option<PathBuf> {
        WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .find(|e| {
                let relevant = e
                    .path()
                    .extension()
                    .is_some_and(|ext| self.dependency_extensions.contains(&*ext.to_string_lossy()));
                relevant && utils::mtime_millis(e.path()).map(|m| m >= since).unwrap_or(false)
            })
            .map(|e| e.path().to_path_buf())
    }
}
