//! Drives the compiler across the whole build.
//!
//! The executor owns the compilation plan: it snapshots the configuration, walks the source
//! roots, applies incremental-build filtering, groups what is left into per-release units and
//! invokes the compiler once per release, base release first. One piece of mutable state
//! crosses release iterations: the output directory of the most recently compiled unit, which
//! the next release sees on its class path (classpath projects) or patched into its modules
//! (modular projects).

use crate::{
    classfile,
    compilers::{javac, CancelToken, CollectingDiagnostics, DiagnosticListener, FileManager, JavaCompiler, Location},
    deps::{DependencyMap, PathType},
    error::{JavacError, Result},
    filter::PathFilter,
    incremental::{IncrementalBuild, IncrementalPolicy, Plan},
    options::Options,
    overwrite::ModuleInfoOverwrite,
    release::Release,
    sources::{SourceFile, SourcesForRelease, NO_MODULE},
    utils, BuildConfig,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// Name of the debug args file written next to the outputs.
pub const DEBUG_ARGS_FILE_NAME: &str = "javac.args";

/// Whether a build compiles against a module path or a class path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectKind {
    /// No source root contributes to a module.
    Classpath,
    /// Every source root contributes to a module.
    Modular,
}

/// Compatibility mode for the deprecated workflow where earlier releases were compiled by
/// separate executions and must be rediscovered from the output tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersionScanMode {
    /// Never look at existing version directories.
    #[default]
    Off,
    /// Reconstruct previously compiled releases from `META-INF/versions*`; any ambiguity is a
    /// fatal configuration error.
    Strict,
}

/// The state threaded through the per-release loop, advanced between units.
#[derive(Debug)]
struct CrossReleaseState {
    /// Output directory of the most recently compiled unit. Starts as the previous phase's
    /// output when compiling tests on top of main classes.
    latest_output: Option<PathBuf>,
    /// Per module, how many source-root entries are currently at the front of its patch
    /// deque. They are removed and replaced by compiled outputs on the next iteration.
    modules_with_sources_as_patches: HashMap<String, usize>,
    /// Modules seen in an earlier unit but absent from the current one.
    modules_not_present_in_new_version: BTreeSet<String>,
    /// Every module configured so far in this build.
    configured_modules: BTreeSet<String>,
    /// The module path inherits the base output exactly once.
    module_path_prepended: bool,
}

impl CrossReleaseState {
    fn new(previous_output: Option<PathBuf>) -> Self {
        Self {
            latest_output: previous_output,
            modules_with_sources_as_patches: HashMap::new(),
            modules_not_present_in_new_version: BTreeSet::new(),
            configured_modules: BTreeSet::new(),
            module_path_prepended: false,
        }
    }

    fn advance(&mut self, output: PathBuf) {
        self.latest_output = Some(output);
    }

    /// Ensures the base output is on the module path, once per build.
    fn inherit_module_path(&mut self, dependencies: &mut DependencyMap) {
        if self.module_path_prepended {
            return;
        }
        if let Some(latest) = &self.latest_output {
            dependencies.prepend(PathType::Modules, latest.clone());
            self.module_path_prepended = true;
        }
    }

    /// Rebuilds the patch deque of `module` for the unit about to compile.
    ///
    /// Source roots prepended for the previous release are retired first, then the previous
    /// release's per-module output (when it exists) and this release's source roots are pushed
    /// to the front, so the priority order is: sources of this release, compiled outputs of
    /// earlier releases, resolved patch dependencies.
    fn configure_patches(
        &mut self,
        dependencies: &mut DependencyMap,
        module: &str,
        source_roots: &[PathBuf],
    ) -> Vec<PathBuf> {
        let key = PathType::PatchModule(module.to_string());
        if let Some(stale) = self.modules_with_sources_as_patches.remove(module) {
            dependencies.drop_front(&key, stale);
        }
        if let Some(latest) = &self.latest_output {
            let compiled = latest.join(module);
            if compiled.is_dir() {
                dependencies.prepend(key.clone(), compiled);
            }
        }
        for root in source_roots.iter().rev() {
            dependencies.prepend(key.clone(), root.clone());
        }
        self.modules_with_sources_as_patches.insert(module.to_string(), source_roots.len());
        self.modules_not_present_in_new_version.remove(module);
        self.configured_modules.insert(module.to_string());
        dependencies.paths_of(&key)
    }

    /// A module configured earlier has no sources in the current unit: its patch list is
    /// rewritten to the compiled output of the previous release.
    fn retire(&mut self, dependencies: &mut DependencyMap, module: &str) -> Vec<PathBuf> {
        let key = PathType::PatchModule(module.to_string());
        if let Some(stale) = self.modules_with_sources_as_patches.remove(module) {
            dependencies.drop_front(&key, stale);
        }
        if let Some(latest) = &self.latest_output {
            let compiled = latest.join(module);
            if compiled.is_dir() {
                dependencies.prepend(key, compiled);
            }
        }
        self.modules_not_present_in_new_version.insert(module.to_string());
        dependencies.paths_of(&PathType::PatchModule(module.to_string()))
    }

    /// Modules that must be retired for a unit: configured before, absent now.
    fn absent_modules(&self, unit: &SourcesForRelease) -> Vec<String> {
        let current: BTreeSet<&str> = unit.modules().collect();
        self.configured_modules.iter().filter(|m| !current.contains(m.as_str())).cloned().collect()
    }
}

/// One recorded location configuration, for the debug args file.
type LocationEntry = (Location, Option<String>, Vec<PathBuf>);

/// Orchestrates one build: source discovery, incremental filtering, per-release compilation,
/// state persistence and module-info post-processing.
///
/// The executor snapshots its inputs at construction; mutating the original [`BuildConfig`]
/// afterwards does not affect a running build. No two methods of one executor may run
/// concurrently.
#[derive(Debug)]
pub struct ToolExecutor {
    config: BuildConfig,
    dependencies: DependencyMap,
    sources: Vec<SourceFile>,
    plan: Option<Plan>,
    cancel: CancelToken,
}

impl ToolExecutor {
    /// Snapshots the configuration and walks every source root.
    pub fn new(config: &BuildConfig) -> Result<Self> {
        let config = config.clone();
        let filter = PathFilter::new(&config.incremental_excludes)?;
        let mut sources = Vec::new();
        for directory in &config.source_directories {
            sources.extend(filter.walk(directory)?);
        }
        debug!("discovered {} sources across {} roots", sources.len(), config.source_directories.len());
        Ok(Self {
            dependencies: config.dependencies.clone(),
            config,
            sources,
            plan: None,
            cancel: CancelToken::new(),
        })
    }

    /// The discovered sources, after [`apply_incremental_build`](Self::apply_incremental_build)
    /// with their rebuild marks applied.
    pub fn sources(&self) -> &[SourceFile] {
        &self.sources
    }

    /// A token that cancels a running forked compilation when triggered from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn incremental_engine(&self) -> IncrementalBuild {
        let mut engine = IncrementalBuild::new(self.config.cache_path.clone(), self.config.incremental.clone());
        engine.stale_window_ms = self.config.stale_window_ms;
        engine.dependency_extensions = self.config.dependency_extensions.clone();
        engine
    }

    /// Decides what needs recompiling. Returns whether a compilation should run at all.
    pub fn apply_incremental_build(&mut self, options: &Options) -> Result<bool> {
        if self.sources.is_empty() {
            info!("No sources to compile");
            return Ok(false);
        }
        let engine = self.incremental_engine();
        let plan = engine.plan(&mut self.sources, &self.dependencies, options.fingerprint())?;
        let should_compile = plan.should_compile;
        if !should_compile {
            info!("Nothing to compile — all classes are up to date.");
        }
        self.plan = Some(plan);
        Ok(should_compile)
    }

    /// Compiles everything the incremental plan marked, one unit per release, base first.
    ///
    /// Returns `Ok(true)` on success; a unit the compiler rejects surfaces as
    /// [`JavacError::CompilationFailed`] carrying the first reported error. The debug args
    /// file is flushed before every compiler invocation, so a failed build is reproducible
    /// from a shell.
    pub fn compile<C: JavaCompiler>(
        &mut self,
        compiler: &C,
        options: &Options,
        aux: &mut dyn Write,
    ) -> Result<bool> {
        if self.plan.is_none() {
            // direct compile without an incremental pass recompiles everything
            for source in &mut self.sources {
                source.new_or_modified = true;
            }
        }
        let to_compile: Vec<SourceFile> =
            self.sources.iter().filter(|s| s.new_or_modified).cloned().collect();
        if to_compile.is_empty() {
            return Ok(true);
        }

        let kind = self.project_kind()?;
        let mut units = SourcesForRelease::group(&to_compile)?;
        self.apply_legacy_module_name(&mut units)?;
        trace!(?kind, units = units.len(), "compilation plan ready");

        // the swap is scoped to the last unit so it survives until the whole build tears down
        if let Some(swap) = &self.config.module_info_swap {
            let overwrite =
                ModuleInfoOverwrite::apply(&swap.main_class, &swap.test_class, &swap.test_source)?;
            if let Some(last) = units.last_mut() {
                last.overwrite = Some(overwrite);
            }
        }

        let mut state = CrossReleaseState::new(self.config.previous_output.clone());
        if self.config.version_scan == VersionScanMode::Strict {
            for (release, directory) in scan_existing_versions(&self.config.output)? {
                debug!("reusing existing outputs of release {release} at \"{}\"", directory.display());
                match kind {
                    ProjectKind::Classpath => self.dependencies.prepend(PathType::Classes, directory.clone()),
                    ProjectKind::Modular => self.dependencies.prepend(PathType::Modules, directory.clone()),
                }
                state.advance(directory);
            }
        }

        let diagnostics = CollectingDiagnostics::new();
        let mut file_manager = compiler.file_manager()?;
        let total = units.len();

        for (index, unit) in units.iter_mut().enumerate() {
            let mut recorded: Vec<LocationEntry> = Vec::new();
            self.configure_unit(&mut file_manager, &mut recorded, &mut state, unit, kind, index)?;

            unit.dependency_snapshot = self.dependencies.snapshot();

            let mut unit_options: Vec<String> = options.as_slice().to_vec();
            if let Some(release) = unit.release.or(self.config.default_release) {
                unit_options.push("--release".to_string());
                unit_options.push(release.to_string());
            }

            self.write_debug_args(&recorded, &unit_options, &unit.files)?;

            info!(
                "Compiling {} source file(s){} to {}",
                unit.files.len(),
                unit.release.map(|r| format!(" for release {r}")).unwrap_or_default(),
                unit.output.display()
            );
            let succeeded = compiler.run(
                aux,
                &mut file_manager,
                &diagnostics,
                &unit_options,
                &unit.files,
                &self.cancel,
            )?;

            if !succeeded {
                let (message, location) = match diagnostics.first_error() {
                    Some(first) => (first.message.clone(), first.location()),
                    None => ("the compiler reported an error".to_string(), None),
                };
                let (errors, warnings) = diagnostics.counts();
                diagnostics.summary(errors, warnings);
                return Err(JavacError::CompilationFailed { message, location });
            }

            state.advance(unit.output.clone());
            if index + 1 == total {
                let (errors, warnings) = diagnostics.counts();
                diagnostics.summary(errors, warnings);
            }
        }

        self.write_build_state(options)?;
        if let Some(target) = self.config.module_version_target.clone() {
            self.patch_module_descriptors(&units, &target)?;
        }
        Ok(true)
    }

    /// Configures every compiler location for one unit and computes its output directory.
    fn configure_unit<FM: FileManager>(
        &mut self,
        file_manager: &mut FM,
        recorded: &mut Vec<LocationEntry>,
        state: &mut CrossReleaseState,
        unit: &mut SourcesForRelease,
        kind: ProjectKind,
        index: usize,
    ) -> Result<()> {
        match kind {
            ProjectKind::Classpath => {
                let roots: Vec<PathBuf> =
                    unit.roots.iter().flat_map(|(_, dirs)| dirs.iter().map(|d| d.root.clone())).collect();
                set_location(file_manager, recorded, Location::SourcePath, None, roots)?;

                if let Some(latest) = state.latest_output.clone() {
                    self.dependencies.prepend(PathType::Classes, latest);
                }
                let class_path = self.dependencies.paths_of(&PathType::Classes);
                if !class_path.is_empty() {
                    set_location(file_manager, recorded, Location::ClassPath, None, class_path)?;
                }
            }
            ProjectKind::Modular => {
                let module_roots: Vec<(String, Vec<PathBuf>)> = unit
                    .roots
                    .iter()
                    .map(|(module, dirs)| (module.clone(), dirs.iter().map(|d| d.root.clone()).collect()))
                    .collect();
                for (module, roots) in &module_roots {
                    set_location(file_manager, recorded, Location::ModuleSourcePath, Some(module.as_str()), roots.clone())?;
                }

                let inherits = state.latest_output.is_some();
                if inherits {
                    state.inherit_module_path(&mut self.dependencies);
                    for (module, roots) in &module_roots {
                        let patches = state.configure_patches(&mut self.dependencies, module, roots);
                        set_location(file_manager, recorded, Location::PatchModulePath, Some(module.as_str()), patches)?;
                    }
                } else {
                    for (module, _) in &module_roots {
                        state.configured_modules.insert(module.clone());
                        let existing = self.dependencies.paths_of(&PathType::PatchModule(module.clone()));
                        if !existing.is_empty() {
                            set_location(file_manager, recorded, Location::PatchModulePath, Some(module.as_str()), existing)?;
                        }
                    }
                }

                for module in state.absent_modules(unit) {
                    set_location(file_manager, recorded, Location::ModuleSourcePath, Some(module.as_str()), Vec::new())?;
                    let patches = state.retire(&mut self.dependencies, &module);
                    set_location(file_manager, recorded, Location::PatchModulePath, Some(module.as_str()), patches)?;
                }

                let module_path = self.dependencies.paths_of(&PathType::Modules);
                if !module_path.is_empty() {
                    set_location(file_manager, recorded, Location::ModulePath, None, module_path)?;
                }
            }
        }

        let output = if index == 0 {
            self.config.output.clone()
        } else {
            let release = unit.release.or(self.config.default_release).unwrap_or(Release::LATEST);
            version_output_dir(&self.config.output, kind, release)
        };
        fs::create_dir_all(&output).map_err(|err| JavacError::io(err, &output))?;
        set_location(file_manager, recorded, Location::ClassOutput, None, vec![output.clone()])?;
        if let Some(generated) = &self.config.generated_sources_output {
            fs::create_dir_all(generated).map_err(|err| JavacError::io(err, generated))?;
            set_location(file_manager, recorded, Location::SourceOutput, None, vec![generated.clone()])?;
        }
        unit.output = output;
        Ok(())
    }

    /// Modular and moduleless roots may not be mixed within one build.
    fn project_kind(&self) -> Result<ProjectKind> {
        let mut modular = BTreeSet::new();
        let mut plain: Vec<&Path> = Vec::new();
        let mut seen: Vec<*const u8> = Vec::new();
        for source in &self.sources {
            let directory = &source.directory;
            let marker = std::sync::Arc::as_ptr(directory) as *const u8;
            if seen.contains(&marker) {
                continue;
            }
            seen.push(marker);
            match directory.module_name()? {
                Some(module) => {
                    modular.insert(module);
                }
                None => plain.push(&directory.root),
            }
        }

        // a legacy inferred module name folds the moduleless group into that module
        if self.config.legacy_module_name.is_some() {
            return Ok(ProjectKind::Modular);
        }

        match (modular.is_empty(), plain.is_empty()) {
            (true, _) => Ok(ProjectKind::Classpath),
            (false, true) => Ok(ProjectKind::Modular),
            (false, false) => Err(JavacError::config(format!(
                "cannot mix modular and non-modular sources: modules {:?} vs plain root \"{}\"",
                modular,
                plain[0].display()
            ))),
        }
    }

    /// Applies the Maven-3 compatibility affordance of a module name inferred outside the
    /// sources: the moduleless group is remapped to that module.
    fn apply_legacy_module_name(&self, units: &mut [SourcesForRelease]) -> Result<()> {
        let Some(legacy) = &self.config.legacy_module_name else { return Ok(()) };
        for unit in units.iter() {
            for module in unit.modules() {
                if module != NO_MODULE && module != legacy {
                    return Err(JavacError::config(format!(
                        "declared module \"{module}\" conflicts with the inferred module name \"{legacy}\""
                    )));
                }
            }
        }
        for unit in units.iter_mut() {
            unit.rename_no_module(legacy);
        }
        Ok(())
    }

    /// Persists the incremental state after a successful build.
    fn write_build_state(&self, options: &Options) -> Result<()> {
        if self.config.incremental.contains(IncrementalPolicy::None) {
            return Ok(());
        }
        let build_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(JavacError::msg)?
            .as_millis() as i64;
        let engine = self.incremental_engine();
        let state = engine.state_after_build(&self.sources, options.fingerprint(), build_time);
        state.write(&self.config.cache_path)
    }

    /// Normalizes the `requires java.* / jdk.*` versions of every compiled module descriptor.
    fn patch_module_descriptors(&self, units: &[SourcesForRelease], target: &str) -> Result<()> {
        for unit in units {
            let mut candidates = vec![unit.output.join("module-info.class")];
            for module in unit.modules() {
                if module != NO_MODULE {
                    candidates.push(unit.output.join(module).join("module-info.class"));
                }
            }
            for candidate in candidates {
                if !candidate.is_file() {
                    continue;
                }
                let bytes = fs::read(&candidate).map_err(|err| JavacError::io(err, &candidate))?;
                if let Some(patched) = classfile::patch_module_info(&bytes, target)? {
                    fs::write(&candidate, patched).map_err(|err| JavacError::io(err, &candidate))?;
                    debug!("rewrote \"{}\"", candidate.display());
                }
            }
        }
        Ok(())
    }

    /// Writes the `@argsfile`-compatible rendering of the upcoming compiler invocation.
    fn write_debug_args(&self, locations: &[LocationEntry], options: &[String], files: &[PathBuf]) -> Result<()> {
        let path = self
            .config
            .debug_args_path
            .clone()
            .unwrap_or_else(|| self.config.output.join(DEBUG_ARGS_FILE_NAME));
        utils::create_parent_dir_all(&path)?;

        let mut content = String::new();
        for (location, module, paths) in locations {
            if paths.is_empty() {
                continue;
            }
            let joined = paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(javac::path_separator());
            let (flag, value) = match (location, module) {
                (Location::SourcePath, _) => ("--source-path", joined),
                (Location::ClassPath, _) => ("--class-path", joined),
                (Location::ModulePath, _) => ("--module-path", joined),
                (Location::ClassOutput, _) => ("-d", joined),
                (Location::SourceOutput, _) => ("-s", joined),
                (Location::ModuleSourcePath, Some(m)) => ("--module-source-path", format!("{m}={joined}")),
                (Location::PatchModulePath, Some(m)) => ("--patch-module", format!("{m}={joined}")),
                (Location::ModuleSourcePath | Location::PatchModulePath, None) => continue,
            };
            content.push_str(flag);
            content.push('\n');
            content.push_str(&javac::quote_argument(&value));
            content.push('\n');
        }
        for option in options {
            content.push_str(&javac::quote_argument(option));
            content.push('\n');
        }
        for file in files {
            content.push_str(&javac::quote_argument(&file.display().to_string()));
            content.push('\n');
        }

        fs::write(&path, content).map_err(|err| JavacError::io(err, &path))?;
        trace!("wrote debug args file \"{}\"", path.display());
        Ok(())
    }
}

/// The output directory of a non-base release.
///
/// Classpath projects use the standard `META-INF/versions/<n>` convention. Modular projects
/// deliberately use `META-INF/versions-modular/<n>/<module>`, signalling to downstream
/// packaging that the classpath convention does not apply.
pub fn version_output_dir(output: &Path, kind: ProjectKind, release: Release) -> PathBuf {
    let versions = match kind {
        ProjectKind::Classpath => "versions",
        ProjectKind::Modular => "versions-modular",
    };
    output.join("META-INF").join(versions).join(release.to_string())
}

/// Scans `META-INF/versions*` under the output directory for releases compiled by earlier
/// executions. Unparsable directory names and releases claimed by both trees are fatal.
fn scan_existing_versions(output: &Path) -> Result<Vec<(Release, PathBuf)>> {
    let mut found: BTreeMap<Release, PathBuf> = BTreeMap::new();
    for versions in ["versions", "versions-modular"] {
        let dir = output.join("META-INF").join(versions);
        if !dir.is_dir() {
            continue;
        }
        let entries = fs::read_dir(&dir).map_err(|err| JavacError::io(err, &dir))?;
        for entry in entries {
            let entry = entry.map_err(|err| JavacError::io(err, &dir))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let release: Release = name.parse().map_err(|_| {
                JavacError::config(format!("unknown release \"{name}\" in output directory scan"))
            })?;
            if found.insert(release, entry.path()).is_some() {
                return Err(JavacError::config(format!(
                    "release {release} is claimed by more than one existing version directory"
                )));
            }
        }
    }
    Ok(found.into_iter().collect())
}

fn set_location<FM: FileManager>(
    file_manager: &mut FM,
    recorded: &mut Vec<LocationEntry>,
    location: Location,
    module: Option<&str>,
    paths: Vec<PathBuf>,
) -> Result<()> {
    match module {
        Some(module) => file_manager.set_location_for_module(location, module, &paths)?,
        None => file_manager.set_location(location, &paths)?,
    }
    recorded.push((location, module.map(str::to_string), paths));
    Ok(())
}
