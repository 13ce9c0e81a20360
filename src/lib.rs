#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{JavacError, JavacIoError, Result};

pub mod cache;
pub mod classfile;
pub mod compilers;
pub mod deps;
pub mod executor;
pub mod filter;
pub mod incremental;
pub mod options;
pub mod overwrite;
pub mod release;
pub mod sources;
pub mod utils;

pub use compilers::{CancelToken, CollectingDiagnostics, Diagnostic, DiagnosticListener, ForkedJavac, JavaCompiler, Location};
pub use deps::{DependencyMap, PathType};
pub use executor::{ProjectKind, ToolExecutor, VersionScanMode};
pub use filter::{PathFilter, PathSelector};
pub use incremental::{IncrementalBuild, IncrementalPolicy, PolicySet};
pub use options::Options;
pub use release::Release;
pub use sources::{SourceDirectory, SourceFile, SourcesForRelease};

use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

/// File name of the incremental build state, placed under the output directory by default.
pub const BUILD_STATE_FILE_NAME: &str = "javac.cache";

/// Paths of the deprecated module-info swap applied around a test compilation.
#[derive(Clone, Debug)]
pub struct ModuleInfoSwapPaths {
    /// The main `module-info.class` the compiler would otherwise see.
    pub main_class: PathBuf,
    /// The test-built `module-info.class` moved into its place.
    pub test_class: PathBuf,
    /// The test `module-info.java`, renamed aside so it is not recompiled unbidden.
    pub test_source: PathBuf,
}

/// The configuration snapshot a build runs from.
///
/// A [`ToolExecutor`] copies everything it needs at construction, so the caller may keep
/// mutating its own `BuildConfig` while a build runs on a background worker.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// The base output directory. Non-base releases nest under
    /// `META-INF/versions[-modular]/<n>` inside it.
    pub output: PathBuf,
    /// All source roots of the build, owned here and shared by reference with every
    /// discovered file.
    pub source_directories: Vec<Arc<SourceDirectory>>,
    /// Already-resolved dependency paths, keyed by the location kind they feed.
    pub dependencies: DependencyMap,
    /// How rebuild detection operates.
    pub incremental: PolicySet,
    /// Grace on mtime comparisons, in milliseconds.
    pub stale_window_ms: i64,
    /// Where the binary build state lives.
    pub cache_path: PathBuf,
    /// Patterns whose files never trigger an incremental rebuild on their own.
    pub incremental_excludes: Vec<String>,
    /// File extensions that make a dependency path relevant for change detection.
    pub dependency_extensions: BTreeSet<String>,
    /// Where to write the `@argsfile` rendering of each compiler invocation; defaults to
    /// `<output>/javac.args`.
    pub debug_args_path: Option<PathBuf>,
    /// When set, compiled module descriptors get their `requires java.* / jdk.*` versions
    /// normalized to this release string.
    pub module_version_target: Option<String>,
    /// Maven-3 compatibility: a module name inferred outside the sources, applied to the
    /// moduleless group.
    pub legacy_module_name: Option<String>,
    /// Output of a previous phase (main classes when compiling tests); the first unit sees it
    /// the same way later releases see earlier ones.
    pub previous_output: Option<PathBuf>,
    /// Where annotation processors write generated sources, if anywhere.
    pub generated_sources_output: Option<PathBuf>,
    /// The release assumed for roots without an explicit one.
    pub default_release: Option<Release>,
    /// Whether to reconstruct previously compiled releases from the output tree.
    pub version_scan: VersionScanMode,
    /// The deprecated module-info swap around a test compilation.
    pub module_info_swap: Option<ModuleInfoSwapPaths>,
}

impl BuildConfig {
    /// Configures a build writing to `output`.
    pub fn builder(output: impl Into<PathBuf>) -> BuildConfigBuilder {
        BuildConfigBuilder::new(output)
    }

    /// Creates the executor for one build over this configuration.
    pub fn executor(&self) -> Result<ToolExecutor> {
        ToolExecutor::new(self)
    }
}

/// Builder for [`BuildConfig`].
#[derive(Debug)]
pub struct BuildConfigBuilder {
    output: PathBuf,
    source_directories: Vec<Arc<SourceDirectory>>,
    dependencies: DependencyMap,
    incremental: PolicySet,
    stale_window_ms: i64,
    cache_path: Option<PathBuf>,
    incremental_excludes: Vec<String>,
    dependency_extensions: BTreeSet<String>,
    debug_args_path: Option<PathBuf>,
    module_version_target: Option<String>,
    legacy_module_name: Option<String>,
    previous_output: Option<PathBuf>,
    generated_sources_output: Option<PathBuf>,
    default_release: Option<Release>,
    version_scan: VersionScanMode,
    module_info_swap: Option<ModuleInfoSwapPaths>,
}

impl BuildConfigBuilder {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            source_directories: Vec::new(),
            dependencies: DependencyMap::new(),
            incremental: PolicySet::standard(),
            stale_window_ms: 0,
            cache_path: None,
            incremental_excludes: Vec::new(),
            dependency_extensions: BTreeSet::from(["class".to_string(), "jar".to_string()]),
            debug_args_path: None,
            module_version_target: None,
            legacy_module_name: None,
            previous_output: None,
            generated_sources_output: None,
            default_release: None,
            version_scan: VersionScanMode::Off,
            module_info_swap: None,
        }
    }

    /// Adds a source root whose outputs go to the build's output directory.
    #[must_use]
    pub fn source_directory(mut self, directory: SourceDirectory) -> Self {
        self.source_directories.push(Arc::new(directory));
        self
    }

    /// Adds a source root built from just a path, with defaults for everything else.
    #[must_use]
    pub fn sources(self, root: impl Into<PathBuf>) -> Self {
        let output = self.output.clone();
        self.source_directory(SourceDirectory::new(root, output))
    }

    #[must_use]
    pub fn dependencies(mut self, dependencies: DependencyMap) -> Self {
        self.dependencies = dependencies;
        self
    }

    #[must_use]
    pub fn incremental(mut self, policy: PolicySet) -> Self {
        self.incremental = policy;
        self
    }

    #[must_use]
    pub fn stale_window_ms(mut self, window: i64) -> Self {
        self.stale_window_ms = window;
        self
    }

    #[must_use]
    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn incremental_excludes(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.incremental_excludes = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn debug_args_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_args_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn module_version_target(mut self, release: impl Into<String>) -> Self {
        self.module_version_target = Some(release.into());
        self
    }

    #[must_use]
    pub fn legacy_module_name(mut self, module: impl Into<String>) -> Self {
        self.legacy_module_name = Some(module.into());
        self
    }

    #[must_use]
    pub fn previous_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.previous_output = Some(output.into());
        self
    }

    #[must_use]
    pub fn generated_sources_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.generated_sources_output = Some(output.into());
        self
    }

    #[must_use]
    pub fn default_release(mut self, release: Release) -> Self {
        self.default_release = Some(release);
        self
    }

    #[must_use]
    pub fn version_scan(mut self, mode: VersionScanMode) -> Self {
        self.version_scan = mode;
        self
    }

    #[must_use]
    pub fn module_info_swap(mut self, swap: ModuleInfoSwapPaths) -> Self {
        self.module_info_swap = Some(swap);
        self
    }

    pub fn build(self) -> BuildConfig {
        let cache_path = self.cache_path.unwrap_or_else(|| self.output.join(BUILD_STATE_FILE_NAME));
        BuildConfig {
            output: self.output,
            source_directories: self.source_directories,
            dependencies: self.dependencies,
            incremental: self.incremental,
            stale_window_ms: self.stale_window_ms,
            cache_path,
            incremental_excludes: self.incremental_excludes,
            dependency_extensions: self.dependency_extensions,
            debug_args_path: self.debug_args_path,
            module_version_target: self.module_version_target,
            legacy_module_name: self.legacy_module_name,
            previous_output: self.previous_output,
            generated_sources_output: self.generated_sources_output,
            default_release: self.default_release,
            version_scan: self.version_scan,
            module_info_swap: self.module_info_swap,
        }
    }
}
