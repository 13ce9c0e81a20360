//! Source roots, discovered source files and their per-release grouping.

use crate::{
    deps::DependencyMap,
    error::{JavacError, Result},
    overwrite::ModuleInfoOverwrite,
    release::Release,
    utils,
};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The module-name key used for sources that belong to no module.
pub const NO_MODULE: &str = "";

static RE_MODULE_DECLARATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:open\s+)?module\s+([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*)").unwrap());

/// A root directory that sources are walked from.
///
/// The root is read-only for the duration of a build and shared by reference with every
/// [`SourceFile`] it produced.
#[derive(Debug)]
pub struct SourceDirectory {
    /// Absolute, canonical root path.
    pub root: PathBuf,
    /// Module declared for this root, if any.
    pub module: Option<String>,
    /// Target release for this root; `None` means the latest supported release.
    pub release: Option<Release>,
    /// Where this root's outputs go.
    pub output: PathBuf,
    /// Extension of the files this root contributes, without the dot.
    pub source_extension: String,
    /// Extension of the files the compiler produces for this root, without the dot.
    pub output_extension: String,
    /// Include patterns applied relative to `root`; empty means all files of
    /// `source_extension`.
    pub includes: Vec<String>,
    /// Exclude patterns applied relative to `root`.
    pub excludes: Vec<String>,
    /// Set during the walk when a `module-info` source is encountered. Set at most once.
    module_info: OnceCell<PathBuf>,
}

impl SourceDirectory {
    /// Creates a new root. The path is canonicalized; it does not have to exist yet.
    pub fn new(root: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            root: utils::canonicalized(root.into()),
            module: None,
            release: None,
            output: output.into(),
            source_extension: "java".to_string(),
            output_extension: "class".to_string(),
            includes: Vec::new(),
            excludes: Vec::new(),
            module_info: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    #[must_use]
    pub fn with_release(mut self, release: Release) -> Self {
        self.release = Some(release);
        self
    }

    #[must_use]
    pub fn with_includes(mut self, includes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.includes = includes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_excludes(mut self, excludes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.excludes = excludes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_kinds(mut self, source_extension: impl Into<String>, output_extension: impl Into<String>) -> Self {
        self.source_extension = source_extension.into().trim_start_matches('.').to_string();
        self.output_extension = output_extension.into().trim_start_matches('.').to_string();
        self
    }

    /// The `module-info` source found under this root, if the walk discovered one.
    pub fn module_info(&self) -> Option<&Path> {
        self.module_info.get().map(PathBuf::as_path)
    }

    /// Records the `module-info` source discovered during the walk. Later calls are ignored.
    pub(crate) fn set_module_info(&self, path: PathBuf) {
        let _ = self.module_info.set(path);
    }

    /// The name of the module this root contributes to.
    ///
    /// An explicitly declared name wins; otherwise the name is extracted from the discovered
    /// `module-info` source. This is the only parsing ever done on that file.
    pub fn module_name(&self) -> Result<Option<String>> {
        if let Some(name) = &self.module {
            return Ok(Some(name.clone()));
        }
        let Some(info) = self.module_info() else { return Ok(None) };
        let content = fs::read_to_string(info).map_err(|err| JavacError::io(err, info))?;
        let name = RE_MODULE_DECLARATION
            .captures(&content)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                JavacError::config(format!("no module declaration found in {}", info.display()))
            })?;
        Ok(Some(name))
    }
}

/// A source file discovered under a [`SourceDirectory`].
#[derive(Clone, Debug)]
pub struct SourceFile {
    /// The root this file was discovered under. Never owning; all roots outlive their files.
    pub directory: Arc<SourceDirectory>,
    /// Absolute file path.
    pub path: PathBuf,
    /// Last modification time, milliseconds since the Unix epoch.
    pub last_modified: i64,
    /// Whether the incremental engine decided this file needs recompiling.
    pub new_or_modified: bool,
    /// Set when the file matched an incremental-exclude pattern: modifications to it never
    /// trigger a rebuild on their own.
    pub ignore_modification: bool,
    output: OnceCell<PathBuf>,
}

impl SourceFile {
    pub fn new(directory: Arc<SourceDirectory>, path: PathBuf, last_modified: i64, ignore_modification: bool) -> Self {
        Self {
            directory,
            path,
            last_modified,
            new_or_modified: false,
            ignore_modification,
            output: OnceCell::new(),
        }
    }

    /// The inferred output file: the path relative to the root, re-rooted under the root's
    /// output directory with the output extension.
    pub fn output_path(&self) -> &Path {
        self.output.get_or_init(|| {
            let relative = utils::strip_prefix(&self.path, &self.directory.root);
            utils::output_file_for(&self.directory.output, relative, &self.directory.output_extension)
        })
    }

    /// Whether this is the root's `module-info` source.
    pub fn is_module_info(&self) -> bool {
        self.path.file_stem().is_some_and(|s| s == "module-info")
    }
}

impl PartialEq for SourceFile {
    /// Equality is by owning directory and path only; timestamps and marks are ignored.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.directory, &other.directory) && self.path == other.path
    }
}

impl Eq for SourceFile {}

impl fmt::Display for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// All sources sharing one release, grouped by module.
///
/// Built fresh for each compile; the optional module-info swap it carries is released when the
/// unit is dropped.
#[derive(Debug, Default)]
pub struct SourcesForRelease {
    /// The release of this unit; `None` sorts as "latest supported".
    pub release: Option<Release>,
    /// `module name -> source roots`, in source-root discovery order. [`NO_MODULE`] keys the
    /// moduleless group.
    pub roots: Vec<(String, Vec<Arc<SourceDirectory>>)>,
    /// The files of this unit, in walker emission order.
    pub files: Vec<PathBuf>,
    /// Deep copy of the dependency map taken right before this unit compiles.
    pub dependency_snapshot: DependencyMap,
    /// The output directory chosen for this release.
    pub output: PathBuf,
    /// A module-info swap scoped to this unit, released on teardown.
    pub overwrite: Option<ModuleInfoOverwrite>,
}

impl SourcesForRelease {
    fn entry(&mut self, module: &str) -> &mut Vec<Arc<SourceDirectory>> {
        if let Some(pos) = self.roots.iter().position(|(name, _)| name == module) {
            return &mut self.roots[pos].1;
        }
        self.roots.push((module.to_string(), Vec::new()));
        &mut self.roots.last_mut().unwrap().1
    }

    /// The source roots recorded for `module`.
    pub fn roots_of(&self, module: &str) -> &[Arc<SourceDirectory>] {
        self.roots
            .iter()
            .find_map(|(name, roots)| (name == module).then_some(roots.as_slice()))
            .unwrap_or(&[])
    }

    /// Module names of this unit, in discovery order.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.roots.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Renames the moduleless group to `module`, used for the Maven-3 legacy affordance where
    /// the module name is inferred from the package hierarchy.
    pub fn rename_no_module(&mut self, module: &str) {
        for (name, _) in &mut self.roots {
            if name == NO_MODULE {
                *name = module.to_string();
            }
        }
    }

    /// Groups `files` into units ordered by release ascending, with the unset release last.
    ///
    /// Every file lands in the unit of its root's release, under its root's module name (or
    /// [`NO_MODULE`]). Module names are resolved through
    /// [`SourceDirectory::module_name`], so a root whose walk discovered a `module-info`
    /// contributes under that module even without an explicit declaration.
    pub fn group(files: &[SourceFile]) -> Result<Vec<SourcesForRelease>> {
        let mut units: Vec<SourcesForRelease> = Vec::new();

        for file in files {
            let release = file.directory.release;
            let pos = match units.iter().position(|u| u.release == release) {
                Some(pos) => pos,
                None => {
                    units.push(SourcesForRelease { release, ..Default::default() });
                    units.len() - 1
                }
            };
            let unit = &mut units[pos];

            let module = file.directory.module_name()?.unwrap_or_else(|| NO_MODULE.to_string());
            let roots = unit.entry(&module);
            if !roots.iter().any(|d| Arc::ptr_eq(d, &file.directory)) {
                roots.push(Arc::clone(&file.directory));
            }
            unit.files.push(file.path.clone());
        }

        // unset release compiles last, everything else ascending
        units.sort_by_key(|u| match u.release {
            Some(release) => (0, release),
            None => (1, Release::LATEST),
        });
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{tempdir, touch};

    fn file(dir: &Arc<SourceDirectory>, path: &str) -> SourceFile {
        SourceFile::new(Arc::clone(dir), dir.root.join(path), 0, false)
    }

    #[test]
    fn output_path_swaps_extension_under_output_root() {
        let dir = Arc::new(SourceDirectory::new("/project/src", "/project/out"));
        let f = file(&dir, "com/acme/App.java");
        assert_eq!(f.output_path(), dir.output.join("com/acme/App.class"));
    }

    #[test]
    fn equality_ignores_marks() {
        let dir = Arc::new(SourceDirectory::new("/project/src", "/project/out"));
        let a = file(&dir, "A.java");
        let mut b = file(&dir, "A.java");
        b.new_or_modified = true;
        b.last_modified = 42;
        assert_eq!(a, b);
    }

    #[test]
    fn module_info_is_set_at_most_once() {
        let dir = SourceDirectory::new("/project/src", "/project/out");
        dir.set_module_info(PathBuf::from("/project/src/module-info.java"));
        dir.set_module_info(PathBuf::from("/elsewhere/module-info.java"));
        assert_eq!(dir.module_info().unwrap(), Path::new("/project/src/module-info.java"));
    }

    #[test]
    fn extracts_module_name_from_module_info() {
        let tmp = tempdir("sources").unwrap();
        let info = tmp.path().join("module-info.java");
        fs::write(&info, "/* header */\nopen module com.acme.app {\n    requires java.base;\n}\n").unwrap();

        let dir = SourceDirectory::new(tmp.path(), tmp.path().join("out"));
        dir.set_module_info(info);
        assert_eq!(dir.module_name().unwrap().as_deref(), Some("com.acme.app"));
    }

    #[test]
    fn groups_by_release_with_unset_last() {
        let tmp = tempdir("sources").unwrap();
        touch(&tmp.path().join("A.java")).unwrap();

        let base = Arc::new(SourceDirectory::new(tmp.path(), tmp.path().join("out")).with_release(Release::Java17));
        let next = Arc::new(SourceDirectory::new(tmp.path(), tmp.path().join("out")).with_release(Release::Java21));
        let untagged = Arc::new(SourceDirectory::new(tmp.path(), tmp.path().join("out")));

        let files = vec![file(&untagged, "C.java"), file(&next, "B.java"), file(&base, "A.java")];
        let units = SourcesForRelease::group(&files).unwrap();
        let releases: Vec<_> = units.iter().map(|u| u.release).collect();
        assert_eq!(releases, vec![Some(Release::Java17), Some(Release::Java21), None]);
    }
}
