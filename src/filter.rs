//! Include/exclude pattern matching and the source-root walker.

use crate::{
    error::{JavacError, Result},
    sources::{SourceDirectory, SourceFile},
    utils::{self, MAX_WALK_DEPTH},
};
use cfg_if::cfg_if;
use std::{
    path::{Path, MAIN_SEPARATOR},
    sync::Arc,
};
use walkdir::{DirEntry, WalkDir};

const GLOB_PREFIX: &str = "glob:";
const REGEX_PREFIX: &str = "regex:";

/// Glob matching as the original build tool does it: `*` never crosses a directory boundary,
/// `**` does.
const GLOB_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One compiled include or exclude pattern.
#[derive(Clone, Debug)]
pub enum Matcher {
    Glob(glob::Pattern),
    Regex(regex::Regex),
}

impl Matcher {
    /// Parses a pattern string with an optional `glob:` or `regex:` syntax tag. Untagged
    /// patterns are globs with the Maven-3 `/`-separator compatibility rules applied.
    pub fn parse(pattern: &str) -> Result<Self> {
        if let Some(re) = pattern.strip_prefix(REGEX_PREFIX) {
            // the original tool full-matches regex patterns against the relative path
            let re = regex::Regex::new(&format!("^(?:{re})$"))
                .map_err(|err| JavacError::config(format!("invalid pattern \"{pattern}\": {err}")))?;
            return Ok(Matcher::Regex(re));
        }
        let (glob, translate) = match pattern.strip_prefix(GLOB_PREFIX) {
            Some(glob) => (glob.to_string(), false),
            None => (pattern.to_string(), true),
        };
        let glob = if translate { to_platform_separators(&glob) } else { glob };
        glob::Pattern::new(&glob)
            .map(Matcher::Glob)
            .map_err(|err| JavacError::config(format!("invalid pattern \"{pattern}\": {err}")))
    }

    fn is_match(&self, relative: &Path) -> bool {
        match self {
            Matcher::Glob(pattern) => pattern.matches_path_with(relative, GLOB_OPTIONS),
            Matcher::Regex(re) => re.is_match(&relative.to_string_lossy()),
        }
    }
}

// Maps unescaped `/` to the native separator on platforms that use a different one. A backslash
// escapes the following `/`; whether a backslash itself is escaped follows from the parity of
// the run of backslashes before it.
fn to_platform_separators(pattern: &str) -> String {
    if MAIN_SEPARATOR == '/' {
        return pattern.to_string();
    }
    let mut out = String::with_capacity(pattern.len());
    let mut backslashes = 0usize;
    for c in pattern.chars() {
        match c {
            '\\' => {
                backslashes += 1;
                out.push(c);
            }
            '/' => {
                if backslashes % 2 == 0 {
                    out.push(MAIN_SEPARATOR);
                } else {
                    out.pop();
                    out.push('/');
                }
                backslashes = 0;
            }
            _ => {
                backslashes = 0;
                out.push(c);
            }
        }
    }
    out
}

/// Combined include/exclude matcher for paths relative to one source root.
///
/// Degenerate pattern lists collapse to cheaper forms.
#[derive(Clone, Debug)]
pub enum PathSelector {
    /// Matches every path.
    All,
    /// Matches every file of one extension; the default when a root declares no patterns.
    Extension(String),
    /// Exactly one include glob and no excludes.
    Single(glob::Pattern),
    /// The general case.
    Selectors { includes: Vec<Matcher>, excludes: Vec<Matcher> },
}

impl PathSelector {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        let includes = includes.iter().map(|p| Matcher::parse(p)).collect::<Result<Vec<_>>>()?;
        let excludes = excludes.iter().map(|p| Matcher::parse(p)).collect::<Result<Vec<_>>>()?;

        Ok(match (includes.len(), excludes.len()) {
            (0, 0) => PathSelector::All,
            (1, 0) => match includes.into_iter().next().unwrap() {
                Matcher::Glob(pattern) => PathSelector::Single(pattern),
                matcher @ Matcher::Regex(_) => {
                    PathSelector::Selectors { includes: vec![matcher], excludes }
                }
            },
            _ => PathSelector::Selectors { includes, excludes },
        })
    }

    /// The selector for one source root: its declared patterns, or all files of its source
    /// kind when it declares none.
    pub fn for_source_directory(directory: &SourceDirectory) -> Result<Self> {
        if directory.includes.is_empty() && directory.excludes.is_empty() {
            return Ok(PathSelector::Extension(directory.source_extension.clone()));
        }
        let selector = Self::new(&directory.includes, &directory.excludes)?;
        Ok(match selector {
            // no includes at all still means "any file of the source kind"
            PathSelector::Selectors { includes, excludes } if includes.is_empty() => {
                PathSelector::Selectors {
                    includes: vec![Matcher::Glob(
                        glob::Pattern::new(&format!("**/*.{}", directory.source_extension))
                            .expect("extension glob"),
                    )],
                    excludes,
                }
            }
            other => other,
        })
    }

    /// Does the path, relative to the selector's root, match?
    pub fn is_match(&self, relative: &Path) -> bool {
        match self {
            PathSelector::All => true,
            PathSelector::Extension(ext) => {
                relative.extension().is_some_and(|e| *e == **ext)
            }
            PathSelector::Single(pattern) => pattern.matches_path_with(relative, GLOB_OPTIONS),
            PathSelector::Selectors { includes, excludes } => {
                (includes.is_empty() || includes.iter().any(|m| m.is_match(relative)))
                    && !excludes.iter().any(|m| m.is_match(relative))
            }
        }
    }
}

/// Walks source roots and emits the [`SourceFile`]s that survive filtering.
#[derive(Debug)]
pub struct PathFilter {
    /// Files matching this are walked and compiled, but changes to them never trigger an
    /// incremental rebuild on their own.
    incremental_excludes: Option<PathSelector>,
}

impl PathFilter {
    pub fn new(incremental_excludes: &[String]) -> Result<Self> {
        let incremental_excludes = if incremental_excludes.is_empty() {
            None
        } else {
            Some(PathSelector::new(incremental_excludes, &[])?)
        };
        Ok(Self { incremental_excludes })
    }

    /// Walks one root depth-first, following symlinks, skipping hidden directories.
    ///
    /// Emits a [`SourceFile`] for every regular file passing the root's selector; discovers the
    /// root's `module-info` source on the way.
    pub fn walk(&self, directory: &Arc<SourceDirectory>) -> Result<Vec<SourceFile>> {
        let selector = PathSelector::for_source_directory(directory)?;
        trace!("walking \"{}\" with {selector:?}", directory.root.display());

        let mut files = Vec::new();
        let walker = WalkDir::new(&directory.root)
            .follow_links(true)
            .max_depth(MAX_WALK_DEPTH)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden_dir(e));

        for entry in walker {
            let entry = entry.map_err(|err| {
                let path = err.path().unwrap_or(&directory.root).to_path_buf();
                JavacError::io(err.into(), path)
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            let relative = utils::strip_prefix(path, &directory.root);
            if !selector.is_match(relative) {
                continue;
            }

            if path.file_stem().is_some_and(|s| s == "module-info")
                && path.extension().is_some_and(|e| *e == *directory.source_extension)
            {
                directory.set_module_info(path.to_path_buf());
            }

            let last_modified = utils::mtime_millis(path)?;
            let ignore_modification =
                self.incremental_excludes.as_ref().is_some_and(|s| s.is_match(relative));
            files.push(SourceFile::new(
                Arc::clone(directory),
                path.to_path_buf(),
                last_modified,
                ignore_modification,
            ));
        }

        debug!("found {} sources under \"{}\"", files.len(), directory.root.display());
        Ok(files)
    }
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    if entry.file_name().to_string_lossy().starts_with('.') {
        return true;
    }
    cfg_if! {
        if #[cfg(windows)] {
            use std::os::windows::fs::MetadataExt;
            const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
            entry
                .metadata()
                .map(|m| m.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0)
                .unwrap_or(false)
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{tempdir, touch};
    use std::fs;

    fn selector(includes: &[&str], excludes: &[&str]) -> PathSelector {
        let includes: Vec<_> = includes.iter().map(|s| s.to_string()).collect();
        let excludes: Vec<_> = excludes.iter().map(|s| s.to_string()).collect();
        PathSelector::new(&includes, &excludes).unwrap()
    }

    #[test]
    fn empty_patterns_simplify_to_all() {
        assert!(matches!(selector(&[], &[]), PathSelector::All));
    }

    #[test]
    fn single_glob_simplifies() {
        let s = selector(&["**/*.java"], &[]);
        assert!(matches!(s, PathSelector::Single(_)));
        assert!(s.is_match("com/acme/App.java".as_ref()));
        assert!(!s.is_match("com/acme/App.properties".as_ref()));
    }

    #[test]
    fn star_does_not_cross_directories() {
        let s = selector(&["*.java"], &[]);
        assert!(s.is_match("App.java".as_ref()));
        assert!(!s.is_match("com/App.java".as_ref()));
    }

    #[test]
    fn excludes_win_over_includes() {
        let s = selector(&["**/*.java"], &["**/*Test.java"]);
        assert!(s.is_match("com/App.java".as_ref()));
        assert!(!s.is_match("com/AppTest.java".as_ref()));
    }

    #[test]
    fn regex_patterns_are_anchored() {
        let s = selector(&["regex:.*\\.java"], &[]);
        assert!(s.is_match("com/App.java".as_ref()));
        assert!(!s.is_match("com/App.java.orig".as_ref()));
    }

    #[test]
    fn glob_prefix_is_recognized() {
        let s = selector(&["glob:com/**"], &[]);
        assert!(s.is_match("com/acme/App.java".as_ref()));
        assert!(!s.is_match("org/acme/App.java".as_ref()));
    }

    #[test]
    fn walk_emits_matching_files_and_skips_hidden_dirs() {
        let tmp = tempdir("filter").unwrap();
        fs::create_dir_all(tmp.path().join("com/acme")).unwrap();
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        touch(&tmp.path().join("com/acme/App.java")).unwrap();
        touch(&tmp.path().join("com/acme/notes.txt")).unwrap();
        touch(&tmp.path().join(".git/Hidden.java")).unwrap();

        let dir = Arc::new(SourceDirectory::new(tmp.path(), tmp.path().join("out")));
        let files = PathFilter::new(&[]).unwrap().walk(&dir).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, ["App.java"]);
    }

    #[test]
    fn walk_discovers_module_info_and_flags_incremental_excludes() {
        let tmp = tempdir("filter").unwrap();
        touch(&tmp.path().join("module-info.java")).unwrap();
        touch(&tmp.path().join("Generated.java")).unwrap();

        let dir = Arc::new(SourceDirectory::new(tmp.path(), tmp.path().join("out")));
        let filter = PathFilter::new(&["Generated.java".to_string()]).unwrap();
        let files = filter.walk(&dir).unwrap();

        assert!(dir.module_info().is_some());
        let generated = files.iter().find(|f| f.path.ends_with("Generated.java")).unwrap();
        assert!(generated.ignore_modification);
        let info = files.iter().find(|f| f.is_module_info()).unwrap();
        assert!(!info.ignore_modification);
    }

    #[test]
    fn walked_files_descend_from_root_and_match_selector() {
        let tmp = tempdir("filter").unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        touch(&tmp.path().join("a/b/C.java")).unwrap();
        touch(&tmp.path().join("a/D.java")).unwrap();

        let dir = Arc::new(
            SourceDirectory::new(tmp.path(), tmp.path().join("out"))
                .with_includes(["**/*.java"])
                .with_excludes(["a/D.java"]),
        );
        let selector = PathSelector::for_source_directory(&dir).unwrap();
        let files = PathFilter::new(&[]).unwrap().walk(&dir).unwrap();
        assert_eq!(files.len(), 1);
        for f in &files {
            assert!(f.path.starts_with(&dir.root));
            assert!(selector.is_match(utils::strip_prefix(&f.path, &dir.root)));
        }
    }
}
