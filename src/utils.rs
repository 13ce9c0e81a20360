//! Utility functions

use crate::error::{JavacError, Result};
use std::{
    fs,
    path::{Component, Path, PathBuf},
    time::UNIX_EPOCH,
};

/// Maximum directory depth a source walk will descend to.
///
/// Symlink cycles are otherwise unbounded since the walker follows links.
pub const MAX_WALK_DEPTH: usize = 64;

/// Resolves the path through the filesystem into the form used to key files everywhere in the
/// driver: symlinks resolved, no `\\?\` prefix on Windows, `/` separators only.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let resolved = dunce::canonicalize(path).map_err(|err| JavacError::io(err, path))?;
    Ok(slashed(resolved))
}

/// Like [`canonicalize`], but a path that fails to resolve (typically because it does not
/// exist yet) is handed back unchanged.
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// The `/`-separated form of a path. A no-op everywhere but Windows.
fn slashed(path: PathBuf) -> PathBuf {
    #[cfg(windows)]
    {
        use path_slash::PathBufExt;
        return PathBuf::from(path.to_slash_lossy().as_ref());
    }
    #[cfg(not(windows))]
    path
}

/// Reads the last modification time of the file in milliseconds since the Unix epoch.
pub fn mtime_millis(path: impl AsRef<Path>) -> Result<i64> {
    let path = path.as_ref();
    let mtime = fs::metadata(path)
        .map_err(|err| JavacError::io(err, path))?
        .modified()
        .map_err(|err| JavacError::io(err, path))?
        .duration_since(UNIX_EPOCH)
        .map_err(JavacError::msg)?
        .as_millis() as i64;
    Ok(mtime)
}

/// Lexically expresses `target` relative to the `base` directory, without touching the
/// filesystem.
///
/// The longest shared component prefix is dropped; every base component beyond it becomes one
/// `..` step. `relativize("/p/src", "/p/src/com/A.java")` is `com/A.java`,
/// `relativize("/p/src", "/p/gen/B.java")` is `../gen/B.java`. Separators come out as `/` on
/// every platform.
pub fn relativize(base: impl AsRef<Path>, target: impl AsRef<Path>) -> PathBuf {
    let base: Vec<Component<'_>> = base.as_ref().components().collect();
    let target: Vec<Component<'_>> = target.as_ref().components().collect();
    let shared = base.iter().zip(&target).take_while(|(b, t)| b == t).count();

    let mut relative = PathBuf::new();
    for _ in shared..base.len() {
        relative.push(Component::ParentDir);
    }
    for component in &target[shared..] {
        relative.push(component);
    }
    slashed(relative)
}

/// Lexically resolves `.` and `..` steps and collapses repeated separators. Purely textual:
/// symlinks are not consulted, so the result can differ from what the filesystem would resolve.
///
/// A `..` only cancels a preceding normal component; leading `..` steps and the root are kept.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}

/// Strips `root` from `source` and returns the relative path, or the path itself when it is not
/// a descendant of `root`.
pub fn strip_prefix<'a>(source: &'a Path, root: &Path) -> &'a Path {
    source.strip_prefix(root).unwrap_or(source)
}

/// Replaces the extension of `relative` and joins it onto `output_root`.
pub fn output_file_for(output_root: &Path, relative: &Path, extension: &str) -> PathBuf {
    let mut out = output_root.join(relative);
    out.set_extension(extension.trim_start_matches('.'));
    out
}

/// Creates the parent directory of the `file` and all its ancestors if it does not exist.
pub fn create_parent_dir_all(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| JavacError::io(err, parent))?;
    }
    Ok(())
}

/// Creates a new named tempdir.
#[cfg(test)]
pub fn tempdir(name: &str) -> Result<tempfile::TempDir> {
    tempfile::Builder::new().prefix(name).tempdir().map_err(|err| JavacError::io(err, name))
}

#[cfg(test)]
pub fn touch(path: &Path) -> std::io::Result<()> {
    match fs::OpenOptions::new().create(true).write(true).truncate(false).open(path) {
        Ok(_) => Ok(()),
        Err(e) => Err(e),
    }
}
