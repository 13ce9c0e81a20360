//! Resolved dependency paths, keyed by the kind of compiler location they feed.

use std::{
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
};

/// The kind of a resolved dependency path.
///
/// These are produced by the external dependency resolver; the driver only dispatches them onto
/// compiler locations and prepends earlier-release outputs where the per-release loop requires
/// it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathType {
    /// Entries destined for `--class-path`.
    Classes,
    /// Entries destined for `--module-path`.
    Modules,
    /// Entries patched into the named module with `--patch-module`.
    PatchModule(String),
    AnnotationProcessorPath,
    AnnotationProcessorModulePath,
    /// Source-path entries for the named module.
    SourcePath(String),
    /// Any other kind the resolver dispatched; carried through untouched.
    Other(String),
}

/// Dependency paths grouped by [`PathType`].
///
/// Values are deques: the per-release compilation loop prepends the previous release's output
/// directory so it shadows resolved dependencies. [`DependencyMap::prepend`] is the only
/// mutation the loop performs besides the patch-module rewrites.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyMap {
    entries: BTreeMap<PathType, VecDeque<PathBuf>>,
}

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends `paths` to the deque under `kind`, creating it if needed.
    pub fn extend(&mut self, kind: PathType, paths: impl IntoIterator<Item = PathBuf>) {
        self.entries.entry(kind).or_default().extend(paths);
    }

    /// Pushes `path` onto the front of the deque under `kind`.
    pub fn prepend(&mut self, kind: PathType, path: PathBuf) {
        self.entries.entry(kind).or_default().push_front(path);
    }

    /// Removes `count` entries from the front of the deque under `kind`.
    ///
    /// Used by the per-release loop to retire source roots it patched into a module once the
    /// compiled output replaces them.
    pub fn drop_front(&mut self, kind: &PathType, count: usize) {
        if let Some(deque) = self.entries.get_mut(kind) {
            for _ in 0..count {
                deque.pop_front();
            }
        }
    }

    pub fn get(&self, kind: &PathType) -> Option<&VecDeque<PathBuf>> {
        self.entries.get(kind)
    }

    /// The paths under `kind` as a slice-friendly vec, empty when the key is absent.
    pub fn paths_of(&self, kind: &PathType) -> Vec<PathBuf> {
        self.entries.get(kind).map(|d| d.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathType, &VecDeque<PathBuf>)> {
        self.entries.iter()
    }

    /// Every path in the map, across all kinds.
    pub fn all_paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.values().flatten().map(PathBuf::as_path)
    }

    /// All `PatchModule` keys currently present.
    pub fn patch_modules(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter_map(|k| match k {
                PathType::PatchModule(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Deep copy taken at the moment a compilation unit is about to compile.
    ///
    /// The snapshot feeds the debug args file and is never mutated afterwards.
    pub fn snapshot(&self) -> DependencyMap {
        self.clone()
    }
}

impl FromIterator<(PathType, Vec<PathBuf>)> for DependencyMap {
    fn from_iter<T: IntoIterator<Item = (PathType, Vec<PathBuf>)>>(iter: T) -> Self {
        let mut map = DependencyMap::new();
        for (kind, paths) in iter {
            map.extend(kind, paths);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_shadows_existing_entries() {
        let mut map = DependencyMap::new();
        map.extend(PathType::Classes, vec![PathBuf::from("/dep/a.jar"), PathBuf::from("/dep/b.jar")]);
        map.prepend(PathType::Classes, PathBuf::from("/out"));
        let classes = map.paths_of(&PathType::Classes);
        assert_eq!(classes[0], PathBuf::from("/out"));
        assert_eq!(classes.len(), 3);
    }

    #[test]
    fn drop_front_retires_prepended_entries() {
        let mut map = DependencyMap::new();
        let key = PathType::PatchModule("m".into());
        map.extend(key.clone(), vec![PathBuf::from("/resolved.jar")]);
        map.prepend(key.clone(), PathBuf::from("/src/m"));
        map.drop_front(&key, 1);
        assert_eq!(map.paths_of(&key), vec![PathBuf::from("/resolved.jar")]);
    }

    #[test]
    fn snapshot_is_independent() {
        let mut map = DependencyMap::new();
        map.extend(PathType::Modules, vec![PathBuf::from("/mods")]);
        let snap = map.snapshot();
        map.prepend(PathType::Modules, PathBuf::from("/out"));
        assert_eq!(snap.paths_of(&PathType::Modules), vec![PathBuf::from("/mods")]);
    }
}
