//! Module cache: which files were loaded, and which files each one pulled in.
//!
//! Loaders record an edge `parent → child` whenever loading `parent` reads
//! `child`. A plugin's dependency set is everything reachable from its main
//! file, stopping at other plugins' main files. Invalidating an entry forces
//! the next load of that file to read it again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// File → recorded children edges.
#[derive(Debug, Default)]
pub struct ModuleCache {
    modules: RwLock<HashMap<PathBuf, Vec<PathBuf>>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `path` as loaded.
    pub fn insert(&self, path: impl Into<PathBuf>) {
        self.modules.write().entry(path.into()).or_default();
    }

    /// Records that loading `parent` read `child`.
    pub fn record(&self, parent: &Path, child: &Path) {
        let mut modules = self.modules.write();
        modules.entry(child.to_path_buf()).or_default();
        let children = modules.entry(parent.to_path_buf()).or_default();
        if !children.iter().any(|c| c == child) {
            children.push(child.to_path_buf());
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.modules.read().contains_key(path)
    }

    /// Direct children of `path`.
    pub fn children(&self, path: &Path) -> Vec<PathBuf> {
        self.modules.read().get(path).cloned().unwrap_or_default()
    }

    /// Every file reachable from `main`, excluding `main` itself and any
    /// file in `boundaries` (and whatever lies only behind them).
    pub fn dependencies_of(&self, main: &Path, boundaries: &HashSet<PathBuf>) -> Vec<PathBuf> {
        let modules = self.modules.read();
        let mut seen: HashSet<&Path> = HashSet::from([main]);
        let mut queue: VecDeque<&Path> = VecDeque::from([main]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(children) = modules.get(current) else {
                continue;
            };
            for child in children {
                if boundaries.contains(child) || !seen.insert(child.as_path()) {
                    continue;
                }
                out.push(child.clone());
                queue.push_back(child.as_path());
            }
        }
        out
    }

    /// Drops the entry for `path` together with its outgoing edges.
    ///
    /// Returns whether an entry existed.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.modules.write().remove(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_transitive_dependencies() {
        let cache = ModuleCache::new();
        cache.record(&p("/a/main"), &p("/a/util"));
        cache.record(&p("/a/util"), &p("/shared/strings"));
        cache.record(&p("/shared/strings"), &p("/a/util"));

        let deps = cache.dependencies_of(&p("/a/main"), &HashSet::new());
        assert_eq!(deps, vec![p("/a/util"), p("/shared/strings")]);
    }

    #[test]
    fn test_other_plugin_mains_are_boundaries() {
        let cache = ModuleCache::new();
        cache.record(&p("/a/main"), &p("/b/main"));
        cache.record(&p("/b/main"), &p("/b/helper"));
        cache.record(&p("/a/main"), &p("/a/helper"));

        let boundaries = HashSet::from([p("/b/main")]);
        let deps = cache.dependencies_of(&p("/a/main"), &boundaries);
        assert_eq!(deps, vec![p("/a/helper")]);
    }

    #[test]
    fn test_invalidate() {
        let cache = ModuleCache::new();
        cache.record(&p("/a/main"), &p("/a/util"));
        assert!(cache.invalidate(&p("/a/main")));
        assert!(!cache.contains(&p("/a/main")));
        assert!(cache.contains(&p("/a/util")));
        assert!(!cache.invalidate(&p("/a/main")));
    }
}
