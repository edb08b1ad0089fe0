//! Path helpers for mount-relative paths.
//!
//! A relative path always starts with `/` (the mount root) and never carries a
//! trailing separator or duplicate separators. Every function that builds a path
//! goes through [`normalize`].

use std::path::{Path, PathBuf};

pub const ROOT: &str = "/";

/// Collapse duplicate separators, strip a trailing separator and anchor at `/`.
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/').filter(|c| !c.is_empty()) {
        out.push('/');
        out.push_str(component);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

pub fn is_root(path: &str) -> bool {
    path == ROOT
}

/// Parent of a normalized path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

/// Last component of a normalized path; `/` for the root.
pub fn file_name(path: &str) -> &str {
    if is_root(path) {
        return ROOT;
    }
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn join(dir: &str, name: &str) -> String {
    normalize(&format!("{}/{}", dir, name))
}

/// Components below the root, in order.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Location of a mount-relative path inside the local cache tree.
pub fn cache_path(cache_root: &Path, relative: &str) -> PathBuf {
    let relative = normalize(relative);
    if is_root(&relative) {
        cache_root.to_path_buf()
    } else {
        cache_root.join(&relative[1..])
    }
}

/// Location of a mount-relative path on the remote host.
pub fn remote_path(remote_root: &str, relative: &str) -> String {
    normalize(&format!("{}/{}", remote_root, relative))
}

/// Inverse of [`cache_path`]: the mount-relative path of a file in the cache tree.
pub fn relative_to_cache(cache_root: &Path, local: &Path) -> Option<String> {
    let rest = local.strip_prefix(cache_root).ok()?;
    Some(normalize(&rest.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("//a//b/"), "/a/b");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/a/b c/"), "/a/b c");
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/"), "/");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(file_name("/"), "/");
        assert_eq!(file_name("/a/b/c"), "c");
        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/a/", "/x"), "/a/x");
        assert_eq!(components("/a/b").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_cache_and_remote_paths() {
        let root = Path::new("/var/cache/snap");
        assert_eq!(cache_path(root, "/"), PathBuf::from("/var/cache/snap"));
        assert_eq!(cache_path(root, "/a//b"), PathBuf::from("/var/cache/snap/a/b"));
        assert_eq!(remote_path("/home/u/", "/a"), "/home/u/a");
        assert_eq!(remote_path("", "/"), "/");
        assert_eq!(
            relative_to_cache(root, Path::new("/var/cache/snap/a/b")).as_deref(),
            Some("/a/b")
        );
        assert_eq!(relative_to_cache(root, root).as_deref(), Some("/"));
        assert_eq!(relative_to_cache(root, Path::new("/tmp/x")), None);
    }
}
