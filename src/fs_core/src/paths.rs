//! Absolute-path string helpers shared by the mirror, the syncer and the
//! VFS adapter. Paths are `/`-separated, rooted at `"/"`, with no trailing
//! slash except for the root itself.

/// Component after the last `/`. Empty for the root.
pub fn last_component(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Path with the last component removed; `"/"` for top-level entries.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Non-empty components of `path`, in order.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// The `create` heuristic: a name with a `.` after its first character is a
/// file, anything else is a directory. Inherently fragile (extension-less
/// files come out as directories, dot-files as directories too); kept for
/// wire compatibility with peers applying the same rule.
pub fn is_file_name(name: &str) -> bool {
    name.chars().skip(1).any(|c| c == '.')
}
