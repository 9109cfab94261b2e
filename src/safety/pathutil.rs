//! Lexical path helpers shared by the layers and the re-validator.
//!
//! Nothing here touches the filesystem except [`nearest_existing_ancestor`].

use std::path::{Component, Path, PathBuf};

/// Collapse `.` and `..` without consulting the filesystem. `..` never climbs
/// above the root or the first normal component of a relative path.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when any segment, split on either separator style, is `..`.
pub fn has_traversal(path: &Path) -> bool {
    path.to_string_lossy()
        .split(['/', '\\'])
        .any(|segment| segment == "..")
}

/// NUL, newline, tab and other control characters.
pub fn control_char(path: &Path) -> Option<char> {
    path.to_string_lossy().chars().find(|c| c.is_control())
}

/// Case-folded, `/`-separated form with any drive letter stripped, so that
/// `C:\Windows\System32` and `/windows/system32` compare equal.
pub fn comparable(path: &Path) -> String {
    comparable_str(&path.to_string_lossy())
}

pub fn comparable_str(raw: &str) -> String {
    let mut s = raw.trim().to_lowercase().replace('\\', "/");
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        s = s[2..].to_string();
    }
    let mut collapsed = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == '/' && collapsed.ends_with('/') {
            continue;
        }
        collapsed.push(ch);
    }
    if collapsed.len() > 1 && collapsed.ends_with('/') {
        collapsed.pop();
    }
    if !collapsed.starts_with('/') {
        collapsed.insert(0, '/');
    }
    collapsed
}

/// Component-wise prefix test on [`comparable`] strings: `/lib` matches
/// `/lib/x.so` but not `/library/x`.
pub fn comparable_starts_with(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Component-wise containment after lexical normalization.
pub fn is_within(path: &Path, base: &Path) -> bool {
    normalize(path).starts_with(normalize(base))
}

/// Walk up from `path` until something exists on disk.
pub fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(p) = current {
        if !p.as_os_str().is_empty() && p.exists() {
            return Some(p.to_path_buf());
        }
        current = p.parent();
    }
    None
}

/// Lowercase extension without the dot.
pub fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .filter(|e| !e.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(
            normalize(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize(Path::new("/../../etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn traversal_detected_in_both_separator_styles() {
        assert!(has_traversal(Path::new("/docs/../../etc/passwd")));
        assert!(has_traversal(Path::new("C:\\Users\\a\\..\\..\\Windows")));
        assert!(!has_traversal(Path::new("/docs/report..final.pdf")));
    }

    #[test]
    fn control_characters_found() {
        assert_eq!(control_char(Path::new("/a/b\0c")), Some('\0'));
        assert_eq!(control_char(Path::new("/a/b\nc")), Some('\n'));
        assert_eq!(control_char(Path::new("/a/b c")), None);
    }

    #[test]
    fn comparable_strips_drive_and_case() {
        assert_eq!(
            comparable_str("C:\\Windows\\System32\\"),
            "/windows/system32"
        );
        assert_eq!(comparable_str("/usr//lib/"), "/usr/lib");
    }

    #[test]
    fn prefix_match_is_component_wise() {
        assert!(comparable_starts_with("/lib/libc.so", "/lib"));
        assert!(comparable_starts_with("/lib", "/lib"));
        assert!(!comparable_starts_with("/library/file", "/lib"));
    }

    #[test]
    fn within_base() {
        assert!(is_within(Path::new("/base/a/b"), Path::new("/base")));
        assert!(!is_within(Path::new("/base/../etc"), Path::new("/base")));
        assert!(!is_within(Path::new("/basement"), Path::new("/base")));
    }

    #[test]
    fn nearest_ancestor_walks_up() {
        let tmp = tempfile::tempdir().unwrap();
        let deep = tmp.path().join("x/y/z.txt");
        assert_eq!(nearest_existing_ancestor(&deep).unwrap(), tmp.path());
    }
}
