//! Path normalisation for config, certificate and service paths
//!
//! Paths in the config file may use `~` for the home directory and
//! `$GOPATH` for the Go workspace root, which many local services live in.

use std::path::{Component, Path, PathBuf};
use once_cell::sync::Lazy;

const GOPATH_TOKEN: &str = "$GOPATH";

static HOME: Lazy<String> = Lazy::new(|| {
    dirs_next::home_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "~".to_string())
});

static GOPATH: Lazy<String> = Lazy::new(|| match std::env::var("GOPATH") {
    Ok(g) if !g.is_empty() => g,
    _ => format!("{}/go", *HOME),
});

/// Expand `$GOPATH` (every occurrence) and `~` (first occurrence) and
/// strip trailing separators
pub fn expand(path: &str) -> String {
    let path = path.replace(GOPATH_TOKEN, &GOPATH);
    let path = path.trim_end_matches(['/', '\\']);
    path.replacen('~', &HOME, 1)
}

/// Expand tokens and, when `absolute` is set, anchor the result at the
/// current directory
pub fn normalize(path: &str, absolute: bool) -> PathBuf {
    let expanded = PathBuf::from(expand(path));
    if absolute {
        make_absolute(&expanded)
    } else {
        expanded
    }
}

/// Join relative paths onto the current directory and lexically clean
/// `.` and `..` components
pub fn make_absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    clean(&joined)
}

fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_strips_trailing_separators() {
        assert_eq!(expand("/srv/app/"), "/srv/app");
        assert_eq!(expand("/srv/app\\\\"), "/srv/app");
    }

    #[test]
    fn test_expand_home_only_first_tilde() {
        let expanded = expand("~/bin/~tool");
        assert!(expanded.starts_with(HOME.as_str()));
        assert!(expanded.ends_with("/bin/~tool"));
    }

    #[test]
    fn test_expand_gopath() {
        let expanded = expand("$GOPATH/src/app");
        assert_eq!(expanded, format!("{}/src/app", *GOPATH));
        assert!(!expanded.contains(GOPATH_TOKEN));
    }

    #[test]
    fn test_normalize_relative_keeps_relative() {
        assert_eq!(normalize("bin/server/", false), PathBuf::from("bin/server"));
    }

    #[test]
    fn test_normalize_absolute() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(normalize("./conf/../gorexy.json", true), cwd.join("gorexy.json"));
        assert_eq!(normalize("/etc/gorexy.json", true), PathBuf::from("/etc/gorexy.json"));
    }
}
