use std::fs;
use std::path::{Path, PathBuf};

use crate::RegistryError;

/// File extension of addins manifests.
pub const ADDINS_EXTENSION: &str = "addins";

/// One meaningful line of an addins manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddinsEntry {
    /// The path text, backslashes already normalized to forward slashes.
    pub pattern: String,
}

impl AddinsEntry {
    /// Trailing `/` means directory-scan semantics.
    pub fn is_directory(&self) -> bool {
        self.pattern.ends_with('/')
    }

    pub fn is_wildcard(&self) -> bool {
        self.pattern.contains('*') || self.pattern.contains('?')
    }
}

/// Parses manifest text: one entry per line, `#` starts a comment that
/// runs to end-of-line, blank lines are ignored, backslashes normalize to
/// forward slashes.
pub fn parse_addins(text: &str) -> Vec<AddinsEntry> {
    text.lines()
        .map(|line| {
            let line = match line.split_once('#') {
                Some((before_comment, _)) => before_comment,
                None => line,
            };
            line.trim()
        })
        .filter(|line| !line.is_empty())
        .map(|line| AddinsEntry {
            pattern: line.replace('\\', "/"),
        })
        .collect()
}

pub fn read_addins(path: &Path) -> Result<Vec<AddinsEntry>, RegistryError> {
    let text = fs::read_to_string(path).map_err(|source| RegistryError::ExtensionLoad {
        path: path.to_path_buf(),
        reason: source.to_string(),
    })?;
    Ok(parse_addins(&text))
}

/// A filesystem match produced by expanding a manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMatch {
    pub path: PathBuf,
    pub is_directory: bool,
}

/// Expands a manifest entry against `base`. Non-wildcard entries resolve
/// to a single path (whether or not it exists — the caller decides how to
/// report a missing one); wildcard entries resolve to every match on
/// disk. `*` and `?` match within one path component, `**` matches any
/// number of directories.
pub fn expand_entry(base: &Path, entry: &AddinsEntry) -> Vec<EntryMatch> {
    let wants_directory = entry.is_directory();
    let pattern = entry.pattern.trim_end_matches('/');

    if !entry.is_wildcard() {
        return vec![EntryMatch {
            path: base.join(pattern),
            is_directory: wants_directory,
        }];
    }

    let components: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
    let mut matches = Vec::new();
    walk_pattern(base, &components, wants_directory, &mut matches);
    matches.sort_by(|a, b| a.path.cmp(&b.path));
    matches.dedup();
    matches
}

fn walk_pattern(dir: &Path, components: &[&str], wants_directory: bool, into: &mut Vec<EntryMatch>) {
    let Some((component, rest)) = components.split_first() else {
        return;
    };

    if *component == "**" {
        // `**` may match zero directories...
        walk_pattern(dir, rest, wants_directory, into);
        // ...or descend one level and stay greedy.
        for child in read_dir_sorted(dir) {
            if child.is_dir() {
                walk_pattern(&child, components, wants_directory, into);
            }
        }
        return;
    }

    let is_last = rest.is_empty();
    for child in read_dir_sorted(dir) {
        let Some(name) = child.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !match_component(name, component) {
            continue;
        }
        if is_last {
            if child.is_dir() == wants_directory {
                into.push(EntryMatch {
                    path: child,
                    is_directory: wants_directory,
                });
            }
        } else if child.is_dir() {
            walk_pattern(&child, rest, wants_directory, into);
        }
    }
}

fn read_dir_sorted(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths
}

/// Matches one path component against a pattern with `*` and `?`.
fn match_component(name: &str, pattern: &str) -> bool {
    fn matches(name: &[u8], pattern: &[u8]) -> bool {
        match (pattern.split_first(), name.split_first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some((b'*', rest_pattern)), _) => {
                matches(name, rest_pattern)
                    || !name.is_empty() && matches(&name[1..], pattern)
            }
            (Some((b'?', rest_pattern)), Some((_, rest_name))) => {
                matches(rest_name, rest_pattern)
            }
            (Some((expected, rest_pattern)), Some((actual, rest_name))) => {
                expected == actual && matches(rest_name, rest_pattern)
            }
            (Some(_), None) => false,
        }
    }
    matches(name.as_bytes(), pattern.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let entries = parse_addins(
            "# leading comment\n\nplugins/   # trailing comment\nvendor\\tools\\runner.gimg\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pattern, "plugins/");
        assert!(entries[0].is_directory());
        assert_eq!(entries[1].pattern, "vendor/tools/runner.gimg");
        assert!(!entries[1].is_directory());
        assert!(!entries[1].is_wildcard());
    }

    #[test]
    fn wildcard_detection() {
        let entries = parse_addins("addins/*.gimg\nexact.gimg\nnested/**/deep.gimg\n");
        assert!(entries[0].is_wildcard());
        assert!(!entries[1].is_wildcard());
        assert!(entries[2].is_wildcard());
    }

    #[test]
    fn component_matching() {
        assert!(match_component("runner.gimg", "*.gimg"));
        assert!(match_component("runner.gimg", "run*"));
        assert!(match_component("runner.gimg", "r?nner.gimg"));
        assert!(!match_component("runner.txt", "*.gimg"));
        assert!(match_component("anything", "*"));
        assert!(!match_component("", "?"));
    }

    #[test]
    fn non_wildcard_entry_resolves_to_a_single_path() {
        let base = Path::new("/host");
        let entry = AddinsEntry {
            pattern: "plugins/runner.gimg".to_owned(),
        };
        let matches = expand_entry(base, &entry);
        assert_eq!(
            matches,
            vec![EntryMatch {
                path: PathBuf::from("/host/plugins/runner.gimg"),
                is_directory: false,
            }]
        );
    }

    #[test]
    fn wildcard_entry_expands_against_the_filesystem() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let base = dir.path();
        std::fs::create_dir(base.join("plugins")).expect("dir should create");
        std::fs::write(base.join("plugins/a.gimg"), b"").expect("file should write");
        std::fs::write(base.join("plugins/b.gimg"), b"").expect("file should write");
        std::fs::write(base.join("plugins/readme.txt"), b"").expect("file should write");

        let entry = AddinsEntry {
            pattern: "plugins/*.gimg".to_owned(),
        };
        let matches = expand_entry(base, &entry);
        let names: Vec<_> = matches
            .iter()
            .filter_map(|m| m.path.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, ["a.gimg", "b.gimg"]);
    }

    #[test]
    fn double_star_descends_recursively() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let base = dir.path();
        std::fs::create_dir_all(base.join("a/b/c")).expect("dirs should create");
        std::fs::write(base.join("top.gimg"), b"").expect("file should write");
        std::fs::write(base.join("a/b/mid.gimg"), b"").expect("file should write");
        std::fs::write(base.join("a/b/c/deep.gimg"), b"").expect("file should write");

        let entry = AddinsEntry {
            pattern: "**/*.gimg".to_owned(),
        };
        let matches = expand_entry(base, &entry);
        let names: Vec<_> = matches
            .iter()
            .filter_map(|m| m.path.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, ["deep.gimg", "mid.gimg", "top.gimg"]);
    }

    #[test]
    fn directory_wildcard_matches_directories_only() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let base = dir.path();
        std::fs::create_dir(base.join("ext-one")).expect("dir should create");
        std::fs::create_dir(base.join("ext-two")).expect("dir should create");
        std::fs::write(base.join("ext-file"), b"").expect("file should write");

        let entry = AddinsEntry {
            pattern: "ext-*/".to_owned(),
        };
        let matches = expand_entry(base, &entry);
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.is_directory));
    }
}
