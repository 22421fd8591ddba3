//! Resolve source arguments to JSON files and merge them into one specification.
//!
//! A source is a file, a directory (walked for `*.json`) or a glob pattern.
//! `~` is expanded first. A source that matches nothing is a warning, not an
//! error; a file that fails to parse or validate is an error.

use anyhow::{Context, Result};
use globset::GlobBuilder;
use reconcile::{DuplicatePolicy, Specification};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

const GLOB_CHARS: &[char] = &['*', '?', '[', '{'];

/// One source argument and the files it matched.
#[derive(Debug)]
pub struct ResolvedSource {
    pub source: String,
    pub files: Vec<PathBuf>,
}

/// Everything loaded from the command line sources.
#[derive(Debug)]
pub struct Loaded {
    pub spec: Specification,
    pub sources: Vec<ResolvedSource>,
    pub warnings: Vec<String>,
}

impl Loaded {
    pub fn file_count(&self) -> usize {
        self.sources.iter().map(|s| s.files.len()).sum()
    }
}

/// Resolve, read and merge every source in order.
pub fn load(sources: &[String], policy: DuplicatePolicy) -> Result<Loaded> {
    let mut spec = Specification::new(policy);
    let mut resolved = Vec::with_capacity(sources.len());
    let mut warnings = Vec::new();
    let mut seen = BTreeSet::new();

    for source in sources {
        let mut entry = resolve(source)?;
        if entry.files.is_empty() {
            log::warn!("source {source} matched no files");
            warnings.push(format!("source {source} matched no files"));
        }
        // a file named by two sources is only merged once
        entry.files.retain(|file| seen.insert(file.clone()));

        for file in &entry.files {
            let origin = file.display().to_string();
            let text = fs::read_to_string(file)
                .with_context(|| format!("Could not read {origin}"))?;
            spec.add_json(&origin, &text)
                .with_context(|| format!("Invalid login definitions in {origin}"))?;
            log::debug!("loaded {origin}");
        }
        resolved.push(entry);
    }

    Ok(Loaded {
        spec,
        sources: resolved,
        warnings,
    })
}

/// Expand one source argument into the files it names.
pub fn resolve(source: &str) -> Result<ResolvedSource> {
    let expanded = shellexpand::tilde(source).into_owned();
    let path = PathBuf::from(&expanded);

    let mut files = if path.is_dir() {
        json_files_under(&path)
    } else if path.is_file() {
        vec![path]
    } else if expanded.contains(GLOB_CHARS) {
        glob_files(&expanded)?
    } else {
        Vec::new()
    };
    files.sort();

    Ok(ResolvedSource {
        source: source.to_string(),
        files,
    })
}

fn json_files_under(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("skipping unreadable entry under {}: {e}", dir.display());
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect()
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("invalid glob: {pattern:?}"))?
        .compile_matcher();

    let base = literal_prefix(pattern);
    let implicit_base = base.as_os_str().is_empty();
    let root = if implicit_base { PathBuf::from(".") } else { base };

    let files = WalkDir::new(&root)
        .follow_links(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .map(|path| {
            if implicit_base {
                path.strip_prefix(".").map(Path::to_path_buf).unwrap_or(path)
            } else {
                path
            }
        })
        .filter(|path| matcher.is_match(path))
        .collect();
    Ok(files)
}

/// Leading components of `pattern` that contain no glob syntax.
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in Path::new(pattern).components() {
        if let Component::Normal(part) = component
            && part.to_string_lossy().contains(GLOB_CHARS)
        {
            break;
        }
        prefix.push(component);
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn sources(items: &[&Path]) -> Vec<String> {
        items.iter().map(|p| p.display().to_string()).collect()
    }

    #[test]
    fn test_directory_is_walked_for_json() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.json", r#"{"alice": {"password": "pw"}}"#);
        write(tmp.path(), "nested/b.json", r#"{"bob": {"password": "pw"}}"#);
        write(tmp.path(), "notes.txt", "not json");

        let resolved = resolve(&tmp.path().display().to_string()).unwrap();
        assert_eq!(resolved.files.len(), 2);
        assert!(resolved.files.iter().all(|f| f.extension().unwrap() == "json"));
    }

    #[test]
    fn test_glob_matches_single_level() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "prod-a.json", "{}");
        write(tmp.path(), "prod-b.json", "{}");
        write(tmp.path(), "dev.json", "{}");
        write(tmp.path(), "sub/prod-c.json", "{}");

        let pattern = format!("{}/prod-*.json", tmp.path().display());
        let resolved = resolve(&pattern).unwrap();
        let names: Vec<_> = resolved
            .files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["prod-a.json", "prod-b.json"]);
    }

    #[test]
    fn test_recursive_glob() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "x/one.json", "{}");
        write(tmp.path(), "x/y/two.json", "{}");

        let pattern = format!("{}/**/*.json", tmp.path().display());
        assert_eq!(resolve(&pattern).unwrap().files.len(), 2);
    }

    #[test]
    fn test_literal_prefix_stops_at_glob() {
        assert_eq!(literal_prefix("/etc/logins/*.json"), PathBuf::from("/etc/logins"));
        assert_eq!(literal_prefix("*.json"), PathBuf::new());
        assert_eq!(literal_prefix("a/b{1,2}/c.json"), PathBuf::from("a"));
    }

    #[test]
    fn test_load_merges_and_warns_on_missing() {
        let tmp = TempDir::new().unwrap();
        let a = write(tmp.path(), "a.json", r#"{"alice": {"password": "pw"}}"#);
        let b = write(
            tmp.path(),
            "b.json",
            r#"{"bob": {"password": "pw", "users": {"bob": {"databases": {"sales": {"roles": ["db_owner"]}}}}}}"#,
        );
        let missing = tmp.path().join("missing.json");

        let loaded = load(&sources(&[&a, &b, &missing]), DuplicatePolicy::LastWins).unwrap();
        assert_eq!(loaded.spec.len(), 2);
        assert_eq!(loaded.file_count(), 2);
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].contains("missing.json"));
    }

    #[test]
    fn test_same_file_twice_is_merged_once() {
        let tmp = TempDir::new().unwrap();
        let a = write(tmp.path(), "a.json", r#"{"alice": {"password": "pw"}}"#);

        let loaded = load(&sources(&[&a, tmp.path()]), DuplicatePolicy::Reject).unwrap();
        assert_eq!(loaded.spec.len(), 1);
        assert_eq!(loaded.file_count(), 1);
    }

    #[test]
    fn test_strict_rejects_duplicates_across_files() {
        let tmp = TempDir::new().unwrap();
        let a = write(tmp.path(), "a.json", r#"{"alice": {"password": "pw"}}"#);
        let b = write(tmp.path(), "b.json", r#"{"ALICE": {"password": "other"}}"#);

        let err = load(&sources(&[&a, &b]), DuplicatePolicy::Reject).unwrap_err();
        assert!(format!("{err:#}").contains("b.json"));
    }

    #[test]
    fn test_invalid_state_names_the_file() {
        let tmp = TempDir::new().unwrap();
        let bad = write(tmp.path(), "bad.json", r#"{"alice": {"state": "gone"}}"#);

        let err = load(&sources(&[&bad]), DuplicatePolicy::LastWins).unwrap_err();
        assert!(format!("{err:#}").contains("bad.json"));
    }
}
