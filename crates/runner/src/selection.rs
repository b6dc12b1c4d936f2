//! Test selection
//!
//! Resolves a catalog-level request (a set of entry ids, or everything)
//! into the engine-level files to run and an optional test-name filter.

use crate::engine::TestFile;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use storyrun_common::{CatalogEntry, EntryId, Error, Result};
use tracing::debug;

pub const INCLUDE_TAGS_ENV: &str = "STORYRUN_INCLUDE_TAGS";
pub const EXCLUDE_TAGS_ENV: &str = "STORYRUN_EXCLUDE_TAGS";
pub const SKIP_TAGS_ENV: &str = "STORYRUN_SKIP_TAGS";

const DEFAULT_INCLUDE_TAG: &str = "test";

/// Tag filters of one project, resolved from its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub skip: Vec<String>,
}

impl Default for TagFilter {
    fn default() -> Self {
        Self {
            include: vec![DEFAULT_INCLUDE_TAG.to_string()],
            exclude: Vec::new(),
            skip: Vec::new(),
        }
    }
}

impl TagFilter {
    /// Resolve from comma-separated environment strings
    pub fn from_env(env: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            include: env
                .get(INCLUDE_TAGS_ENV)
                .map(|v| split_tags(v))
                .unwrap_or(defaults.include),
            exclude: env.get(EXCLUDE_TAGS_ENV).map(|v| split_tags(v)).unwrap_or_default(),
            skip: env.get(SKIP_TAGS_ENV).map(|v| split_tags(v)).unwrap_or_default(),
        }
    }

    /// Entry carries an include tag and no exclude tag
    pub fn admits(&self, entry: &CatalogEntry) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|t| entry.has_tag(t));
        included && !self.exclude.iter().any(|t| entry.has_tag(t))
    }

    pub fn skips(&self, entry: &CatalogEntry) -> bool {
        self.skip.iter().any(|t| entry.has_tag(t))
    }

    /// Admitted and not skipped
    pub fn in_scope(&self, entry: &CatalogEntry) -> bool {
        self.admits(entry) && !self.skips(entry)
    }
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Decides whether an entry groups other entries
pub type ParentPredicate = Arc<dyn Fn(&CatalogEntry, &[CatalogEntry]) -> bool + Send + Sync>;

/// Some entry names this one as its parent
pub fn default_parent_predicate() -> ParentPredicate {
    Arc::new(|entry, entries| {
        entries
            .iter()
            .any(|e| e.parent.as_deref() == Some(entry.id.as_str()))
    })
}

/// Test-name filter handed to the engine
#[derive(Clone)]
pub struct NamePattern(Regex);

impl NamePattern {
    /// Matches exactly `name`
    pub fn exact(name: &str) -> Result<Self> {
        Self::compile(format!("^{}$", regex::escape(name)))
    }

    /// Matches every test nested under `name`
    pub fn prefix(name: &str) -> Result<Self> {
        Self::compile(format!("^{} ", regex::escape(name)))
    }

    fn compile(pattern: String) -> Result<Self> {
        Regex::new(&pattern)
            .map(Self)
            .map_err(|e| Error::Internal(format!("invalid name pattern {}: {}", pattern, e)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, test_name: &str) -> bool {
        self.0.is_match(test_name)
    }
}

impl fmt::Debug for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamePattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for NamePattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// Outcome of resolving a run request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub files: Vec<TestFile>,
    /// In-scope entries across the selected files
    pub entry_ids: Vec<EntryId>,
    pub name_pattern: Option<NamePattern>,
}

/// Whether `entry` is declared in `file`
pub fn declares(file: &Path, entry: &CatalogEntry) -> bool {
    let import_path = entry.import_path.trim_start_matches("./");
    !import_path.is_empty() && file.ends_with(import_path)
}

/// Resolve `requested` (or everything) into files and a name filter
pub fn select_specs(
    files: &[TestFile],
    filters: &HashMap<String, TagFilter>,
    entries: &[CatalogEntry],
    requested: Option<&[EntryId]>,
    is_parent: &ParentPredicate,
) -> Result<Selection> {
    let candidates: Vec<&CatalogEntry> = match requested {
        Some(ids) => {
            for id in ids {
                if !entries.iter().any(|e| &e.id == id) {
                    return Err(Error::EntryNotFound(id.clone()));
                }
            }
            entries
                .iter()
                .filter(|e| e.is_testable())
                .filter(|e| {
                    ids.contains(&e.id) || e.parent.as_ref().map_or(false, |p| ids.contains(p))
                })
                .collect()
        }
        None => entries.iter().filter(|e| e.is_testable()).collect(),
    };

    let default_filter = TagFilter::default();
    let mut selection = Selection::default();
    for file in files {
        let filter = file
            .project
            .as_ref()
            .and_then(|p| filters.get(p))
            .unwrap_or(&default_filter);
        let in_scope: Vec<&EntryId> = candidates
            .iter()
            .filter(|e| declares(&file.path, e) && filter.in_scope(e))
            .map(|e| &e.id)
            .collect();
        if in_scope.is_empty() {
            continue;
        }
        selection.entry_ids.extend(in_scope.into_iter().cloned());
        selection.files.push(file.clone());
    }

    if let Some([only]) = requested {
        if let Some(entry) = entries.iter().find(|e| &e.id == only) {
            selection.name_pattern = Some(if is_parent(entry, entries) {
                NamePattern::prefix(&entry.name)?
            } else {
                NamePattern::exact(&entry.name)?
            });
        }
    }

    debug!(
        "Selected {} file(s), {} entr(ies), name filter {:?}",
        selection.files.len(),
        selection.entry_ids.len(),
        selection.name_pattern
    );
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use storyrun_common::EntryKind;
    use test_case::test_case;

    fn entry(id: &str, name: &str, import_path: &str, tags: &[&str]) -> CatalogEntry {
        CatalogEntry {
            id: id.to_string(),
            name: name.to_string(),
            title: "Button".to_string(),
            import_path: import_path.to_string(),
            kind: EntryKind::Story,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            parent: None,
        }
    }

    fn file(path: &str) -> TestFile {
        TestFile {
            path: PathBuf::from(path),
            project: None,
        }
    }

    fn catalog() -> Vec<CatalogEntry> {
        let with_tests = entry(
            "button--with-tests",
            "With tests",
            "./src/Button.stories.tsx",
            &["test"],
        );
        let mut child = entry(
            "button--with-tests:clicks",
            "clicks",
            "./src/Button.stories.tsx",
            &["test"],
        );
        child.kind = EntryKind::Test;
        child.parent = Some("button--with-tests".to_string());
        vec![
            entry("button--primary", "Primary (v2.0)", "./src/Button.stories.tsx", &["test"]),
            entry("button--secondary", "Secondary", "./src/Button.stories.tsx", &["test"]),
            entry("card--default", "Default", "./src/Card.stories.tsx", &["test", "flaky"]),
            entry("modal--draft", "Draft", "./src/Modal.stories.tsx", &["dev"]),
            with_tests,
            child,
        ]
    }

    fn files() -> Vec<TestFile> {
        vec![
            file("/repo/src/Button.stories.tsx"),
            file("/repo/src/Card.stories.tsx"),
            file("/repo/src/Modal.stories.tsx"),
        ]
    }

    #[test_case(&[], vec!["test"], vec![], vec![] ; "empty env uses default include")]
    #[test_case(&[(INCLUDE_TAGS_ENV, "test, smoke")], vec!["test", "smoke"], vec![], vec![] ; "include list")]
    #[test_case(&[(EXCLUDE_TAGS_ENV, "flaky"), (SKIP_TAGS_ENV, "slow,")], vec!["test"], vec!["flaky"], vec!["slow"] ; "exclude and skip")]
    fn test_tag_filter_from_env(
        env: &[(&str, &str)],
        include: Vec<&str>,
        exclude: Vec<&str>,
        skip: Vec<&str>,
    ) {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let filter = TagFilter::from_env(&env);
        assert_eq!(filter.include, include);
        assert_eq!(filter.exclude, exclude);
        assert_eq!(filter.skip, skip);
    }

    #[test]
    fn test_full_selection_drops_files_without_entries() {
        let selection = select_specs(
            &files(),
            &HashMap::new(),
            &catalog(),
            None,
            &default_parent_predicate(),
        )
        .unwrap();

        let paths: Vec<_> = selection.files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/repo/src/Button.stories.tsx"),
                PathBuf::from("/repo/src/Card.stories.tsx"),
            ]
        );
        assert_eq!(selection.entry_ids.len(), 5);
        assert!(selection.name_pattern.is_none());
    }

    #[test]
    fn test_project_filters_apply_per_file() {
        let mut files = files();
        files[1].project = Some("stable".to_string());
        let filters = HashMap::from([(
            "stable".to_string(),
            TagFilter {
                skip: vec!["flaky".to_string()],
                ..TagFilter::default()
            },
        )]);

        let selection =
            select_specs(&files, &filters, &catalog(), None, &default_parent_predicate()).unwrap();
        assert_eq!(selection.files.len(), 1);
        assert!(!selection.entry_ids.contains(&"card--default".to_string()));
    }

    #[test]
    fn test_single_leaf_gets_exact_name_filter() {
        let requested = vec!["button--primary".to_string()];
        let selection = select_specs(
            &files(),
            &HashMap::new(),
            &catalog(),
            Some(&requested),
            &default_parent_predicate(),
        )
        .unwrap();

        assert_eq!(selection.files, vec![file("/repo/src/Button.stories.tsx")]);
        assert_eq!(selection.entry_ids, requested);
        let pattern = selection.name_pattern.unwrap();
        assert_eq!(pattern.as_str(), r"^Primary \(v2\.0\)$");
        assert!(pattern.is_match("Primary (v2.0)"));
        assert!(!pattern.is_match("Primary (v2.0) hover"));
    }

    #[test]
    fn test_parent_entry_gets_prefix_filter_and_children() {
        let requested = vec!["button--with-tests".to_string()];
        let selection = select_specs(
            &files(),
            &HashMap::new(),
            &catalog(),
            Some(&requested),
            &default_parent_predicate(),
        )
        .unwrap();

        assert_eq!(selection.entry_ids.len(), 2);
        let pattern = selection.name_pattern.unwrap();
        assert!(pattern.is_match("With tests clicks"));
        assert!(!pattern.is_match("With testsuite"));
    }

    #[test]
    fn test_parent_predicate_is_pluggable() {
        let requested = vec!["button--with-tests".to_string()];
        let never: ParentPredicate = Arc::new(|_, _| false);
        let selection =
            select_specs(&files(), &HashMap::new(), &catalog(), Some(&requested), &never).unwrap();
        assert_eq!(selection.name_pattern.unwrap().as_str(), "^With tests$");
    }

    #[test]
    fn test_several_entries_get_no_name_filter() {
        let requested = vec!["button--primary".to_string(), "card--default".to_string()];
        let selection = select_specs(
            &files(),
            &HashMap::new(),
            &catalog(),
            Some(&requested),
            &default_parent_predicate(),
        )
        .unwrap();
        assert_eq!(selection.files.len(), 2);
        assert!(selection.name_pattern.is_none());
    }

    #[test]
    fn test_unknown_entry_is_an_error() {
        let requested = vec!["nope--missing".to_string()];
        let err = select_specs(
            &files(),
            &HashMap::new(),
            &catalog(),
            Some(&requested),
            &default_parent_predicate(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::EntryNotFound(id) if id == "nope--missing"));
    }
}
