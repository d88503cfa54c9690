//! Spec scanner: turns a directory of markdown work specs into task drafts.
//!
//! A spec is a `*.md` file whose name starts with a task id
//! (`T-001-add-parser.md`) and which opens with a YAML front-matter block:
//!
//! ```text
//! ---
//! title: Add the parser
//! depends_on: [T-000]
//! modifies:
//!   - src/parser.rs
//! exclusive: false
//! priority: 50
//! ---
//! ```

use crate::db::Database;
use crate::db::tasks::InsertOutcome;
use crate::error::SpecError;
use crate::types::{DEFAULT_PRIORITY, EventType, TaskDraft};
use anyhow::{Context, Result, anyhow};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, error, info, warn};

static TASK_ID_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*-\d+").ok());

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<OneOrMany>::deserialize(deserializer)?
        .map(OneOrMany::into_vec)
        .unwrap_or_default())
}

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    id: Option<String>,
    title: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    depends_on: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    modifies: Vec<String>,
    #[serde(default)]
    exclusive: bool,
    priority: Option<i32>,
    max_retries: Option<i32>,
    executor: Option<String>,
}

/// Result of importing a spec directory.
#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub inserted: Vec<String>,
    pub unchanged: Vec<String>,
    /// Tasks whose spec file changed after they were first imported.
    pub drifted: Vec<String>,
    #[serde(serialize_with = "serialize_errors")]
    pub rejected: Vec<SpecError>,
}

fn serialize_errors<S: serde::Serializer>(errors: &[SpecError], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(errors.iter().map(|e| e.to_string()))
}

impl ScanReport {
    pub fn total_valid(&self) -> usize {
        self.inserted.len() + self.unchanged.len() + self.drifted.len()
    }
}

/// Task-id prefix of a file stem, if it has one.
pub fn task_id_prefix(stem: &str) -> Option<&str> {
    TASK_ID_PREFIX.as_ref()?.find(stem).map(|m| m.as_str())
}

/// Lowercase hex SHA-256 of a spec file's bytes.
pub fn hash_spec(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Split `---\n<yaml>\n---\n<body>` into its YAML block and body.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let content = content.trim_start_matches('\u{feff}');
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\r').unwrap_or(rest);
    let rest = rest.strip_prefix('\n')?;

    // closing fence may be the first line of `rest` (empty block)
    let (yaml, after) = if let Some(after) = rest.strip_prefix("---") {
        ("", after)
    } else {
        let close = rest.find("\n---")?;
        (&rest[..close], &rest[close + 4..])
    };
    let body = after.split_once('\n').map(|(_, b)| b).unwrap_or("");
    Some((yaml, body))
}

fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Parse one spec file's contents into a draft.
pub fn parse_spec(
    project: &str,
    spec_file: &str,
    file_stem: &str,
    bytes: &[u8],
    default_max_retries: i32,
) -> std::result::Result<TaskDraft, SpecError> {
    let content = std::str::from_utf8(bytes).map_err(|e| SpecError::Unreadable {
        file: spec_file.to_string(),
        reason: e.to_string(),
    })?;

    let (yaml, body) = split_front_matter(content).ok_or_else(|| SpecError::NoFrontMatter {
        file: spec_file.to_string(),
    })?;

    let fm: FrontMatter = if yaml.trim().is_empty() {
        FrontMatter::default()
    } else {
        serde_yaml::from_str(yaml).map_err(|e| SpecError::InvalidFrontMatter {
            file: spec_file.to_string(),
            reason: e.to_string(),
        })?
    };

    let id = fm
        .id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| task_id_prefix(file_stem).map(str::to_string))
        .ok_or_else(|| SpecError::MissingId {
            file: spec_file.to_string(),
        })?;

    let title = fm.title.or_else(|| first_heading(body));
    let depends_on: Vec<String> = fm
        .depends_on
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();

    let draft = TaskDraft::new(id, project, spec_file, hash_spec(bytes), fm.modifies)?
        .with_title(title)
        .with_depends_on(depends_on)
        .with_exclusive(fm.exclusive)
        .with_priority(fm.priority.unwrap_or(DEFAULT_PRIORITY))
        .with_max_retries(fm.max_retries.unwrap_or(default_max_retries))
        .with_executor(fm.executor.filter(|e| !e.trim().is_empty()));

    Ok(draft)
}

/// Spec files in `dir`, sorted by path.
fn candidate_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("reading spec directory {}", dir.display()))?;

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "md"))
        .filter(|p| {
            let keep = p
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(task_id_prefix)
                .is_some();
            if !keep {
                debug!(path = %p.display(), "ignoring non-spec markdown file");
            }
            keep
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Parse every spec in `dir`. Invalid files are returned as errors, not raised.
pub fn scan_dir(
    project: &str,
    dir: &Path,
    default_max_retries: i32,
) -> Result<(Vec<TaskDraft>, Vec<SpecError>)> {
    if !dir.is_dir() {
        return Err(anyhow!("spec directory {} does not exist", dir.display()));
    }

    let mut drafts: Vec<TaskDraft> = Vec::new();
    let mut rejected = Vec::new();
    let mut first_seen: HashMap<String, String> = HashMap::new();

    for path in candidate_files(dir)? {
        let spec_file = path.display().to_string();
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();

        let parsed = std::fs::read(&path)
            .map_err(|e| SpecError::Unreadable {
                file: spec_file.clone(),
                reason: e.to_string(),
            })
            .and_then(|bytes| parse_spec(project, &spec_file, stem, &bytes, default_max_retries));

        match parsed {
            Ok(draft) => {
                if let Some(first) = first_seen.get(draft.id()) {
                    let err = SpecError::DuplicateId {
                        file: spec_file,
                        id: draft.id().to_string(),
                        first: first.clone(),
                    };
                    error!(project, "{}", err);
                    rejected.push(err);
                    continue;
                }
                first_seen.insert(draft.id().to_string(), spec_file);
                drafts.push(draft);
            }
            Err(err) => {
                error!(project, "{}", err);
                rejected.push(err);
            }
        }
    }

    Ok((drafts, rejected))
}

/// Scan `dir` and insert any new tasks. Existing tasks are never modified.
pub fn import(db: &Database, project: &str, dir: &Path, default_max_retries: i32) -> Result<ScanReport> {
    let (drafts, rejected) = scan_dir(project, dir, default_max_retries)?;
    let mut report = ScanReport {
        rejected,
        ..Default::default()
    };

    for draft in &drafts {
        if let Some(existing) = db.get_task(draft.id())?
            && existing.project != project
        {
            warn!(
                task_id = %draft.id(),
                owner = %existing.project,
                "task id already belongs to another project; skipping"
            );
            continue;
        }

        match db.insert_draft(draft)? {
            InsertOutcome::Inserted => report.inserted.push(draft.id().to_string()),
            InsertOutcome::Unchanged => report.unchanged.push(draft.id().to_string()),
            InsertOutcome::Drifted => {
                warn!(
                    task_id = %draft.id(),
                    spec_file = %draft.spec_file(),
                    "spec file changed since import; stored task left as is"
                );
                report.drifted.push(draft.id().to_string());
            }
        }
    }

    db.append_event(
        project,
        None,
        EventType::TasksScanned,
        None,
        json!({
            "inserted": report.inserted.len(),
            "unchanged": report.unchanged.len(),
            "drifted": report.drifted,
            "rejected": report.rejected.len(),
        }),
    )?;

    info!(
        project,
        inserted = report.inserted.len(),
        unchanged = report.unchanged.len(),
        drifted = report.drifted.len(),
        rejected = report.rejected.len(),
        "scanned specs"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(stem: &str, content: &str) -> std::result::Result<TaskDraft, SpecError> {
        parse_spec("p", &format!("{}.md", stem), stem, content.as_bytes(), 2)
    }

    #[test]
    fn id_prefix_from_file_stem() {
        assert_eq!(task_id_prefix("T-001-add-parser"), Some("T-001"));
        assert_eq!(task_id_prefix("TASK_A-12"), Some("TASK_A-12"));
        assert_eq!(task_id_prefix("README"), None);
        assert_eq!(task_id_prefix("1-abc"), None);
    }

    #[test]
    fn parses_full_front_matter() {
        let draft = parse(
            "T-1-x",
            "---\nid: T-9\ntitle: Parser\ndepends_on: [T-2, T-3]\nmodifies:\n  - src/a.rs\n  - src/b.rs\nexclusive: true\npriority: 5\nmax_retries: 4\nexecutor: gpu\n---\n# Ignored heading\n",
        )
        .unwrap();
        assert_eq!(draft.id(), "T-9");
        assert_eq!(draft.title(), Some("Parser"));
        assert_eq!(draft.depends_on(), ["T-2", "T-3"]);
        assert_eq!(draft.modifies(), ["src/a.rs", "src/b.rs"]);
        assert!(draft.exclusive());
        assert_eq!(draft.priority(), 5);
        assert_eq!(draft.max_retries(), 4);
        assert_eq!(draft.executor(), Some("gpu"));
    }

    #[test]
    fn defaults_and_scalar_lists() {
        let draft = parse("T-1-x", "---\nmodifies: src/a.rs\ndepends_on: T-0\n---\n\n# Add thing\nbody\n").unwrap();
        assert_eq!(draft.id(), "T-1");
        assert_eq!(draft.title(), Some("Add thing"));
        assert_eq!(draft.modifies(), ["src/a.rs"]);
        assert_eq!(draft.depends_on(), ["T-0"]);
        assert_eq!(draft.priority(), DEFAULT_PRIORITY);
        assert_eq!(draft.max_retries(), 2);
        assert!(!draft.exclusive());
    }

    #[test]
    fn rejects_missing_modifies() {
        let err = parse("T-1", "---\ntitle: x\n---\nbody").unwrap_err();
        assert!(matches!(err, SpecError::EmptyModifies { .. }));

        let err = parse("T-1", "---\nmodifies: []\n---\n").unwrap_err();
        assert!(matches!(err, SpecError::EmptyModifies { .. }));
    }

    #[test]
    fn rejects_bad_yaml_and_missing_block() {
        let err = parse("T-1", "---\nmodifies: [unclosed\n---\n").unwrap_err();
        assert!(matches!(err, SpecError::InvalidFrontMatter { .. }));

        let err = parse("T-1", "# Just markdown\n").unwrap_err();
        assert!(matches!(err, SpecError::NoFrontMatter { .. }));
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            hash_spec(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn split_handles_crlf_and_empty_block() {
        let (yaml, body) = split_front_matter("---\r\nmodifies: a\r\n---\r\nbody").unwrap();
        assert!(yaml.contains("modifies"));
        assert_eq!(body, "body");

        let (yaml, body) = split_front_matter("---\n---\nrest").unwrap();
        assert_eq!(yaml, "");
        assert_eq!(body, "rest");
    }
}
