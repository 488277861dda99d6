//! Durable process records.
//!
//! One JSON file per (group, process) pair lives in the state directory. Reads never
//! fail: a missing or corrupted file is reported as absent so a damaged record can
//! always be replaced by the next write.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::Utc;

use crate::config::{ensure_private_dir, Paths};
use crate::error::{Result, SupervisorError};
use crate::process::ProcessState;

/// Minimum age of an unreferenced log before [`StateStore::prune_logs`] removes it.
pub const PRUNE_GRACE: Duration = Duration::from_secs(60);

static LOG_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed store of [`ProcessState`] records.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
    log_dir: PathBuf,
}

impl StateStore {
    pub fn new(paths: &Paths) -> Self {
        Self {
            state_dir: paths.state_dir.clone(),
            log_dir: paths.log_dir.clone(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    // Slugs alone collide ("a-b"/"c" and "a"/"b-c"), so the raw pair is hashed in.
    fn record_path(&self, group: &str, process: &str) -> PathBuf {
        self.state_dir.join(format!(
            "{}-{}-{}.json",
            slugify(group),
            slugify(process),
            key_digest(group, process)
        ))
    }

    /// Writes `state` as the record for (group, process), replacing any previous one.
    pub fn write(&self, group: &str, process: &str, state: &ProcessState) -> Result<()> {
        ensure_private_dir(&self.state_dir)?;
        let path = self.record_path(group, process);
        let json = serde_json::to_vec_pretty(state)
            .map_err(|err| SupervisorError::config("failed to serialize process state", err))?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
        fs::write(&tmp, &json).map_err(|err| {
            SupervisorError::config(format!("failed to write {}", tmp.display()), err)
        })?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(SupervisorError::config(
                format!("failed to replace {}", path.display()),
                err,
            ));
        }
        tracing::debug!(group, process, status = ?state.status, "wrote process state");
        Ok(())
    }

    /// Returns the record for exactly (group, process), if one is readable.
    pub fn read(&self, group: &str, process: &str) -> Option<ProcessState> {
        let path = self.record_path(group, process);
        let state = read_record(&path)?;
        if state.group != group || state.process != process {
            tracing::debug!(
                path = %path.display(),
                group = %state.group,
                process = %state.process,
                "ignoring record stored under another key"
            );
            return None;
        }
        Some(state)
    }

    pub fn delete(&self, group: &str, process: &str) {
        let path = self.record_path(group, process);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(group, process, "deleted process state"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to delete process state"
            ),
        }
    }

    /// Every readable record, sorted by (group, process).
    pub fn list_all(&self) -> Vec<ProcessState> {
        let Ok(entries) = fs::read_dir(&self.state_dir) else {
            return Vec::new();
        };
        let mut states: Vec<ProcessState> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| read_record(&path))
            .collect();
        states.sort_by(|a, b| (&a.group, &a.process).cmp(&(&b.group, &b.process)));
        states
    }

    /// Returns a fresh log file path for (group, process), creating the log directory.
    pub fn generate_log_path(&self, group: &str, process: &str) -> Result<PathBuf> {
        ensure_private_dir(&self.log_dir)?;
        let seq = LOG_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}-{}-{}{:04}.log",
            slugify(group),
            slugify(process),
            Utc::now().timestamp_millis(),
            seq % 10_000
        );
        Ok(self.log_dir.join(name))
    }

    /// Deletes log files that none of `states` references. Returns how many were removed.
    ///
    /// Files modified within [`PRUNE_GRACE`] are kept: another invocation may have opened
    /// a log for a start that has not written its record yet.
    pub fn prune_logs(&self, states: &[ProcessState]) -> usize {
        self.prune_logs_older_than(states, PRUNE_GRACE)
    }

    pub fn prune_logs_older_than(&self, states: &[ProcessState], min_age: Duration) -> usize {
        let referenced: HashSet<PathBuf> = states
            .iter()
            .filter_map(|state| state.log_path.as_deref())
            .map(PathBuf::from)
            .collect();
        let Ok(entries) = fs::read_dir(&self.log_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || referenced.contains(&path) || is_hidden(&path) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or_default();
            if age < min_age {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(path = %path.display(), "pruned orphaned log");
                }
                Err(err) => tracing::debug!(
                    path = %path.display(),
                    error = %err,
                    "failed to prune log"
                ),
            }
        }
        removed
    }
}

fn key_digest(group: &str, process: &str) -> String {
    let key = format!("{group}\u{0}{process}");
    let mut digest = sha256::digest(key.as_str());
    digest.truncate(12);
    digest
}

// Temporary siblings such as `.name.trim` belong to an in-flight trim.
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

fn read_record(path: &Path) -> Option<ProcessState> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "skipping unreadable state");
            None
        }
    }
}

/// Maps `value` onto `[A-Za-z0-9-]`, collapsing and trimming hyphens.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(c);
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{GroupMeta, ProcessStatus};

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(&Paths::new(dir.path()));
        (dir, store)
    }

    fn running(group: &str, process: &str, pid: u32) -> ProcessState {
        let mut state = ProcessState::new(group, process, &GroupMeta::default());
        state.status = ProcessStatus::Running;
        state.pid = Some(pid);
        state.started_at = Some(Utc::now());
        state.ports = Some(vec![3000, 3001]);
        state
    }

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("My App!"), "My-App");
        assert_eq!(slugify("--a//b__c--"), "a-b-c");
        assert_eq!(slugify("web-1"), "web-1");
        assert_eq!(slugify("***"), "unnamed");
    }

    #[test]
    fn write_read_delete() {
        let (_dir, store) = store();
        let state = running("my app", "web server", 123);
        store.write("my app", "web server", &state).unwrap();
        let file = store.record_path("my app", "web server");
        assert!(file.exists());
        assert!(file
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("my-app-web-server-"));
        assert_eq!(store.read("my app", "web server"), Some(state));

        store.delete("my app", "web server");
        assert_eq!(store.read("my app", "web server"), None);
        // deleting twice is fine
        store.delete("my app", "web server");
    }

    #[test]
    fn write_overwrites_existing_record() {
        let (_dir, store) = store();
        store.write("app", "web", &running("app", "web", 1)).unwrap();
        store.write("app", "web", &running("app", "web", 2)).unwrap();
        assert_eq!(store.read("app", "web").unwrap().pid, Some(2));
        assert_eq!(store.list_all().len(), 1);
    }

    #[test]
    fn corrupted_records_are_absent_and_skipped() {
        let (_dir, store) = store();
        store.write("app", "web", &running("app", "web", 1)).unwrap();
        store.write("app", "api", &running("app", "api", 2)).unwrap();
        fs::write(store.record_path("app", "db"), "{not json").unwrap();
        fs::write(store.state_dir().join("notes.txt"), "ignored").unwrap();

        assert_eq!(store.read("app", "db"), None);
        let all = store.list_all();
        let names: Vec<_> = all.iter().map(|s| s.process.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);
    }

    #[test]
    fn list_all_without_directory_is_empty() {
        let (_dir, store) = store();
        assert!(store.list_all().is_empty());
    }

    #[test]
    fn generated_log_paths_are_unique() {
        let (_dir, store) = store();
        let a = store.generate_log_path("my app", "web").unwrap();
        let b = store.generate_log_path("my app", "web").unwrap();
        assert_ne!(a, b);
        assert!(store.log_dir().is_dir());
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("my-app-web-"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn prune_keeps_referenced_logs() {
        let (_dir, store) = store();
        let kept = store.generate_log_path("app", "web").unwrap();
        let orphan = store.generate_log_path("app", "old").unwrap();
        fs::write(&kept, "keep").unwrap();
        fs::write(&orphan, "drop").unwrap();

        let mut state = running("app", "web", 1);
        state.log_path = Some(kept.to_string_lossy().into_owned());
        let removed = store.prune_logs_older_than(&[state], Duration::ZERO);

        assert_eq!(removed, 1);
        assert!(kept.exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn prune_spares_fresh_and_temporary_files() {
        let (_dir, store) = store();
        let old = store.generate_log_path("app", "old").unwrap();
        let fresh = store.generate_log_path("other", "starting").unwrap();
        let trim = store.log_dir().join(".other-web.log.trim");
        fs::write(&old, "old").unwrap();
        fs::write(&fresh, "just opened").unwrap();
        fs::write(&trim, "tail").unwrap();
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(600))
            .unwrap();

        assert_eq!(store.prune_logs(&[]), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(trim.exists());
    }

    #[test]
    fn keys_with_equal_slugs_get_separate_records() {
        let (_dir, store) = store();
        let first = running("a-b", "c", 10);
        store.write("a-b", "c", &first).unwrap();

        assert_eq!(store.read("a", "b-c"), None);
        store.write("my app", "web", &running("my app", "web", 11)).unwrap();
        assert_eq!(store.read("my_app", "web"), None);

        let second = running("a", "b-c", 20);
        store.write("a", "b-c", &second).unwrap();
        assert_eq!(store.read("a-b", "c"), Some(first));
        assert_eq!(store.read("a", "b-c"), Some(second));
        assert_eq!(store.list_all().len(), 3);
    }

    #[test]
    fn read_rejects_record_for_another_key() {
        let (_dir, store) = store();
        store.write("app", "web", &running("app", "web", 1)).unwrap();
        // a record copied under the wrong file name
        fs::copy(store.record_path("app", "web"), store.record_path("app", "api")).unwrap();
        assert_eq!(store.read("app", "api"), None);
        assert!(store.read("app", "web").is_some());
    }
}
