//! On-disk store of completed runs
//!
//! Layout:
//!
//! ```text
//! <root>/<test-name>/<YYYYMMDDTHHMMSS>/
//!     history.jsonl   one event per line
//!     verdict.json
//!     test.json       the configuration the run used
//! ```

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::checker::{Validity, Verdict};
use crate::config::TestConfig;
use crate::error::StoreError;
use crate::history::{Event, History};

const HISTORY_FILE: &str = "history.jsonl";
const VERDICT_FILE: &str = "verdict.json";
const CONFIG_FILE: &str = "test.json";

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Summary of one stored run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub name: String,
    /// Directory name, the run's start time
    pub run: String,
    pub path: PathBuf,
    /// `None` if the verdict is missing or unreadable
    pub validity: Option<Validity>,
    pub passed: Option<bool>,
}

/// Root of the run store
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RunStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh directory for a run of `name` starting now
    pub fn create_run(&self, name: &str) -> Result<PathBuf, StoreError> {
        let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S").to_string();
        let parent = self.root.join(name);
        fs::create_dir_all(&parent).map_err(io_error(&parent))?;

        // Two runs in the same second get a suffix
        let mut dir = parent.join(&stamp);
        let mut n = 1;
        while dir.exists() {
            dir = parent.join(format!("{}-{}", stamp, n));
            n += 1;
        }
        fs::create_dir(&dir).map_err(io_error(&dir))?;
        Ok(dir)
    }

    /// Persist every artifact of a finished run; returns the run directory
    pub fn save(&self, config: &TestConfig, history: &History, verdict: &Verdict) -> Result<PathBuf, StoreError> {
        let dir = self.create_run(&config.name)?;
        write_json(&dir.join(CONFIG_FILE), config)?;
        write_history(&dir.join(HISTORY_FILE), history)?;
        write_json(&dir.join(VERDICT_FILE), verdict)?;
        tracing::info!(path = %dir.display(), "run stored");
        Ok(dir)
    }

    /// Replace a stored run's verdict, e.g. after re-checking it
    pub fn save_verdict(&self, dir: &Path, verdict: &Verdict) -> Result<(), StoreError> {
        write_json(&dir.join(VERDICT_FILE), verdict)
    }

    pub fn load_history(&self, dir: &Path) -> Result<History, StoreError> {
        read_history(&dir.join(HISTORY_FILE))
    }

    pub fn load_verdict(&self, dir: &Path) -> Result<Verdict, StoreError> {
        read_json(&dir.join(VERDICT_FILE))
    }

    pub fn load_config(&self, dir: &Path) -> Result<TestConfig, StoreError> {
        read_json(&dir.join(CONFIG_FILE))
    }

    /// Directory of `run` of test `name`; the latest run if `run` is `None`
    pub fn resolve(&self, name: &str, run: Option<&str>) -> Result<PathBuf, StoreError> {
        let found = match run {
            Some(run) => {
                let dir = self.root.join(name).join(run);
                dir.is_dir().then_some(dir)
            }
            None => self.runs_of(name)?.into_iter().last().map(|info| info.path),
        };
        found.ok_or_else(|| StoreError::NotFound(format!("{}/{}", name, run.unwrap_or("latest"))))
    }

    /// Every stored run, ordered by test name then start time
    pub fn list(&self) -> Result<Vec<RunInfo>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for name in sorted_dirs(&self.root)? {
            runs.extend(self.runs_of(&name)?);
        }
        Ok(runs)
    }

    fn runs_of(&self, name: &str) -> Result<Vec<RunInfo>, StoreError> {
        let parent = self.root.join(name);
        if !parent.is_dir() {
            return Ok(Vec::new());
        }
        let runs = sorted_dirs(&parent)?
            .into_iter()
            .map(|run| {
                let path = parent.join(&run);
                let verdict = self.load_verdict(&path).ok();
                RunInfo {
                    name: name.to_string(),
                    run,
                    validity: verdict.as_ref().map(|v| v.validity),
                    passed: verdict.as_ref().map(|v| v.passed()),
                    path,
                }
            })
            .collect();
        Ok(runs)
    }
}

fn sorted_dirs(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort_by(|a, b| run_order(a).cmp(&run_order(b)).then_with(|| a.cmp(b)));
    Ok(names)
}

/// `<stamp>-<n>` sorts after `<stamp>-<n-1>` for any `n`
fn run_order(name: &str) -> (&str, u64) {
    match name.rsplit_once('-') {
        Some((stamp, n)) => match n.parse() {
            Ok(n) => (stamp, n),
            Err(_) => (name, 0),
        },
        None => (name, 0),
    }
}

/// Write to a temporary file, fsync, then rename into place
fn atomic_write(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> Result<(), StoreError>) -> Result<(), StoreError> {
    let temp_path = path.with_extension("tmp");
    let file = File::create(&temp_path).map_err(io_error(&temp_path))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    let file = writer
        .into_inner()
        .map_err(|e| io_error(&temp_path)(e.into_error()))?;
    file.sync_all().map_err(io_error(&temp_path))?;
    fs::rename(&temp_path, path).map_err(io_error(path))?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    atomic_write(path, |w| {
        serde_json::to_writer_pretty(&mut *w, value)?;
        writeln!(w).map_err(io_error(path))
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let raw = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
        path: path.display().to_string(),
        line: 1,
        source,
    })
}

fn write_history(path: &Path, history: &History) -> Result<(), StoreError> {
    atomic_write(path, |w| {
        for event in history.events() {
            serde_json::to_writer(&mut *w, event)?;
            writeln!(w).map_err(io_error(path))?;
        }
        Ok(())
    })
}

/// Read a history file; events are taken in file order
pub fn read_history(path: &Path) -> Result<History, StoreError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut events = Vec::new();

    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_error(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).map_err(|source| StoreError::Decode {
            path: path.display().to_string(),
            line: line_num + 1,
            source,
        })?;
        events.push(event);
    }

    Ok(History::from_events(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{Checker, Model};
    use crate::history::{Action, Operation, Process, Value};
    use tempfile::TempDir;

    fn sample_history() -> History {
        let read = Action::Read { key: "x".into() };
        let write = Action::Write {
            key: "x".into(),
            value: 3,
        };
        History::from_ops(vec![
            Operation::invoke(Process::Client(0), write.clone()),
            Operation::invoke(Process::Client(1), read.clone()),
            Operation::info(Process::Client(0), write, "timed out"),
            Operation::ok(Process::Client(1), read, Some(Value::Int(3))),
        ])
    }

    #[test]
    fn test_save_and_reload_run() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let config = TestConfig::default().with_name("reload");
        let history = sample_history();
        let verdict = Checker::new(Model::default()).check(&history).unwrap();

        let run = store.save(&config, &history, &verdict).unwrap();
        assert!(run.starts_with(dir.path().join("reload")));

        let loaded = store.load_history(&run).unwrap();
        assert_eq!(loaded, history);
        assert_eq!(store.load_verdict(&run).unwrap(), verdict);
        assert_eq!(store.load_config(&run).unwrap(), config);

        // Re-checking the stored history reproduces the verdict
        let again = Checker::new(Model::default()).check(&loaded).unwrap();
        assert_eq!(again, verdict);
    }

    #[test]
    fn test_list_and_resolve() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        assert!(store.list().unwrap().is_empty());

        let config = TestConfig::default().with_name("listed");
        let history = sample_history();
        let verdict = Checker::new(Model::default()).check(&history).unwrap();
        let first = store.save(&config, &history, &verdict).unwrap();
        let second = store.save(&config, &history, &verdict).unwrap();
        assert_ne!(first, second);

        let runs = store.list().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].validity, Some(Validity::Valid));
        assert_eq!(store.resolve("listed", None).unwrap(), second);
        assert!(matches!(
            store.resolve("missing", None),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_latest_run_with_many_same_second_suffixes() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let parent = dir.path().join("busy");
        std::fs::create_dir_all(parent.join("20260101T000000")).unwrap();
        for n in 1..=11 {
            std::fs::create_dir(parent.join(format!("20260101T000000-{}", n))).unwrap();
        }

        let runs: Vec<String> = store.list().unwrap().into_iter().map(|info| info.run).collect();
        assert_eq!(runs[0], "20260101T000000");
        assert_eq!(runs[1], "20260101T000000-1");
        assert_eq!(runs[2], "20260101T000000-2");
        assert_eq!(runs[11], "20260101T000000-11");
        assert_eq!(
            store.resolve("busy", None).unwrap(),
            parent.join("20260101T000000-11")
        );
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(HISTORY_FILE);
        std::fs::write(&path, "\n{\"index\": 0}\n").unwrap();
        let err = read_history(&path).unwrap_err();
        assert!(matches!(err, StoreError::Decode { line: 2, .. }));
    }
}
