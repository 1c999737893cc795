//! File-backed storage using append-only JSONL logs.
//!
//! Every collection is one log under the storage root; reads replay a log and
//! fold it into current state. All access goes through a store-wide `fs2` lock
//! file, shared for reads and exclusive for writes, so several daemons and CLI
//! invocations can share a home directory and every read-modify-write is
//! atomic across processes. File IO runs on tokio's blocking pool.
//!
//! A last-write-wins log is rewritten to its folded state once it holds more
//! than twice as many records as live entries. Purging ticks always rewrites
//! the tick log. Layout:
//!
//! ```text
//! <root>/
//!   .lock
//!   states.jsonl       # full InstigatorState per line, last one wins
//!   ticks.jsonl        # put/delete tick records
//!   runs.jsonl         # full Run per line, last one wins
//!   run_events.jsonl
//!   partitions.jsonl   # add/delete partition records
//!   cursors.jsonl      # key/value pairs, last one wins
//! ```

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CursorStore, InstigatorStore, PartitionStore, RunStore, RunsFilter, StoreError, TickStore,
};
use crate::domain::{InstigatorState, Run, RunEvent, RunStatus, Tick, TickStatus};

const LOCK_FILE: &str = ".lock";
const STATES_FILE: &str = "states.jsonl";
const TICKS_FILE: &str = "ticks.jsonl";
const RUNS_FILE: &str = "runs.jsonl";
const RUN_EVENTS_FILE: &str = "run_events.jsonl";
const PARTITIONS_FILE: &str = "partitions.jsonl";
const CURSORS_FILE: &str = "cursors.jsonl";

/// Logs shorter than this are never compacted
const COMPACT_MIN_RECORDS: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum TickRecord {
    Put { tick: Tick },
    Delete { tick_id: Uuid },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum PartitionRecord {
    Add {
        partitions_def_name: String,
        partition_keys: Vec<String>,
    },
    Delete {
        partitions_def_name: String,
        partition_key: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorRecord {
    key: String,
    value: String,
}

/// Attach the file path to an IO error
trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T, StoreError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::File {
            path: path.display().to_string(),
            source,
        })
    }
}

fn needs_compaction(records: usize, live: usize) -> bool {
    records >= COMPACT_MIN_RECORDS && records > live.saturating_mul(2)
}

/// Synchronous access to the log directory, used on the blocking pool only
#[derive(Debug, Clone)]
struct Logs {
    root: PathBuf,
}

impl Logs {
    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Take the store-wide lock; it is released when the handle is dropped
    fn lock(&self, exclusive: bool) -> Result<File, StoreError> {
        let path = self.path(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .at(&path)?;
        if exclusive {
            file.lock_exclusive().at(&path)?;
        } else {
            file.lock_shared().at(&path)?;
        }
        Ok(file)
    }

    /// Every record of a log; a missing file is an empty log
    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let path = self.path(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).at(&path),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.at(&path)?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn append<T: Serialize>(&self, name: &str, record: &T) -> Result<(), StoreError> {
        let path = self.path(name);
        let json = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .at(&path)?;
        writeln!(file, "{}", json).at(&path)?;
        file.flush().at(&path)
    }

    /// Replace a log through a temp file and a rename
    fn rewrite<T: Serialize>(
        &self,
        name: &str,
        records: impl IntoIterator<Item = T>,
    ) -> Result<(), StoreError> {
        let path = self.path(name);
        let tmp = self.path(&format!("{}.tmp", name));

        let mut writer = BufWriter::new(File::create(&tmp).at(&tmp)?);
        for record in records {
            let json = serde_json::to_string(&record)?;
            writeln!(writer, "{}", json).at(&tmp)?;
        }
        writer.flush().at(&tmp)?;
        writer.get_ref().sync_all().at(&tmp)?;
        drop(writer);

        fs::rename(&tmp, &path).at(&path)
    }

    /// Folded states and the number of records behind them
    fn states(&self) -> Result<(HashMap<String, InstigatorState>, usize), StoreError> {
        let records = self.read::<InstigatorState>(STATES_FILE)?;
        let count = records.len();
        let states = records
            .into_iter()
            .map(|state| (state.selector_id.clone(), state))
            .collect();
        Ok((states, count))
    }

    fn compact_states(&self, states: &HashMap<String, InstigatorState>) -> Result<(), StoreError> {
        let mut ordered: Vec<&InstigatorState> = states.values().collect();
        ordered.sort_by(|a, b| a.selector_id.cmp(&b.selector_id));
        self.rewrite(STATES_FILE, ordered)
    }

    /// Ticks in creation order and the number of records behind them
    fn ticks(&self) -> Result<(Vec<Tick>, usize), StoreError> {
        let records = self.read::<TickRecord>(TICKS_FILE)?;
        let count = records.len();

        let mut ticks: Vec<Tick> = Vec::new();
        let mut index: HashMap<Uuid, usize> = HashMap::new();
        let mut deleted: HashSet<Uuid> = HashSet::new();
        for record in records {
            match record {
                TickRecord::Put { tick } => match index.get(&tick.tick_id) {
                    Some(&pos) => ticks[pos] = tick,
                    None => {
                        index.insert(tick.tick_id, ticks.len());
                        ticks.push(tick);
                    }
                },
                TickRecord::Delete { tick_id } => {
                    deleted.insert(tick_id);
                }
            }
        }

        ticks.retain(|t| !deleted.contains(&t.tick_id));
        Ok((ticks, count))
    }

    fn compact_ticks(&self, ticks: Vec<Tick>) -> Result<(), StoreError> {
        self.rewrite(
            TICKS_FILE,
            ticks.into_iter().map(|tick| TickRecord::Put { tick }),
        )
    }

    /// Runs in creation order and the number of records behind them
    fn runs(&self) -> Result<(Vec<Run>, usize), StoreError> {
        let records = self.read::<Run>(RUNS_FILE)?;
        let count = records.len();

        let mut runs: Vec<Run> = Vec::new();
        let mut index: HashMap<Uuid, usize> = HashMap::new();
        for run in records {
            match index.get(&run.run_id) {
                Some(&pos) => runs[pos] = run,
                None => {
                    index.insert(run.run_id, runs.len());
                    runs.push(run);
                }
            }
        }
        Ok((runs, count))
    }

    fn partitions(&self) -> Result<HashMap<String, Vec<String>>, StoreError> {
        let mut partitions: HashMap<String, Vec<String>> = HashMap::new();

        for record in self.read::<PartitionRecord>(PARTITIONS_FILE)? {
            match record {
                PartitionRecord::Add {
                    partitions_def_name,
                    partition_keys,
                } => {
                    let keys = partitions.entry(partitions_def_name).or_default();
                    for key in partition_keys {
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
                PartitionRecord::Delete {
                    partitions_def_name,
                    partition_key,
                } => {
                    if let Some(keys) = partitions.get_mut(&partitions_def_name) {
                        keys.retain(|k| *k != partition_key);
                    }
                }
            }
        }
        Ok(partitions)
    }
}

/// JSONL storage rooted at a directory
pub struct FileStorage {
    logs: Logs,

    /// Queues writers of this process before they block on the file lock
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Open (creating if needed) storage under `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).at(&root)?;
        Ok(Self {
            logs: Logs { root },
            write_lock: Mutex::new(()),
        })
    }

    /// Open storage in the configured home (`$SENSORD_HOME/storage`)
    pub fn open_default() -> anyhow::Result<Self> {
        let root = crate::config::storage_dir()?;
        Ok(Self::open(root)?)
    }

    pub fn root(&self) -> &Path {
        &self.logs.root
    }

    /// Run `f` on the blocking pool under the shared lock
    async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Logs) -> Result<T, StoreError> + Send + 'static,
    {
        let logs = self.logs.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = logs.lock(false)?;
            f(&logs)
        })
        .await?
    }

    /// Run `f` on the blocking pool under the exclusive lock
    async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Logs) -> Result<T, StoreError> + Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let logs = self.logs.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = logs.lock(true)?;
            f(&logs)
        })
        .await?
    }
}

#[async_trait]
impl InstigatorStore for FileStorage {
    async fn all_instigator_states(&self) -> Result<Vec<InstigatorState>, StoreError> {
        let (states, _) = self.read(|logs| logs.states()).await?;
        let mut states: Vec<InstigatorState> = states.into_values().collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(states)
    }

    async fn get_instigator_state(
        &self,
        selector_id: &str,
    ) -> Result<Option<InstigatorState>, StoreError> {
        let selector_id = selector_id.to_string();
        self.read(move |logs| Ok(logs.states()?.0.remove(&selector_id)))
            .await
    }

    async fn add_instigator_state(
        &self,
        state: InstigatorState,
    ) -> Result<InstigatorState, StoreError> {
        self.write(move |logs| {
            logs.append(STATES_FILE, &state)?;
            Ok(state)
        })
        .await
    }

    async fn update_instigator_state(
        &self,
        state: InstigatorState,
    ) -> Result<InstigatorState, StoreError> {
        self.write(move |logs| {
            let (mut states, records) = logs.states()?;
            if !states.contains_key(&state.selector_id) {
                return Err(StoreError::StateNotFound(state.selector_id));
            }

            states.insert(state.selector_id.clone(), state.clone());
            if needs_compaction(records + 1, states.len()) {
                logs.compact_states(&states)?;
            } else {
                logs.append(STATES_FILE, &state)?;
            }
            Ok(state)
        })
        .await
    }
}

#[async_trait]
impl TickStore for FileStorage {
    async fn create_tick(&self, tick: Tick) -> Result<Tick, StoreError> {
        let record = TickRecord::Put { tick: tick.clone() };
        self.write(move |logs| logs.append(TICKS_FILE, &record))
            .await?;
        Ok(tick)
    }

    async fn update_tick(&self, tick: &Tick) -> Result<(), StoreError> {
        let tick = tick.clone();
        self.write(move |logs| {
            let (mut ticks, records) = logs.ticks()?;
            let Some(slot) = ticks.iter_mut().find(|t| t.tick_id == tick.tick_id) else {
                return Err(StoreError::TickNotFound(tick.tick_id));
            };
            *slot = tick.clone();

            if needs_compaction(records + 1, ticks.len()) {
                logs.compact_ticks(ticks)
            } else {
                logs.append(TICKS_FILE, &TickRecord::Put { tick })
            }
        })
        .await
    }

    async fn get_ticks(
        &self,
        selector_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Tick>, StoreError> {
        let (ticks, _) = self.read(|logs| logs.ticks()).await?;
        Ok(ticks
            .into_iter()
            .rev()
            .filter(|t| t.selector_id == selector_id)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn purge_ticks(
        &self,
        selector_id: &str,
        before: DateTime<Utc>,
        statuses: &[TickStatus],
    ) -> Result<usize, StoreError> {
        let selector_id = selector_id.to_string();
        let statuses = statuses.to_vec();
        self.write(move |logs| {
            let (ticks, _) = logs.ticks()?;
            let total = ticks.len();
            let kept: Vec<Tick> = ticks
                .into_iter()
                .filter(|t| {
                    !(t.selector_id == selector_id
                        && t.timestamp < before
                        && statuses.contains(&t.status))
                })
                .collect();

            let purged = total - kept.len();
            if purged > 0 {
                logs.compact_ticks(kept)?;
            }
            Ok(purged)
        })
        .await
    }
}

#[async_trait]
impl RunStore for FileStorage {
    async fn add_run(&self, run: Run) -> Result<Run, StoreError> {
        self.write(move |logs| {
            logs.append(RUNS_FILE, &run)?;
            Ok(run)
        })
        .await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let (runs, _) = self.read(|logs| logs.runs()).await?;
        Ok(runs.into_iter().find(|r| r.run_id == run_id))
    }

    async fn get_runs(&self, filter: &RunsFilter) -> Result<Vec<Run>, StoreError> {
        let (runs, _) = self.read(|logs| logs.runs()).await?;
        Ok(runs.into_iter().filter(|r| filter.matches(r)).collect())
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<Run, StoreError> {
        self.write(move |logs| {
            let (mut runs, records) = logs.runs()?;
            let run = runs
                .iter_mut()
                .find(|r| r.run_id == run_id)
                .ok_or(StoreError::RunNotFound(run_id))?;
            run.status = status;
            let run = run.clone();

            if needs_compaction(records + 1, runs.len()) {
                logs.rewrite(RUNS_FILE, &runs)?;
            } else {
                logs.append(RUNS_FILE, &run)?;
            }
            Ok(run)
        })
        .await
    }

    async fn report_run_event(&self, run_id: Uuid, message: &str) -> Result<(), StoreError> {
        let event = RunEvent {
            run_id,
            timestamp: Utc::now(),
            message: message.to_string(),
        };
        self.write(move |logs| logs.append(RUN_EVENTS_FILE, &event))
            .await
    }

    async fn get_run_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>, StoreError> {
        let events = self
            .read(|logs| logs.read::<RunEvent>(RUN_EVENTS_FILE))
            .await?;
        Ok(events.into_iter().filter(|e| e.run_id == run_id).collect())
    }
}

#[async_trait]
impl PartitionStore for FileStorage {
    async fn has_dynamic_partition(
        &self,
        partitions_def_name: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError> {
        let partitions = self.read(|logs| logs.partitions()).await?;
        Ok(partitions
            .get(partitions_def_name)
            .map(|keys| keys.iter().any(|k| k == partition_key))
            .unwrap_or(false))
    }

    async fn get_dynamic_partitions(
        &self,
        partitions_def_name: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut partitions = self.read(|logs| logs.partitions()).await?;
        Ok(partitions.remove(partitions_def_name).unwrap_or_default())
    }

    async fn add_dynamic_partitions(
        &self,
        partitions_def_name: &str,
        partition_keys: &[String],
    ) -> Result<(), StoreError> {
        if partition_keys.is_empty() {
            return Ok(());
        }
        let record = PartitionRecord::Add {
            partitions_def_name: partitions_def_name.to_string(),
            partition_keys: partition_keys.to_vec(),
        };
        self.write(move |logs| logs.append(PARTITIONS_FILE, &record))
            .await
    }

    async fn delete_dynamic_partition(
        &self,
        partitions_def_name: &str,
        partition_key: &str,
    ) -> Result<(), StoreError> {
        let record = PartitionRecord::Delete {
            partitions_def_name: partitions_def_name.to_string(),
            partition_key: partition_key.to_string(),
        };
        self.write(move |logs| logs.append(PARTITIONS_FILE, &record))
            .await
    }
}

#[async_trait]
impl CursorStore for FileStorage {
    async fn get_cursor_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let records = self
            .read(|logs| logs.read::<CursorRecord>(CURSORS_FILE))
            .await?;
        Ok(records
            .into_iter()
            .rev()
            .find(|r| r.key == key)
            .map(|r| r.value))
    }

    async fn set_cursor_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let record = CursorRecord {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.write(move |logs| logs.append(CURSORS_FILE, &record))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Instigator, InstigatorOrigin, InstigatorStatus, NewRun};
    use tempfile::TempDir;

    fn create_test_store() -> (FileStorage, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = FileStorage::open(temp.path().join("storage")).unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn test_state_last_write_wins() {
        let (store, _temp) = create_test_store();
        let sensor = Instigator::new("s", InstigatorOrigin::new("loc", "repo"));

        store.add_instigator_state(sensor.initial_state()).await.unwrap();
        store
            .update_instigator_state(sensor.initial_state().with_status(InstigatorStatus::Stopped))
            .await
            .unwrap();

        let state = store
            .get_instigator_state(&sensor.selector_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, InstigatorStatus::Stopped);
        assert_eq!(store.all_instigator_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_update_keeps_creation_order() {
        let (store, _temp) = create_test_store();
        let first = store
            .create_tick(Tick::started("sel", "s", Utc::now()))
            .await
            .unwrap();
        let second = store
            .create_tick(Tick::started("sel", "s", Utc::now()))
            .await
            .unwrap();

        store
            .update_tick(&first.clone().with_status(TickStatus::Skipped))
            .await
            .unwrap();

        let ticks = store.get_ticks("sel", None).await.unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].tick_id, second.tick_id);
        assert_eq!(ticks[1].status, TickStatus::Skipped);

        let latest = store.get_ticks("sel", Some(1)).await.unwrap();
        assert_eq!(latest[0].tick_id, second.tick_id);
    }

    fn line_count(store: &FileStorage, name: &str) -> usize {
        std::fs::read_to_string(store.root().join(name))
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn test_purge_rewrites_tick_log() {
        let (store, _temp) = create_test_store();
        let old = Utc::now() - chrono::Duration::days(30);
        let skipped = store
            .create_tick(Tick::started("sel", "s", old))
            .await
            .unwrap();
        store
            .update_tick(&skipped.with_status(TickStatus::Skipped))
            .await
            .unwrap();
        store
            .create_tick(Tick::started("sel", "s", old).with_status(TickStatus::Failure))
            .await
            .unwrap();
        assert_eq!(line_count(&store, TICKS_FILE), 3);

        let purged = store
            .purge_ticks("sel", Utc::now(), &[TickStatus::Skipped])
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(line_count(&store, TICKS_FILE), 1);

        // Survives reopening
        let reopened = FileStorage::open(store.root()).unwrap();
        let ticks = reopened.get_ticks("sel", None).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].status, TickStatus::Failure);
    }

    #[tokio::test]
    async fn test_state_log_is_compacted() {
        let (store, _temp) = create_test_store();
        let sensor = Instigator::new("s", InstigatorOrigin::new("loc", "repo"));
        store.add_instigator_state(sensor.initial_state()).await.unwrap();

        for i in 0..300 {
            let data = crate::domain::SensorData {
                cursor: Some(i.to_string()),
                ..Default::default()
            };
            store
                .update_instigator_state(sensor.initial_state().with_data(data))
                .await
                .unwrap();
        }

        assert!(line_count(&store, STATES_FILE) < COMPACT_MIN_RECORDS);
        let reopened = FileStorage::open(store.root()).unwrap();
        let state = reopened
            .get_instigator_state(&sensor.selector_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.cursor(), Some("299"));
        assert_eq!(reopened.all_instigator_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_io_errors_name_the_file() {
        let (store, _temp) = create_test_store();
        std::fs::create_dir(store.root().join(STATES_FILE)).unwrap();

        match store.all_instigator_states().await {
            Err(StoreError::File { path, .. }) => assert!(path.ends_with(STATES_FILE)),
            other => panic!("expected a file error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_status_update_is_replayed() {
        let (store, _temp) = create_test_store();
        let run = store
            .add_run(Run::from_new_run(NewRun {
                job_name: "job".to_string(),
                run_config: serde_json::Value::Null,
                tags: Default::default(),
                origin: None,
                asset_selection: None,
            }))
            .await
            .unwrap();

        store
            .update_run_status(run.run_id, RunStatus::Queued)
            .await
            .unwrap();
        store
            .report_run_event(run.run_id, "queued by sensor")
            .await
            .unwrap();

        let loaded = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Queued);
        assert_eq!(store.get_runs(&RunsFilter::new()).await.unwrap().len(), 1);
        assert_eq!(store.get_run_events(run.run_id).await.unwrap().len(), 1);

        let missing = store.update_run_status(Uuid::new_v4(), RunStatus::Queued).await;
        assert!(matches!(missing, Err(StoreError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn test_partitions_and_cursors() {
        let (store, _temp) = create_test_store();
        let keys = vec!["a".to_string(), "b".to_string()];
        store.add_dynamic_partitions("files", &keys).await.unwrap();
        store.add_dynamic_partitions("files", &keys).await.unwrap();
        store.delete_dynamic_partition("files", "a").await.unwrap();

        assert_eq!(
            store.get_dynamic_partitions("files").await.unwrap(),
            vec!["b".to_string()]
        );

        assert!(store.get_cursor_value("flag").await.unwrap().is_none());
        store.set_cursor_value("flag", "true").await.unwrap();
        store.set_cursor_value("flag", "false").await.unwrap();
        assert_eq!(
            store.get_cursor_value("flag").await.unwrap().as_deref(),
            Some("false")
        );
    }
}
