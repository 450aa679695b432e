//! Asynchronous recording store.
//!
//! [`RecordingStore`] moves a [`Storage`] onto a dedicated worker thread and
//! feeds it jobs through a FIFO queue, so blocking database I/O never runs on
//! the sensor dispatch task and writes commit in the order they were queued.
//!
//! After each job the worker publishes change notifications to the observer
//! registry. Observers receive the current value when they subscribe and one
//! update per committed change that touches what they watch.

use std::collections::BTreeSet;
use std::thread::JoinHandle;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::calibration::CalibratedAltitude;
use crate::error::{Error, Result};
use crate::recording::{NewEntry, Recording, RecordingEntry, RecordingWithEntries};
use crate::storage::{Storage, StorageStats};

/// Attempts made for one entry append before giving up.
const APPEND_ATTEMPTS: u32 = 2;

type Job = Box<dyn FnOnce(&mut Worker) + Send>;

/// Result of appending an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    /// The persisted entry.
    pub entry: RecordingEntry,
    /// The entry that preceded it in the same recording, if any.
    pub previous: Option<RecordingEntry>,
}

/// A pending reply from the store worker.
pub type Pending<T> = oneshot::Receiver<Result<T>>;

/// A live query whose results are pushed on every relevant change.
#[derive(Debug)]
pub struct Observation<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Observation<T> {
    /// Wait for the next value. Returns `None` once the store has shut down.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a value if one is already queued.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// What a committed write touched.
#[derive(Debug, Default)]
struct Changes {
    recordings: bool,
    touched: BTreeSet<i64>,
}

impl Changes {
    fn recording(&mut self, id: i64) {
        self.recordings = true;
        self.touched.insert(id);
    }

    fn entries(&mut self, recording_id: i64) {
        self.touched.insert(recording_id);
    }

    fn is_empty(&self) -> bool {
        !self.recordings && self.touched.is_empty()
    }
}

/// Subscriptions, keyed by the query they watch.
#[derive(Debug, Default)]
struct Observers {
    all: Vec<mpsc::UnboundedSender<Vec<Recording>>>,
    by_recording: Vec<(i64, mpsc::UnboundedSender<Option<RecordingWithEntries>>)>,
}

/// State owned by the worker thread.
struct Worker {
    storage: Storage,
    observers: Observers,
    changes: Changes,
    stopping: bool,
}

impl Worker {
    fn publish(&mut self) {
        let changes = std::mem::take(&mut self.changes);
        if changes.is_empty() {
            return;
        }

        if changes.recordings && !self.observers.all.is_empty() {
            match self.storage.list_recordings() {
                Ok(recordings) => self
                    .observers
                    .all
                    .retain(|tx| tx.send(recordings.clone()).is_ok()),
                Err(e) => warn!("Failed to refresh recordings observers: {}", e),
            }
        }

        for id in changes.touched {
            if !self.observers.by_recording.iter().any(|(rid, _)| *rid == id) {
                continue;
            }
            match self.storage.get_recording_with_entries(id) {
                Ok(snapshot) => self.observers.by_recording.retain(|(rid, tx)| {
                    *rid != id || tx.send(snapshot.clone()).is_ok()
                }),
                Err(e) => warn!("Failed to refresh observers of recording {}: {}", id, e),
            }
        }
    }

    fn append(&mut self, entry: &NewEntry) -> Result<AppendOutcome> {
        let mut last_error = None;
        for attempt in 1..=APPEND_ATTEMPTS {
            match self.try_append(entry) {
                Ok(outcome) => {
                    self.changes.entries(entry.recording_id);
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(
                        "Append to recording {} failed (attempt {}/{}): {}",
                        entry.recording_id, attempt, APPEND_ATTEMPTS, e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(Error::PersistenceFailure {
            attempts: APPEND_ATTEMPTS,
            message: last_error.map_or_else(String::new, |e| e.to_string()),
        })
    }

    fn try_append(&self, entry: &NewEntry) -> Result<AppendOutcome> {
        let previous = self.storage.last_entry(entry.recording_id)?;
        let entry = self.storage.add_entry(entry)?;
        Ok(AppendOutcome { entry, previous })
    }
}

/// Handle to the recording store worker.
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    jobs: mpsc::UnboundedSender<Job>,
}

impl RecordingStore {
    /// Start a worker thread that owns `storage`.
    ///
    /// Returns the handle and the worker's join handle; the worker exits
    /// after every handle has been dropped and the queue has drained.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned.
    pub fn spawn(storage: Storage) -> Result<(Self, JoinHandle<()>)> {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let path = storage.path().display().to_string();

        let handle = std::thread::Builder::new()
            .name("recording-store".to_string())
            .spawn(move || {
                let mut worker = Worker {
                    storage,
                    observers: Observers::default(),
                    changes: Changes::default(),
                    stopping: false,
                };
                debug!("Recording store worker started for {}", path);
                while let Some(job) = rx.blocking_recv() {
                    job(&mut worker);
                    worker.publish();
                    if worker.stopping {
                        break;
                    }
                }
                info!("Recording store worker stopped");
            })?;

        Ok((Self { jobs }, handle))
    }

    /// Spawn a store backed by a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or worker cannot be created.
    pub fn in_memory() -> Result<Self> {
        let (store, _worker) = Self::spawn(Storage::open_in_memory()?)?;
        Ok(store)
    }

    fn enqueue<T, F>(&self, f: F) -> Result<Pending<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move |worker: &mut Worker| {
                let _ = tx.send(f(worker));
            }))
            .map_err(|_| Error::StoreClosed)?;
        Ok(rx)
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> Result<T> + Send + 'static,
    {
        self.enqueue(f)?.await.map_err(|_| Error::StoreClosed)?
    }

    // === Recordings ===

    /// Create a recording stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails or the store is closed.
    pub async fn add_recording(&self, name: impl Into<String>) -> Result<Recording> {
        let name = name.into();
        self.call(move |w| {
            let recording = w.storage.add_recording(&name, Utc::now())?;
            w.changes.recording(recording.id);
            Ok(recording)
        })
        .await
    }

    /// Create several recordings at once.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails or the store is closed.
    pub async fn add_recordings(&self, names: Vec<String>) -> Result<Vec<Recording>> {
        self.call(move |w| {
            let created = w.storage.add_recordings(&names, Utc::now())?;
            for recording in &created {
                w.changes.recording(recording.id);
            }
            Ok(created)
        })
        .await
    }

    /// Persist a renamed recording.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordingNotFound`] if the recording does not exist.
    pub async fn update_recording(&self, recording: Recording) -> Result<()> {
        self.call(move |w| {
            if !w.storage.update_recording(&recording)? {
                return Err(Error::RecordingNotFound(recording.id));
            }
            w.changes.recording(recording.id);
            Ok(())
        })
        .await
    }

    /// Rename a recording by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordingNotFound`] if the recording does not exist.
    pub async fn rename_recording(&self, id: i64, name: impl Into<String>) -> Result<Recording> {
        let name = name.into();
        self.call(move |w| {
            let mut recording = w
                .storage
                .get_recording(id)?
                .ok_or(Error::RecordingNotFound(id))?;
            recording.name = name;
            w.storage.update_recording(&recording)?;
            w.changes.recording(id);
            Ok(recording)
        })
        .await
    }

    /// Delete a recording and its entries. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails or the store is closed.
    pub async fn remove_recording(&self, id: i64) -> Result<bool> {
        self.call(move |w| {
            let removed = w.storage.remove_recording(id)?;
            if removed {
                w.changes.recording(id);
            }
            Ok(removed)
        })
        .await
    }

    /// Delete several recordings. Returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails or the store is closed.
    pub async fn remove_recordings(&self, ids: Vec<i64>) -> Result<usize> {
        self.call(move |w| {
            let removed = w.storage.remove_recordings(&ids)?;
            for &id in &removed {
                w.changes.recording(id);
            }
            Ok(removed.len())
        })
        .await
    }

    /// Get one recording.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the store is closed.
    pub async fn get_recording(&self, id: i64) -> Result<Option<Recording>> {
        self.call(move |w| w.storage.get_recording(id)).await
    }

    /// All recordings, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the store is closed.
    pub async fn list_recordings(&self) -> Result<Vec<Recording>> {
        self.call(|w| w.storage.list_recordings()).await
    }

    // === Entries ===

    /// Queue an append without waiting for it.
    ///
    /// A failed insert is retried once in the same queue slot, so later
    /// appends cannot overtake it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] if the worker has stopped.
    pub fn enqueue_append(&self, entry: NewEntry) -> Result<Pending<AppendOutcome>> {
        self.enqueue(move |w| w.append(&entry))
    }

    /// Append an entry and wait for the commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PersistenceFailure`] if both attempts fail.
    pub async fn append_entry(&self, entry: NewEntry) -> Result<AppendOutcome> {
        self.enqueue_append(entry)?
            .await
            .map_err(|_| Error::StoreClosed)?
    }

    /// Append several entries in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; nothing is written in that case.
    pub async fn add_entries(&self, entries: Vec<NewEntry>) -> Result<Vec<RecordingEntry>> {
        self.call(move |w| {
            let inserted = w.storage.add_entries(&entries)?;
            for entry in &inserted {
                w.changes.entries(entry.recording_id);
            }
            Ok(inserted)
        })
        .await
    }

    /// Fetch a recording with its entries in one consistent read.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the store is closed.
    pub async fn get_recording_with_entries(&self, id: i64) -> Result<Option<RecordingWithEntries>> {
        self.call(move |w| w.storage.get_recording_with_entries(id))
            .await
    }

    // === Observation ===

    /// Watch the list of recordings.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial query fails or the store is closed.
    pub async fn observe_all(&self) -> Result<Observation<Vec<Recording>>> {
        self.call(|w| {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(w.storage.list_recordings()?);
            w.observers.all.push(tx);
            Ok(Observation { rx })
        })
        .await
    }

    /// Watch one recording and its entries.
    ///
    /// Yields `None` if the recording does not exist or is deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial query fails or the store is closed.
    pub async fn observe_recording_with_entries(
        &self,
        id: i64,
    ) -> Result<Observation<Option<RecordingWithEntries>>> {
        self.call(move |w| {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(w.storage.get_recording_with_entries(id)?);
            w.observers.by_recording.push((id, tx));
            Ok(Observation { rx })
        })
        .await
    }

    // === Calibration ===

    /// The persisted calibration reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the store is closed.
    pub async fn calibration(&self) -> Result<Option<CalibratedAltitude>> {
        self.call(|w| w.storage.calibration()).await
    }

    /// Queue an insert-or-replace of the calibration reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] if the worker has stopped.
    pub fn enqueue_calibration(&self, reference: CalibratedAltitude) -> Result<Pending<()>> {
        self.enqueue(move |w| w.storage.set_calibration(&reference))
    }

    /// Insert or replace the calibration reference and wait for the commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the store is closed.
    pub async fn set_calibration(&self, reference: CalibratedAltitude) -> Result<()> {
        self.enqueue_calibration(reference)?
            .await
            .map_err(|_| Error::StoreClosed)?
    }

    // === Maintenance ===

    /// Database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the store is closed.
    pub async fn stats(&self) -> Result<StorageStats> {
        self.call(|w| w.storage.stats()).await
    }

    /// Wait until every job queued before this call has committed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] if the worker has stopped.
    pub async fn flush(&self) -> Result<()> {
        self.call(|_| Ok(())).await
    }

    /// Drain the queue and stop the worker.
    ///
    /// Jobs queued before this call still run. Anything queued afterwards,
    /// through this or any other handle, fails with [`Error::StoreClosed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] if the worker had already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|w| {
            w.stopping = true;
            Ok(())
        })
        .await
    }
}

/// Stop a worker once every handle is gone, logging a panic if one occurred.
pub fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("Recording store worker panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn new_entry(recording_id: i64, secs: i64, alt: f64) -> NewEntry {
        NewEntry {
            recording_id,
            timestamp: t(secs),
            latitude: 0.0,
            longitude: 0.0,
            altitude: alt,
        }
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let store = RecordingStore::in_memory().unwrap();
        let rec = store.add_recording("Flight").await.unwrap();
        let all = store.list_recordings().await.unwrap();
        assert_eq!(all, vec![rec]);
    }

    #[tokio::test]
    async fn test_append_returns_previous() {
        let store = RecordingStore::in_memory().unwrap();
        let rec = store.add_recording("Flight").await.unwrap();

        let first = store.append_entry(new_entry(rec.id, 0, 100.0)).await.unwrap();
        assert!(first.previous.is_none());

        let second = store.append_entry(new_entry(rec.id, 10, 110.0)).await.unwrap();
        assert_eq!(second.previous, Some(first.entry));
    }

    #[tokio::test]
    async fn test_append_to_missing_recording_fails_after_retry() {
        let store = RecordingStore::in_memory().unwrap();
        let err = store.append_entry(new_entry(77, 0, 0.0)).await.unwrap_err();
        match err {
            Error::PersistenceFailure { attempts, .. } => assert_eq!(attempts, APPEND_ATTEMPTS),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_enqueued_appends_commit_in_order() {
        let store = RecordingStore::in_memory().unwrap();
        let rec = store.add_recording("Flight").await.unwrap();

        let pending: Vec<_> = (0..50)
            .map(|i| store.enqueue_append(new_entry(rec.id, i, 0.0)).unwrap())
            .collect();
        let mut ids = Vec::new();
        for rx in pending {
            ids.push(rx.await.unwrap().unwrap().entry.id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let rwe = store.get_recording_with_entries(rec.id).await.unwrap().unwrap();
        assert_eq!(rwe.entries.len(), 50);
        assert!(rwe
            .entries
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_rename_and_update() {
        let store = RecordingStore::in_memory().unwrap();
        let rec = store.add_recording("old").await.unwrap();

        let renamed = store.rename_recording(rec.id, "new").await.unwrap();
        assert_eq!(renamed.name, "new");
        assert_eq!(renamed.timestamp, rec.timestamp);

        let missing = store.rename_recording(999, "x").await.unwrap_err();
        assert!(matches!(missing, Error::RecordingNotFound(999)));

        let mut again = renamed.clone();
        again.name = "newer".to_string();
        store.update_recording(again).await.unwrap();
        let fetched = store.get_recording(rec.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "newer");
    }

    #[tokio::test]
    async fn test_observe_all_pushes_on_change() {
        let store = RecordingStore::in_memory().unwrap();
        let mut obs = store.observe_all().await.unwrap();
        assert_eq!(obs.next().await.unwrap(), vec![]);

        let rec = store.add_recording("one").await.unwrap();
        assert_eq!(obs.next().await.unwrap(), vec![rec.clone()]);

        store.rename_recording(rec.id, "renamed").await.unwrap();
        assert_eq!(obs.next().await.unwrap()[0].name, "renamed");

        store.remove_recording(rec.id).await.unwrap();
        assert!(obs.next().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_observe_all_ignores_entry_appends() {
        let store = RecordingStore::in_memory().unwrap();
        let rec = store.add_recording("one").await.unwrap();
        let mut obs = store.observe_all().await.unwrap();
        obs.next().await.unwrap();

        store.append_entry(new_entry(rec.id, 0, 0.0)).await.unwrap();
        store.flush().await.unwrap();
        assert!(obs.try_next().is_none());
    }

    #[tokio::test]
    async fn test_observe_recording_isolation() {
        let store = RecordingStore::in_memory().unwrap();
        let a = store.add_recording("a").await.unwrap();
        let b = store.add_recording("b").await.unwrap();

        let mut obs = store.observe_recording_with_entries(a.id).await.unwrap();
        let initial = obs.next().await.unwrap().unwrap();
        assert!(initial.entries.is_empty());

        store.append_entry(new_entry(a.id, 0, 1.0)).await.unwrap();
        store.flush().await.unwrap();
        let update = obs.try_next().expect("one update for own append").unwrap();
        assert_eq!(update.entries.len(), 1);
        assert!(obs.try_next().is_none());

        store.append_entry(new_entry(b.id, 0, 1.0)).await.unwrap();
        store.flush().await.unwrap();
        assert!(obs.try_next().is_none());
    }

    #[tokio::test]
    async fn test_observe_recording_deleted() {
        let store = RecordingStore::in_memory().unwrap();
        let rec = store.add_recording("a").await.unwrap();
        let mut obs = store.observe_recording_with_entries(rec.id).await.unwrap();
        obs.next().await.unwrap();

        store.remove_recording(rec.id).await.unwrap();
        assert_eq!(obs.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batch_remove_notifies_only_deleted() {
        let store = RecordingStore::in_memory().unwrap();
        let a = store.add_recording("a").await.unwrap();
        let mut gone = store.observe_recording_with_entries(a.id).await.unwrap();
        let mut missing = store.observe_recording_with_entries(999).await.unwrap();
        gone.next().await.unwrap();
        assert_eq!(missing.next().await.unwrap(), None);

        assert_eq!(store.remove_recordings(vec![a.id, 999]).await.unwrap(), 1);
        store.flush().await.unwrap();

        assert_eq!(gone.try_next().expect("deleted recording pushed"), None);
        assert!(missing.try_next().is_none());
    }

    #[tokio::test]
    async fn test_dropped_observer_is_pruned() {
        let store = RecordingStore::in_memory().unwrap();
        let obs = store.observe_all().await.unwrap();
        drop(obs);

        store.add_recording("one").await.unwrap();
        assert_eq!(store.list_recordings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_calibration_round_trip() {
        let store = RecordingStore::in_memory().unwrap();
        assert!(store.calibration().await.unwrap().is_none());

        let reference = CalibratedAltitude {
            pressure: 1013.25,
            altitude: 12.0,
            timestamp: t(0),
        };
        store.set_calibration(reference).await.unwrap();
        assert_eq!(store.calibration().await.unwrap(), Some(reference));
    }

    #[tokio::test]
    async fn test_add_entries_batch_notifies_once() {
        let store = RecordingStore::in_memory().unwrap();
        let rec = store.add_recording("a").await.unwrap();
        let mut obs = store.observe_recording_with_entries(rec.id).await.unwrap();
        obs.next().await.unwrap();

        let batch = (0..3).map(|i| new_entry(rec.id, i, 0.0)).collect();
        store.add_entries(batch).await.unwrap();
        store.flush().await.unwrap();

        assert_eq!(obs.try_next().unwrap().unwrap().entries.len(), 3);
        assert!(obs.try_next().is_none());
    }

    #[tokio::test]
    async fn test_worker_stops_when_handles_dropped() {
        let (store, worker) = RecordingStore::spawn(Storage::open_in_memory().unwrap()).unwrap();
        store.add_recording("a").await.unwrap();
        drop(store);
        tokio::task::spawn_blocking(move || join_worker(worker))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (store, worker) = RecordingStore::spawn(Storage::open_in_memory().unwrap()).unwrap();
        let rec = store.add_recording("a").await.unwrap();
        let pending: Vec<_> = (0..5)
            .map(|i| store.enqueue_append(new_entry(rec.id, i, 0.0)).unwrap())
            .collect();
        let other = store.clone();

        store.shutdown().await.unwrap();
        tokio::task::spawn_blocking(move || join_worker(worker))
            .await
            .unwrap();

        for p in pending {
            assert!(p.await.unwrap().is_ok());
        }
        assert!(matches!(
            other.list_recordings().await,
            Err(Error::StoreClosed)
        ));
        assert!(matches!(store.shutdown().await, Err(Error::StoreClosed)));
    }

    #[tokio::test]
    async fn test_entries_keep_millisecond_order() {
        let store = RecordingStore::in_memory().unwrap();
        let rec = store.add_recording("a").await.unwrap();
        let mut e = new_entry(rec.id, 0, 0.0);
        for _ in 0..3 {
            e.timestamp += Duration::milliseconds(250);
            store.append_entry(e.clone()).await.unwrap();
        }
        let rwe = store.get_recording_with_entries(rec.id).await.unwrap().unwrap();
        assert_eq!(
            rwe.entries.last().unwrap().timestamp,
            t(0) + Duration::milliseconds(750)
        );
    }
}
