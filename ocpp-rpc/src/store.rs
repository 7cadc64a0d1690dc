//! Crash-safe persistence for transaction-critical requests
//!
//! Billing-relevant operations (StartTransaction, StopTransaction) must
//! survive a power loss without duplication or loss. The store is an
//! append-only JSON-lines log in one container file: a record is written
//! *before* the request becomes eligible to send, and the confirmation is
//! durably marked once the response arrives. On boot the log is replayed;
//! unconfirmed records are turned back into live requests with their original
//! message ids, and the id/`op_nr` counters are re-seeded above everything
//! observed so nothing is ever reused.
//!
//! A store write failure degrades the queue to volatile best-effort instead
//! of blocking the engine.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::queue::SendQueue;
use crate::registry::OperationRegistry;
use crate::request::{MessageIdSource, Request};

/// Retry spacing for requests replayed from storage.
const RESTORE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// One persisted operation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRecord {
    /// RPC header: `[messageType, messageId, action]`.
    pub rpc: (u8, String, String),
    /// Global enqueue sequence number.
    pub op_nr: u64,
    /// Operation-defined state blob.
    pub payload: Value,
}

/// A line in the container file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum StoreEntry {
    /// Operation written before first send.
    #[serde(rename = "OP")]
    Op(OpRecord),

    /// The operation concluded (response durably received, or aborted);
    /// its record must not replay after a reboot.
    #[serde(rename = "DONE")]
    Done { op_nr: u64 },
}

/// Storage backend for the persistent queue.
pub trait OpStore: Send {
    /// Append an operation record. Must be durable before returning when the
    /// backend is configured to sync.
    fn append(&mut self, record: &OpRecord) -> io::Result<()>;

    /// Durably mark an operation as concluded.
    fn conclude(&mut self, op_nr: u64) -> io::Result<()>;

    /// Load all records that have not concluded, ordered by `op_nr`.
    fn load(&mut self) -> io::Result<Vec<OpRecord>>;
}

/// File store configuration.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Directory holding the container file.
    pub dir: PathBuf,
    /// Flush after every write.
    pub fsync_on_write: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./ocpp-data"),
            fsync_on_write: true,
        }
    }
}

/// JSON-lines container file, one record per line.
pub struct FileOpStore {
    config: FileStoreConfig,
    file: Option<BufWriter<File>>,
    pending: usize,
}

impl FileOpStore {
    pub fn new(config: FileStoreConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.dir)?;
        Ok(Self {
            config,
            file: None,
            pending: 0,
        })
    }

    fn path(&self) -> PathBuf {
        self.config.dir.join("ops.jsonl")
    }

    fn open_file(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path())?;
            self.file = Some(BufWriter::new(file));
        }
        Ok(())
    }

    fn write_entry(&mut self, entry: &StoreEntry) -> io::Result<()> {
        self.open_file()?;
        let writer = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "store not open"))?;
        let line = serde_json::to_string(entry)?;
        writeln!(writer, "{}", line)?;
        if self.config.fsync_on_write {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Once every record has concluded the container file is dead weight;
    /// start a fresh one.
    fn compact(&mut self) -> io::Result<()> {
        self.file = None;
        let path = self.path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        info!("operation store compacted");
        Ok(())
    }
}

impl OpStore for FileOpStore {
    fn append(&mut self, record: &OpRecord) -> io::Result<()> {
        self.write_entry(&StoreEntry::Op(record.clone()))?;
        self.pending += 1;
        debug!(op_nr = record.op_nr, action = %record.rpc.2, "operation persisted");
        Ok(())
    }

    fn conclude(&mut self, op_nr: u64) -> io::Result<()> {
        self.write_entry(&StoreEntry::Done { op_nr })?;
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            self.compact()?;
        }
        Ok(())
    }

    fn load(&mut self) -> io::Result<Vec<OpRecord>> {
        let path = self.path();
        let mut open_records: BTreeMap<u64, OpRecord> = BTreeMap::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_nr, line) in reader.lines().enumerate() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(line_nr, "store read error: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoreEntry>(&line) {
                    Ok(StoreEntry::Op(record)) => {
                        open_records.insert(record.op_nr, record);
                    }
                    Ok(StoreEntry::Done { op_nr }) => {
                        open_records.remove(&op_nr);
                    }
                    Err(e) => {
                        // A torn tail line from a power loss is expected;
                        // everything before it is intact.
                        warn!(line_nr, "skipping corrupt store line: {}", e);
                    }
                }
            }
        }

        self.pending = open_records.len();
        Ok(open_records.into_values().collect())
    }
}

/// In-memory store for tests. The backing vector can be shared between
/// instances to simulate a reboot without touching the filesystem.
#[derive(Clone, Default)]
pub struct MemoryOpStore {
    entries: Arc<Mutex<Vec<StoreEntry>>>,
}

impl MemoryOpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A second handle over the same backing entries.
    pub fn shared(&self) -> Self {
        self.clone()
    }
}

impl OpStore for MemoryOpStore {
    fn append(&mut self, record: &OpRecord) -> io::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StoreEntry::Op(record.clone()));
        Ok(())
    }

    fn conclude(&mut self, op_nr: u64) -> io::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StoreEntry::Done { op_nr });
        Ok(())
    }

    fn load(&mut self) -> io::Result<Vec<OpRecord>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut open_records: BTreeMap<u64, OpRecord> = BTreeMap::new();
        for entry in entries.iter() {
            match entry {
                StoreEntry::Op(record) => {
                    open_records.insert(record.op_nr, record.clone());
                }
                StoreEntry::Done { op_nr } => {
                    open_records.remove(op_nr);
                }
            }
        }
        Ok(open_records.into_values().collect())
    }
}

/// Flash-backed FIFO send queue for transaction-critical requests.
pub struct PersistentQueue<S: OpStore> {
    name: String,
    active: bool,
    entries: VecDeque<Request>,
    store: S,
}

impl<S: OpStore> PersistentQueue<S> {
    pub fn new(name: impl Into<String>, store: S) -> Self {
        Self {
            name: name.into(),
            active: true,
            entries: VecDeque::new(),
            store,
        }
    }

    /// Create the queue in the gated state.
    pub fn gated(name: impl Into<String>, store: S) -> Self {
        let mut queue = Self::new(name, store);
        queue.active = false;
        queue
    }
}

impl<S: OpStore> SendQueue for PersistentQueue<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn front_op_nr(&self) -> Option<u64> {
        self.entries.front().map(|r| r.op_nr())
    }

    fn front_mut(&mut self) -> Option<&mut Request> {
        self.entries.front_mut()
    }

    fn pop_front(&mut self) -> Option<Request> {
        self.entries.pop_front()
    }

    fn push(&mut self, request: Request) {
        let record = OpRecord {
            rpc: (
                2,
                request.message_id().unwrap_or_default().to_string(),
                request.operation_type().to_string(),
            ),
            op_nr: request.op_nr(),
            payload: request.operation().snapshot().unwrap_or(Value::Null),
        };

        // Written before the request is eligible to send. If the flash is
        // unhappy the request continues volatile rather than blocking the
        // whole engine.
        if let Err(e) = self.store.append(&record) {
            warn!(
                queue = %self.name,
                action = %record.rpc.2,
                "store write failed, continuing volatile: {}",
                e
            );
        }
        self.entries.push_back(request);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn note_front_concluded(&mut self, request: &Request) {
        if let Err(e) = self.store.conclude(request.op_nr()) {
            warn!(queue = %self.name, "store conclude failed: {}", e);
        }
    }

    fn restore(
        &mut self,
        registry: &OperationRegistry,
        ids: &mut MessageIdSource,
        next_op_nr: &mut u64,
    ) -> usize {
        let records = match self.store.load() {
            Ok(records) => records,
            Err(e) => {
                warn!(queue = %self.name, "store load failed, starting empty: {}", e);
                return 0;
            }
        };

        let mut restored = 0;
        for record in records {
            let (_, message_id, action) = &record.rpc;

            let Some(mut operation) = registry.make_restored(action) else {
                warn!(action = %action, op_nr = record.op_nr, "no restore factory, dropping record");
                continue;
            };
            operation.restore(&record.payload);

            ids.observe(message_id);
            if record.op_nr >= *next_op_nr {
                *next_op_nr = record.op_nr + 1;
            }

            info!(
                queue = %self.name,
                action = %action,
                message_id = %message_id,
                op_nr = record.op_nr,
                "replaying persisted operation"
            );
            self.entries.push_back(Request::restored(
                operation,
                message_id.clone(),
                record.op_nr,
                RESTORE_RETRY_INTERVAL,
            ));
            restored += 1;
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use tempfile::tempdir;

    struct TxOp {
        meter_start: i64,
    }

    impl Operation for TxOp {
        fn operation_type(&self) -> &str {
            "StartTransaction"
        }
        fn snapshot(&self) -> Option<Value> {
            Some(serde_json::json!({"meterStart": self.meter_start}))
        }
        fn restore(&mut self, blob: &Value) {
            self.meter_start = blob["meterStart"].as_i64().unwrap_or(0);
        }
    }

    fn registry_with_tx() -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        registry.register_restore("StartTransaction", || Box::new(TxOp { meter_start: 0 }));
        registry
    }

    fn record(op_nr: u64, message_id: &str) -> OpRecord {
        OpRecord {
            rpc: (2, message_id.into(), "StartTransaction".into()),
            op_nr,
            payload: serde_json::json!({"meterStart": 1500}),
        }
    }

    #[test]
    fn test_file_store_roundtrip() -> io::Result<()> {
        let dir = tempdir()?;
        let config = FileStoreConfig {
            dir: dir.path().to_path_buf(),
            fsync_on_write: false,
        };

        {
            let mut store = FileOpStore::new(config.clone())?;
            store.append(&record(1, "10"))?;
            store.append(&record(2, "11"))?;
            store.conclude(1)?;
        }

        {
            let mut store = FileOpStore::new(config)?;
            let records = store.load()?;
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].op_nr, 2);
            assert_eq!(records[0].rpc.1, "11");
        }

        Ok(())
    }

    #[test]
    fn test_file_store_compacts_when_all_concluded() -> io::Result<()> {
        let dir = tempdir()?;
        let config = FileStoreConfig {
            dir: dir.path().to_path_buf(),
            fsync_on_write: false,
        };

        let mut store = FileOpStore::new(config)?;
        store.append(&record(1, "10"))?;
        store.conclude(1)?;

        assert!(!dir.path().join("ops.jsonl").exists());
        Ok(())
    }

    #[test]
    fn test_file_store_tolerates_torn_tail() -> io::Result<()> {
        let dir = tempdir()?;
        let config = FileStoreConfig {
            dir: dir.path().to_path_buf(),
            fsync_on_write: false,
        };

        {
            let mut store = FileOpStore::new(config.clone())?;
            store.append(&record(1, "10"))?;
        }
        // Simulate a power loss mid-write.
        let path = dir.path().join("ops.jsonl");
        let mut contents = fs::read_to_string(&path)?;
        contents.push_str("{\"type\":\"OP\",\"rpc\":[2,\"11");
        fs::write(&path, contents)?;

        let mut store = FileOpStore::new(config)?;
        let records = store.load()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rpc.1, "10");
        Ok(())
    }

    #[test]
    fn test_restore_rebuilds_pending_and_seeds_counters() {
        let backing = MemoryOpStore::new();
        {
            let mut queue = PersistentQueue::new("transactions", backing.shared());
            let mut req = Request::new(Box::new(TxOp { meter_start: 1500 }));
            let mut ids = MessageIdSource::new();
            ids.observe("41");
            req.ensure_message_id(&mut ids);
            req.set_op_nr(7);
            queue.push(req);
            // Queue dropped here: the "power loss".
        }

        let mut queue = PersistentQueue::new("transactions", backing.shared());
        let registry = registry_with_tx();
        let mut ids = MessageIdSource::new();
        let mut next_op_nr = 1;

        let restored = queue.restore(&registry, &mut ids, &mut next_op_nr);
        assert_eq!(restored, 1);
        assert_eq!(queue.front_op_nr(), Some(7));

        let front = queue.front_mut().unwrap();
        // Original message id survives the reboot.
        assert_eq!(front.message_id(), Some("42"));

        // Counters never go backward past what was observed.
        assert_eq!(ids.next_id(), "43");
        assert_eq!(next_op_nr, 8);
    }

    #[test]
    fn test_confirmed_operation_does_not_replay() {
        let backing = MemoryOpStore::new();
        {
            let mut queue = PersistentQueue::new("transactions", backing.shared());
            let mut req = Request::new(Box::new(TxOp { meter_start: 1500 }));
            let mut ids = MessageIdSource::new();
            req.ensure_message_id(&mut ids);
            req.set_op_nr(1);
            queue.push(req);

            let req = queue.pop_front().expect("request present");
            queue.note_front_concluded(&req);
        }

        let mut queue = PersistentQueue::new("transactions", backing.shared());
        let registry = registry_with_tx();
        let mut ids = MessageIdSource::new();
        let mut next_op_nr = 1;

        assert_eq!(queue.restore(&registry, &mut ids, &mut next_op_nr), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_restored_operation_state_roundtrips() {
        let backing = MemoryOpStore::new();
        {
            let mut queue = PersistentQueue::new("transactions", backing.shared());
            let mut req = Request::new(Box::new(TxOp { meter_start: 1500 }));
            let mut ids = MessageIdSource::new();
            req.ensure_message_id(&mut ids);
            req.set_op_nr(1);
            queue.push(req);
        }

        let mut queue = PersistentQueue::new("transactions", backing.shared());
        let registry = registry_with_tx();
        let mut ids = MessageIdSource::new();
        let mut next_op_nr = 1;
        queue.restore(&registry, &mut ids, &mut next_op_nr);

        let front = queue.front_mut().unwrap();
        let snapshot = front.operation().snapshot().unwrap();
        assert_eq!(snapshot["meterStart"], 1500);
    }

    #[test]
    fn test_store_failure_degrades_to_volatile() {
        struct BrokenStore;
        impl OpStore for BrokenStore {
            fn append(&mut self, _: &OpRecord) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "flash dead"))
            }
            fn conclude(&mut self, _: u64) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "flash dead"))
            }
            fn load(&mut self) -> io::Result<Vec<OpRecord>> {
                Err(io::Error::new(io::ErrorKind::Other, "flash dead"))
            }
        }

        let mut queue = PersistentQueue::new("transactions", BrokenStore);
        let mut req = Request::new(Box::new(TxOp { meter_start: 1 }));
        let mut ids = MessageIdSource::new();
        req.ensure_message_id(&mut ids);
        req.set_op_nr(1);

        // Push must not fail or drop the request.
        queue.push(req);
        assert_eq!(queue.len(), 1);

        // Restore of a broken store starts empty instead of crashing.
        let registry = registry_with_tx();
        let mut next_op_nr = 1;
        assert_eq!(queue.restore(&registry, &mut ids, &mut next_op_nr), 0);
    }
}
