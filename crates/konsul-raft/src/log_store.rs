//! The sled-backed Raft log store: implements the openraft `RaftLogStorage`
//! trait's method set (`append`, `truncate`, `purge`, `get_log_state`,
//! `save_vote`/`read_vote`, `save_committed`/`read_committed`,
//! `get_log_reader`) as plain `async fn` (openraft uses RPITIT, not
//! `#[async_trait]`).
//!
//! Log entries are stored directly in a `sled::Tree` keyed by big-endian
//! `u64` index -- the simplest encoding that preserves sled's natural key
//! ordering for range scans, without a generic key-space abstraction layered
//! on top.

use std::ops::RangeBounds;
use std::sync::Arc;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use konsul_raft_store::TypeConfig;
use log::debug;
use log::info;
use openraft::storage::LogFlushed;
use openraft::storage::RaftLogReader;
use openraft::storage::RaftLogStorage;
use openraft::AnyError;
use openraft::Entry;
use openraft::LogId;
use openraft::LogState;
use openraft::OptionalSend;
use openraft::RaftLogId;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::Vote;

type NodeId = konsul_raft_store::NodeId;

const VOTE_KEY: &[u8] = b"vote";
const COMMITTED_KEY: &[u8] = b"committed";
const LAST_PURGED_KEY: &[u8] = b"last_purged";

fn index_key(index: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, index);
    buf
}

fn read_err(context: &'static str, err: impl std::fmt::Display) -> StorageError<NodeId> {
    StorageIOError::read_logs(&AnyError::error(format!("{context}: {err}"))).into()
}

fn write_err(context: &'static str, err: impl std::fmt::Display) -> StorageError<NodeId> {
    StorageIOError::write_logs(&AnyError::error(format!("{context}: {err}"))).into()
}

/// Sled-backed log and vote/committed store. `Clone` is cheap: every handle
/// shares the same underlying `sled::Tree`s (sled handles themselves are
/// reference-counted), which is what lets `get_log_reader` hand back `self`.
#[derive(Clone)]
pub struct SledLogStore {
    logs: sled::Tree,
    meta: sled::Tree,
    db: Arc<sled::Db>,
}

impl SledLogStore {
    pub fn open(db: sled::Db) -> Result<Self, sled::Error> {
        let logs = db.open_tree("konsul_raft_logs")?;
        let meta = db.open_tree("konsul_raft_meta")?;
        Ok(SledLogStore {
            logs,
            meta,
            db: Arc::new(db),
        })
    }

    fn get_last_purged(&self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        match self.meta.get(LAST_PURGED_KEY).map_err(|e| read_err("get_last_purged", e))? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| read_err("get_last_purged decode", e)),
        }
    }
}

impl RaftLogReader<TypeConfig> for SledLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + std::fmt::Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(i) => *i,
            std::ops::Bound::Excluded(i) => i + 1,
            std::ops::Bound::Unbounded => 0,
        };

        let mut out = Vec::new();
        for item in self.logs.range(index_key(start)..) {
            let (key, value) = item.map_err(|e| read_err("try_get_log_entries", e))?;
            let index = BigEndian::read_u64(&key);
            if !range.contains(&index) {
                if matches!(range.end_bound(), std::ops::Bound::Excluded(e) if index >= *e) {
                    break;
                }
                continue;
            }
            let entry: Entry<TypeConfig> = serde_json::from_slice(&value).map_err(|e| read_err("decode entry", e))?;
            out.push(entry);
        }
        Ok(out)
    }
}

impl RaftLogStorage<TypeConfig> for SledLogStore {
    type LogReader = SledLogStore;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged_log_id = self.get_last_purged()?;

        let last = self
            .logs
            .last()
            .map_err(|e| read_err("get_log_state", e))?
            .map(|(_, v)| serde_json::from_slice::<Entry<TypeConfig>>(&v))
            .transpose()
            .map_err(|e| read_err("get_log_state decode", e))?;

        let last_log_id = match last {
            None => last_purged_log_id,
            Some(entry) => Some(*entry.get_log_id()),
        };

        debug!("konsul-raft: get_log_state last_purged={last_purged_log_id:?} last={last_log_id:?}");

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_committed(&mut self, committed: Option<LogId<NodeId>>) -> Result<(), StorageError<NodeId>> {
        match committed {
            None => {
                self.meta.remove(COMMITTED_KEY).map_err(|e| write_err("save_committed", e))?;
            }
            Some(id) => {
                let bytes = serde_json::to_vec(&id).map_err(|e| write_err("save_committed encode", e))?;
                self.meta
                    .insert(COMMITTED_KEY, bytes)
                    .map_err(|e| write_err("save_committed", e))?;
            }
        }
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        match self.meta.get(COMMITTED_KEY).map_err(|e| read_err("read_committed", e))? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| read_err("read_committed decode", e)),
        }
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        info!("konsul-raft: save_vote {vote:?}");
        let bytes = serde_json::to_vec(vote).map_err(|e| write_err("save_vote encode", e))?;
        self.meta.insert(VOTE_KEY, bytes).map_err(|e| write_err("save_vote", e))?;
        self.meta.flush_async().await.map_err(|e| write_err("save_vote flush", e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        match self.meta.get(VOTE_KEY).map_err(|e| read_err("read_vote", e))? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| read_err("read_vote decode", e)),
        }
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut batch = sled::Batch::default();
        for entry in entries {
            let index = entry.get_log_id().index;
            let bytes = serde_json::to_vec(&entry).map_err(|e| write_err("append encode", e))?;
            batch.insert(&index_key(index), bytes);
        }

        let res = self
            .logs
            .apply_batch(batch)
            .map_err(|e| write_err("append", e))
            .and_then(|_| self.logs.flush().map_err(|e| write_err("append flush", e)).map(|_| ()));

        callback.log_io_completed(res.clone().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
        res
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        info!("konsul-raft: truncate since {log_id}");
        let mut batch = sled::Batch::default();
        for item in self.logs.range(index_key(log_id.index)..) {
            let (key, _) = item.map_err(|e| write_err("truncate", e))?;
            batch.remove(key);
        }
        self.logs.apply_batch(batch).map_err(|e| write_err("truncate", e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        info!("konsul-raft: purge upto {log_id}");
        let bytes = serde_json::to_vec(&log_id).map_err(|e| write_err("purge encode", e))?;
        self.meta
            .insert(LAST_PURGED_KEY, bytes)
            .map_err(|e| write_err("purge", e))?;

        let mut batch = sled::Batch::default();
        for item in self.logs.range(..=index_key(log_id.index)) {
            let (key, _) = item.map_err(|e| write_err("purge", e))?;
            batch.remove(key);
        }
        self.logs.apply_batch(batch).map_err(|e| write_err("purge", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use konsul_types::Command;
    use konsul_types::CommandPayload;
    use openraft::CommittedLeaderId;
    use openraft::EntryPayload;

    use super::*;

    fn open() -> SledLogStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledLogStore::open(db).unwrap()
    }

    fn entry(index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(Command::new(0, CommandPayload::KvDelete { key: "a".into() })),
        }
    }

    #[tokio::test]
    async fn vote_round_trips() {
        let mut store = open();
        assert_eq!(store.read_vote().await.unwrap(), None);
        let vote = Vote::new(3, 7);
        store.save_vote(&vote).await.unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn append_and_read_log_entries() {
        let mut store = open();
        let (tx, _rx) = tokio::sync::oneshot::channel();
        store
            .append(vec![entry(1), entry(2), entry(3)], LogFlushed::new(None, tx))
            .await
            .unwrap();

        let got = store.try_get_log_entries(1..3).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].log_id.index, 1);
        assert_eq!(got[1].log_id.index, 2);
    }

    #[tokio::test]
    async fn truncate_removes_from_index_onward() {
        let mut store = open();
        let (tx, _rx) = tokio::sync::oneshot::channel();
        store
            .append(vec![entry(1), entry(2), entry(3)], LogFlushed::new(None, tx))
            .await
            .unwrap();

        store.truncate(LogId::new(CommittedLeaderId::new(1, 1), 2)).await.unwrap();
        let got = store.try_get_log_entries(1..10).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].log_id.index, 1);
    }

    #[tokio::test]
    async fn purge_removes_up_to_and_records_last_purged() {
        let mut store = open();
        let (tx, _rx) = tokio::sync::oneshot::channel();
        store
            .append(vec![entry(1), entry(2), entry(3)], LogFlushed::new(None, tx))
            .await
            .unwrap();

        let log_id = LogId::new(CommittedLeaderId::new(1, 1), 2);
        store.purge(log_id).await.unwrap();

        let got = store.try_get_log_entries(0..10).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].log_id.index, 3);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id));
    }
}
