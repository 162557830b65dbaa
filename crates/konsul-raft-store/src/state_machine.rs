//! The openraft `RaftStateMachine`/`RaftSnapshotBuilder` implementation,
//! wrapping [`Fsm`] with the Raft-facing bookkeeping (last applied log
//! id, last membership, snapshot construction) that `Fsm` itself knows
//! nothing about. Method bodies are plain `async fn` impls, since
//! openraft's traits use RPITIT rather than `#[async_trait]`.
//!
//! Snapshot durability is deliberately simple: `last_applied_log` and
//! `last_membership` are tracked only in memory. A restarted node recovers
//! them by replaying the retained log (or installing a snapshot sent by the
//! leader) rather than reading them back from disk directly, a documented
//! simplification (see DESIGN.md) relative to persisting a dedicated
//! `raft_state` tree.

use std::io::Cursor;
use std::sync::Arc;

use konsul_store_api::MetricsSink;
use konsul_types::snapshot::SnapshotBlob;
use log::info;
use openraft::storage::RaftStateMachine;
use openraft::Entry;
use openraft::EntryPayload;
use openraft::LogId;
use openraft::OptionalSend;
use openraft::RaftSnapshotBuilder;
use openraft::Snapshot;
use openraft::SnapshotMeta;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::StoredMembership;

use crate::fsm::Fsm;
use crate::response::ApplyResponse;
use crate::type_config::NodeId;
use crate::type_config::TypeConfig;

pub struct StateMachine {
    fsm: Fsm,
    last_applied_log: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, openraft::BasicNode>,
}

impl StateMachine {
    pub fn new(fsm: Fsm) -> Self {
        StateMachine {
            fsm,
            last_applied_log: None,
            last_membership: StoredMembership::default(),
        }
    }
}

pub struct SnapshotBuilder {
    last_applied_log: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, openraft::BasicNode>,
    blob: SnapshotBlob,
    metrics: Arc<dyn MetricsSink>,
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let data = self.blob.encode();
        let snapshot_id = match self.last_applied_log {
            Some(id) => format!("{}-{}-{}", id.leader_id, id.index, data.len()),
            None => format!("0-0-{}", data.len()),
        };

        info!("konsul-raft-store: built snapshot id={snapshot_id} bytes={}", data.len());
        self.metrics.incr_counter("raft_snapshot_total", &[]);

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied_log,
                last_membership: self.last_membership.clone(),
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

fn io_err(context: &'static str, err: impl std::fmt::Display) -> StorageError<NodeId> {
    StorageIOError::write_state_machine(&openraft::AnyError::error(format!("{context}: {err}"))).into()
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, openraft::BasicNode>), StorageError<NodeId>> {
        Ok((self.last_applied_log, self.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            self.last_applied_log = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => {
                    responses.push(ApplyResponse::ok(crate::response::ApplyOutcome::Unit));
                }
                EntryPayload::Normal(cmd) => {
                    let resp = self.fsm.apply_command(&cmd.payload, cmd.timestamp_ms).await;
                    responses.push(resp);
                }
                EntryPayload::Membership(membership) => {
                    self.last_membership = StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(ApplyResponse::ok(crate::response::ApplyOutcome::Unit));
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder {
            last_applied_log: self.last_applied_log,
            last_membership: self.last_membership.clone(),
            blob: self.fsm.build_snapshot().await,
            metrics: self.fsm.metrics(),
        }
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, openraft::BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let blob = SnapshotBlob::decode(snapshot.get_ref()).map_err(|e| io_err("install_snapshot decode", e))?;

        info!(
            "konsul-raft-store: installing snapshot id={} last_log_id={:?}",
            meta.snapshot_id, meta.last_log_id
        );

        self.fsm.restore_snapshot(blob).await;
        self.last_applied_log = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        // Snapshots are always rebuilt on demand from the live stores rather
        // than cached between calls (no background compaction thread to
        // keep a cached copy fresh against).
        Ok(None)
    }
}
