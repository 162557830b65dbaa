//! The openraft type configuration.
//!
//! `declare_raft_types!` generates the `TypeConfig` marker struct and the
//! boilerplate trait impls (`RaftTypeConfig`, the `Responder`, ...) that
//! every other openraft type is generic over. The app data type `D` is the
//! replicated command envelope itself; the app response type `R` is
//! `ApplyResponse` (the flattened apply outcome defined in this crate).

use std::io::Cursor;

use konsul_types::Command;
use openraft::BasicNode;

use crate::response::ApplyResponse;

pub type NodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Command,
        R = ApplyResponse,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

pub type RaftInstance = openraft::Raft<TypeConfig>;
