//! The replicated state machine: applies committed
//! commands from the Raft log to the KV store and service registry, and
//! builds/installs the snapshot blob that bounds log growth.

pub mod fsm;
pub mod response;
pub mod state_machine;
pub mod type_config;

pub use fsm::Fsm;
pub use response::ApplyError;
pub use response::ApplyOutcome;
pub use response::ApplyResponse;
pub use state_machine::StateMachine;
pub use type_config::NodeId;
pub use type_config::RaftInstance;
pub use type_config::TypeConfig;
