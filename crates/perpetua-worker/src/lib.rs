// Instance pool for the Perpetua runtime
//
// Long-lived worker slots pinned to a template version: claim sessions via
// DB compare-and-set, drive the agent loop, heartbeat, and recover from
// faults by parking the slot in ERROR for an admin restart.

pub mod dispatch;
pub mod pool;
pub mod worker;

pub use dispatch::DispatchHub;
pub use pool::InstancePool;
pub use worker::InstanceWorker;
