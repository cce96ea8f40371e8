#![forbid(unsafe_code)]

mod error;
mod housekeeping;
mod ledger;
mod presence;
mod sessions;
mod synchronization;
mod transfers;

#[cfg(test)]
mod test_support;

pub use error::EngineError;
pub use housekeeping::spawn_housekeeping;
pub use ledger::{LedgerUpdate, TrackingActionLedger};
pub use presence::{ClientPresence, Connection, PushTarget};
pub use sessions::SessionRegistry;
pub use synchronization::{
    check_synchronization_can_be_updated, check_synchronization_is_finished,
    StagedDeparture, SynchronizationEngine, SynchronizationPolicy, DEFAULT_ABORT_GRACE_PERIOD,
};
pub use transfers::TransferTracker;
