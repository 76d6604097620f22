//! Capability interface to the remote system.
//!
//! The pipeline only ever talks to a `RemoteTarget`; how a login or lookup
//! is carried out (selectors, frames, clicks) stays inside the
//! implementation.

pub mod error;
pub mod scripted;
pub mod webdriver;

pub use error::RemoteError;
pub use scripted::{Script, ScriptedConnector, ScriptedTarget};
pub use webdriver::{WebDriverConnector, WebDriverTarget};

use crate::records::{Fields, RecordIdentity};
use crate::secrets::Credentials;
use crate::worker::job::DateRange;

/// One live handle on the remote system. Owned by exactly one session.
pub trait RemoteTarget: Send {
    fn login(&mut self, credentials: &Credentials) -> Result<(), RemoteError>;

    /// Raw export bytes for the range.
    fn export_dataset(&mut self, range: &DateRange) -> Result<Vec<u8>, RemoteError>;

    /// Reloads the remote's working view so later lookups see current state.
    fn refresh_view(&mut self) -> Result<(), RemoteError>;

    fn lookup_record(&mut self, identity: &RecordIdentity) -> Result<Fields, RemoteError>;

    /// Cheap check that the authenticated handle still responds.
    fn probe_liveness(&mut self) -> Result<(), RemoteError>;

    /// Releases the handle. Must be safe to call more than once.
    fn close(&mut self);
}

/// Opens fresh targets; one per login attempt.
pub trait TargetConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn RemoteTarget>, RemoteError>;
}
