//! In-memory remote target driven by a script.
//!
//! Used by the test suites and for offline runs. Every target opened by a
//! `ScriptedConnector` shares one `Script`, so failures can be arranged
//! per call and counted afterwards.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::Receiver;

use super::{RemoteError, RemoteTarget, TargetConnector};
use crate::records::{Fields, RecordIdentity};
use crate::secrets::Credentials;
use crate::worker::job::DateRange;

#[derive(Debug, Default)]
struct ScriptState {
    /// Transient login failures still to hand out.
    login_failures: u32,
    reject_logins: bool,
    /// Logins after the first successful one always fail.
    fail_relogins: bool,
    logged_in_once: bool,
    export_payload: Vec<u8>,
    export_failures: u32,
    export_error: Option<RemoteError>,
    failing_lookups: HashSet<String>,
    panicking_lookups: HashSet<String>,
    probe_failures: u32,
    /// Lookups that report the remote login gone.
    lost_sessions: u32,
    refresh_failures: u32,
    exported_ranges: Vec<DateRange>,
    looked_up: Vec<String>,
}

/// Shared behaviour and call counters for scripted targets.
#[derive(Debug, Default)]
pub struct Script {
    state: Mutex<ScriptState>,
    login_gate: Option<Receiver<()>>,
    connects: AtomicU32,
    logins: AtomicU32,
    exports: AtomicU32,
    refreshes: AtomicU32,
    lookups: AtomicU32,
    probes: AtomicU32,
    closes: AtomicU32,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// JSON export with one row per `(first, last)` pair.
    pub fn with_clients(self, clients: &[(&str, &str)]) -> Self {
        let rows: Vec<serde_json::Value> = clients
            .iter()
            .map(|(first, last)| {
                serde_json::json!({
                    "First Name": first,
                    "Last Name": last,
                    "Note Type": "Visit",
                })
            })
            .collect();
        let payload = serde_json::to_vec(&rows).unwrap_or_default();
        self.with_export(payload)
    }

    pub fn with_export(self, payload: impl Into<Vec<u8>>) -> Self {
        self.state().export_payload = payload.into();
        self
    }

    /// The first `n` logins fail with a timeout.
    pub fn failing_logins(self, n: u32) -> Self {
        self.state().login_failures = n;
        self
    }

    pub fn rejecting_logins(self) -> Self {
        self.state().reject_logins = true;
        self
    }

    /// Re-authentication after the initial login never succeeds.
    pub fn failing_relogins(self) -> Self {
        self.state().fail_relogins = true;
        self
    }

    pub fn failing_exports(self, n: u32) -> Self {
        self.state().export_failures = n;
        self
    }

    /// Every export fails with `error`.
    pub fn export_error(self, error: RemoteError) -> Self {
        self.state().export_error = Some(error);
        self
    }

    /// Lookups for `Last, First` always time out.
    pub fn failing_lookup(self, display_name: &str) -> Self {
        self.state().failing_lookups.insert(display_name.to_string());
        self
    }

    pub fn panicking_lookup(self, display_name: &str) -> Self {
        self.state()
            .panicking_lookups
            .insert(display_name.to_string());
        self
    }

    /// The next `n` liveness probes fail.
    pub fn failing_probes(self, n: u32) -> Self {
        self.state().probe_failures = n;
        self
    }

    /// The next `n` lookups find the remote logged out.
    pub fn losing_session_on_lookup(self, n: u32) -> Self {
        self.state().lost_sessions = n;
        self
    }

    pub fn failing_refreshes(self, n: u32) -> Self {
        self.state().refresh_failures = n;
        self
    }

    /// Each login blocks until a token arrives on `gate`.
    pub fn gated_logins(mut self, gate: Receiver<()>) -> Self {
        self.login_gate = Some(gate);
        self
    }

    pub fn into_connector(self) -> ScriptedConnector {
        ScriptedConnector::new(Arc::new(self))
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn exports(&self) -> u32 {
        self.exports.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn exported_ranges(&self) -> Vec<DateRange> {
        self.state().exported_ranges.clone()
    }

    /// Display names in lookup order, one entry per attempt.
    pub fn looked_up(&self) -> Vec<String> {
        self.state().looked_up.clone()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new(script: Arc<Script>) -> Self {
        Self { script }
    }

    pub fn script(&self) -> &Arc<Script> {
        &self.script
    }
}

impl TargetConnector for ScriptedConnector {
    fn connect(&self) -> Result<Box<dyn RemoteTarget>, RemoteError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedTarget {
            script: Arc::clone(&self.script),
            logged_in: false,
            closed: false,
        }))
    }
}

pub struct ScriptedTarget {
    script: Arc<Script>,
    logged_in: bool,
    closed: bool,
}

impl ScriptedTarget {
    fn ensure_open(&self) -> Result<(), RemoteError> {
        if self.closed {
            return Err(RemoteError::Closed);
        }
        if !self.logged_in {
            return Err(RemoteError::SessionLost("not logged in".into()));
        }
        Ok(())
    }
}

impl RemoteTarget for ScriptedTarget {
    fn login(&mut self, _credentials: &Credentials) -> Result<(), RemoteError> {
        if self.closed {
            return Err(RemoteError::Closed);
        }
        self.script.logins.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.script.login_gate {
            gate.recv()
                .map_err(|_| RemoteError::Transport("login gate closed".into()))?;
        }

        let mut state = self.script.state();
        if state.reject_logins {
            return Err(RemoteError::Rejected("invalid credentials".into()));
        }
        if state.fail_relogins && state.logged_in_once {
            return Err(RemoteError::Timeout("re-login page did not load".into()));
        }
        if state.login_failures > 0 {
            state.login_failures -= 1;
            return Err(RemoteError::Timeout("login page did not load".into()));
        }
        state.logged_in_once = true;
        self.logged_in = true;
        Ok(())
    }

    fn export_dataset(&mut self, range: &DateRange) -> Result<Vec<u8>, RemoteError> {
        self.ensure_open()?;
        self.script.exports.fetch_add(1, Ordering::SeqCst);

        let mut state = self.script.state();
        state.exported_ranges.push(*range);
        if let Some(error) = &state.export_error {
            return Err(error.clone());
        }
        if state.export_failures > 0 {
            state.export_failures -= 1;
            return Err(RemoteError::StaleHandle("export button".into()));
        }
        Ok(state.export_payload.clone())
    }

    fn refresh_view(&mut self) -> Result<(), RemoteError> {
        self.ensure_open()?;
        self.script.refreshes.fetch_add(1, Ordering::SeqCst);

        let mut state = self.script.state();
        if state.refresh_failures > 0 {
            state.refresh_failures -= 1;
            return Err(RemoteError::Timeout("client list did not reload".into()));
        }
        Ok(())
    }

    fn lookup_record(&mut self, identity: &RecordIdentity) -> Result<Fields, RemoteError> {
        self.ensure_open()?;
        self.script.lookups.fetch_add(1, Ordering::SeqCst);
        let name = identity.display_name();

        let (fails, panics) = {
            let mut state = self.script.state();
            state.looked_up.push(name.clone());
            if state.lost_sessions > 0 {
                state.lost_sessions -= 1;
                self.logged_in = false;
                return Err(RemoteError::SessionLost("redirected to login".into()));
            }
            (
                state.failing_lookups.contains(&name),
                state.panicking_lookups.contains(&name),
            )
        };

        if panics {
            panic!("scripted lookup panic for {}", name);
        }
        if fails {
            return Err(RemoteError::Timeout(format!("search results for {}", name)));
        }

        let mut fields = Fields::new();
        fields.insert("case_manager".into(), "Scripted Manager".into());
        fields.insert("med_record".into(), format!("MR-{}", identity.last.len()));
        fields.insert("phone_1".into(), "555-0100".into());
        Ok(fields)
    }

    fn probe_liveness(&mut self) -> Result<(), RemoteError> {
        self.script.probes.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;

        let mut state = self.script.state();
        if state.probe_failures > 0 {
            state.probe_failures -= 1;
            self.logged_in = false;
            return Err(RemoteError::SessionLost("probe got login page".into()));
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.logged_in = false;
            self.script.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
