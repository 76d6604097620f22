//! Authenticated remote session with keep-alive and bounded re-login.
//!
//! A `RemoteSession` owns its target exclusively. It is created once per
//! pipeline run and closes the target when dropped, whatever the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::SessionConfig;
use crate::records::{Fields, RecordIdentity};
use crate::remote::{RemoteError, RemoteTarget, TargetConnector};
use crate::retry::{Backoff, RetryError, RetryPolicy};
use crate::secrets::Credentials;
use crate::worker::job::DateRange;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    Authentication(RetryError<RemoteError>),

    #[error("session is dead after {attempts} failed re-login attempts")]
    Dead { attempts: u32 },

    #[error("{0}")]
    Remote(#[from] RemoteError),
}

impl SessionError {
    /// Remote failures are retryable when the underlying error is; a dead
    /// session never is.
    pub fn is_transient(&self) -> bool {
        match self {
            SessionError::Remote(e) => e.is_transient(),
            SessionError::Authentication(_) | SessionError::Dead { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub idle_threshold: Duration,
    /// Consecutive failed re-logins tolerated before the session is dead.
    pub max_relogin_attempts: u32,
    pub relogin_backoff: Backoff,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            idle_threshold: Duration::from_secs(config.idle_threshold_secs),
            max_relogin_attempts: config.max_relogin_attempts.max(1),
            relogin_backoff: config.relogin_backoff,
        }
    }
}

/// What `keep_alive` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// Used recently; nothing was sent.
    Fresh,
    /// Probed and still logged in.
    Alive,
    /// Probe failed and a new login succeeded.
    Reauthenticated,
}

pub struct RemoteSession {
    target: Box<dyn RemoteTarget>,
    credentials: Arc<Credentials>,
    settings: SessionSettings,
    last_activity: Instant,
    relogin_attempts: u32,
    /// A call reported the remote login gone; probe before the next use.
    suspect: bool,
    dead: bool,
}

impl RemoteSession {
    /// Connects and logs in, retrying per `login_policy`. A target whose
    /// login failed is closed before the next attempt.
    pub fn establish(
        connector: &dyn TargetConnector,
        credentials: Arc<Credentials>,
        settings: SessionSettings,
        login_policy: &RetryPolicy,
    ) -> Result<Self, SessionError> {
        let target = login_policy
            .run(
                "Login",
                |_| {
                    let mut target = connector.connect()?;
                    match target.login(&credentials) {
                        Ok(()) => Ok(target),
                        Err(e) => {
                            target.close();
                            Err(e)
                        }
                    }
                },
                RemoteError::is_transient,
            )
            .map_err(SessionError::Authentication)?;

        log::info!("Remote session established");

        Ok(Self {
            target,
            credentials,
            settings,
            last_activity: Instant::now(),
            relogin_attempts: 0,
            suspect: false,
            dead: false,
        })
    }

    pub fn keep_alive(&mut self) -> Result<KeepAlive, SessionError> {
        self.keep_alive_at(Instant::now())
    }

    /// Probes the remote if it has been idle longer than the threshold (or
    /// a call reported the login lost) and re-authenticates when the probe
    /// fails.
    pub fn keep_alive_at(&mut self, now: Instant) -> Result<KeepAlive, SessionError> {
        self.ensure_alive()?;

        let idle = now.saturating_duration_since(self.last_activity);
        if !self.suspect && idle <= self.settings.idle_threshold {
            return Ok(KeepAlive::Fresh);
        }

        match self.target.probe_liveness() {
            Ok(()) => {
                log::debug!("Keep-alive probe ok after {}s idle", idle.as_secs());
                self.suspect = false;
                self.mark_activity_at(now);
                return Ok(KeepAlive::Alive);
            }
            Err(e) => {
                log::warn!("Keep-alive probe failed after {}s idle: {}", idle.as_secs(), e);
            }
        }

        self.reauthenticate(now)?;
        Ok(KeepAlive::Reauthenticated)
    }

    fn reauthenticate(&mut self, now: Instant) -> Result<(), SessionError> {
        let max = self.settings.max_relogin_attempts;

        while self.relogin_attempts < max {
            self.relogin_attempts += 1;
            let attempt = self.relogin_attempts;

            match self.target.login(&self.credentials) {
                Ok(()) => {
                    log::info!("Re-login succeeded on attempt {}/{}", attempt, max);
                    self.relogin_attempts = 0;
                    self.suspect = false;
                    self.mark_activity_at(now.max(Instant::now()));
                    return Ok(());
                }
                Err(e) if !e.is_transient() => {
                    log::error!("Re-login rejected: {}", e);
                    break;
                }
                Err(e) => {
                    log::warn!("Re-login attempt {}/{} failed: {}", attempt, max, e);
                    let delay = self.settings.relogin_backoff.delay_after(attempt);
                    if attempt < max && !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        self.dead = true;
        log::error!("Remote session declared dead after {} re-login attempts", max);
        Err(SessionError::Dead { attempts: max })
    }

    pub fn mark_activity(&mut self) {
        self.mark_activity_at(Instant::now());
    }

    pub fn mark_activity_at(&mut self, at: Instant) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    pub fn export(&mut self, range: &DateRange) -> Result<Vec<u8>, SessionError> {
        self.ensure_alive()?;
        let result = self.target.export_dataset(range);
        self.observe(result)
    }

    /// Reloads the remote's working view twice. Lookups made after a single
    /// reload see the view as it was before the export.
    pub fn refresh_twice(&mut self) -> Result<(), SessionError> {
        for _ in 0..2 {
            self.ensure_alive()?;
            let result = self.target.refresh_view();
            self.observe(result)?;
        }
        Ok(())
    }

    pub fn lookup(&mut self, identity: &RecordIdentity) -> Result<Fields, SessionError> {
        self.ensure_alive()?;
        let result = self.target.lookup_record(identity);
        self.observe(result)
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn relogin_attempts(&self) -> u32 {
        self.relogin_attempts
    }

    fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.dead {
            return Err(SessionError::Dead {
                attempts: self.settings.max_relogin_attempts,
            });
        }
        Ok(())
    }

    fn observe<T>(&mut self, result: Result<T, RemoteError>) -> Result<T, SessionError> {
        match result {
            Ok(value) => {
                self.mark_activity();
                Ok(value)
            }
            Err(e) => {
                if matches!(e, RemoteError::SessionLost(_)) {
                    self.suspect = true;
                }
                Err(SessionError::Remote(e))
            }
        }
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.target.close();
        log::debug!("Remote session closed");
    }
}
