//! Device pairing
//!
//! While unpaired the device shows a short code that an administrator types
//! into the authority's console. The service registers the code, polls until
//! the authority reports the device claimed, then moves the player to
//! PLAYBACK. A paired device that the authority no longer recognises goes
//! back to PAIRING.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use kiosk_common::events::PlayerMode;
use kiosk_common::models::PairingStatus;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authority::AuthorityClient;
use crate::error::{AgentError, Result};
use crate::mode::PlayerModeStateMachine;
use crate::store::LocalStore;

pub const CODE_LENGTH: usize = 6;
/// No 0/O or 1/I, so codes survive being read off a screen
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Result of one pairing poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PairingStep {
    /// Still waiting for an administrator; `code` is on screen
    Waiting { code: String },
    /// Just claimed; player moved to PLAYBACK
    Paired,
    /// Authority no longer knows this device; player moved to PAIRING
    Revoked,
    /// Paired and still recognised
    Unchanged,
}

pub fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

pub struct PairingService {
    client: Arc<AuthorityClient>,
    store: Arc<LocalStore>,
    mode: Arc<PlayerModeStateMachine>,
    /// Registered code, if any
    code: Mutex<Option<String>>,
    waiting_interval: Duration,
    paired_interval: Duration,
}

impl PairingService {
    pub fn new(
        client: Arc<AuthorityClient>,
        store: Arc<LocalStore>,
        mode: Arc<PlayerModeStateMachine>,
        waiting_interval: Duration,
        paired_interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            mode,
            code: Mutex::new(None),
            waiting_interval,
            paired_interval,
        }
    }

    /// Code currently shown on screen
    pub fn current_code(&self) -> Option<String> {
        self.code
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// One pairing round trip, acting on the current player mode
    pub async fn poll_once(&self) -> Result<PairingStep> {
        match self.mode.current() {
            PlayerMode::Pairing => self.poll_unpaired().await,
            current => self.poll_paired(current).await,
        }
    }

    async fn poll_unpaired(&self) -> Result<PairingStep> {
        let code = self.ensure_registered().await?;
        let remote = self.client.fetch_pairing_status().await?;
        if !remote.paired {
            debug!(code = %code, "Waiting to be paired");
            return Ok(PairingStep::Waiting { code });
        }

        self.store.save_pairing(&PairingStatus {
            paired: true,
            paired_at: Some(Utc::now()),
            pairing_code: None,
        })?;
        self.set_code(None);
        info!("Device paired");

        match self
            .mode
            .compare_and_transition(PlayerMode::Pairing, PlayerMode::Playback)
        {
            Ok(_) | Err(AgentError::SourceMismatch { .. }) => Ok(PairingStep::Paired),
            Err(e) => Err(e),
        }
    }

    async fn poll_paired(&self, current: PlayerMode) -> Result<PairingStep> {
        let remote = self.client.fetch_pairing_status().await?;
        if remote.paired {
            return Ok(PairingStep::Unchanged);
        }

        warn!("Authority reports device unpaired, returning to pairing");
        self.store.save_pairing(&PairingStatus::default())?;
        match self.mode.compare_and_transition(current, PlayerMode::Pairing) {
            Ok(_) | Err(AgentError::SourceMismatch { .. }) => Ok(PairingStep::Revoked),
            Err(e) => Err(e),
        }
    }

    /// Register a code once per pairing session, reusing a persisted one
    async fn ensure_registered(&self) -> Result<String> {
        if let Some(code) = self.current_code() {
            return Ok(code);
        }

        let mut status = self.store.load_pairing();
        let code = match status.pairing_code.clone() {
            Some(code) if code.len() == CODE_LENGTH => code,
            _ => generate_pairing_code(),
        };
        self.client.register_pairing_code(&code).await?;

        status.paired = false;
        status.pairing_code = Some(code.clone());
        self.store.save_pairing(&status)?;
        self.set_code(Some(code.clone()));
        info!(code = %code, "Pairing code registered");
        Ok(code)
    }

    fn set_code(&self, code: Option<String>) {
        *self
            .code
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = code;
    }

    /// Poll fast while unpaired, slowly while paired
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Pairing service started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => {
                    if let Err(e) = result {
                        debug!(error = %e, "Pairing poll failed");
                    }
                }
            }

            let interval = if self.mode.current() == PlayerMode::Pairing {
                self.waiting_interval
            } else {
                self.paired_interval
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Pairing service stopped");
    }
}
