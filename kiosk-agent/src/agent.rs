//! Agent composition root
//!
//! Every component is constructed exactly once here and handed to its
//! consumers by `Arc`. Cross-component reactions are wired here too:
//!
//! - content updated → decision engine reload, playback start if idle
//! - connectivity back online → immediate content/database sync + alert flush
//! - database updated → match database refresh
//! - mode entered/left PLAYBACK → playback driver start/stop

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiosk_common::config::TomlConfig;
use kiosk_common::events::{AgentEvent, PlayerMode, TriggerEvent};
use kiosk_common::models::{DatabaseKind, SyncManifest};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{AlertQueue, AlertTransport};
use crate::authority::AuthorityClient;
use crate::connectivity::ConnectivityMonitor;
use crate::dispatch::{event_from_match, DispatchOutcome, TriggerDispatcher};
use crate::error::Result;
use crate::matching::MatchDatabase;
use crate::mode::PlayerModeStateMachine;
use crate::pairing::PairingService;
use crate::player::{PlaybackDriver, VideoSink};
use crate::playlist::PlaylistDecisionEngine;
use crate::retry::RetryPolicy;
use crate::state::SharedState;
use crate::status::StatusSnapshot;
use crate::store::LocalStore;
use crate::sync::{ContentSyncPipeline, DatabaseSyncPipeline};

/// Capacity of the perception → dispatcher channel
const TRIGGER_CHANNEL_CAPACITY: usize = 64;

/// Resolved startup inputs
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub config: TomlConfig,
    pub config_dir: PathBuf,
    pub media_dir: PathBuf,
    /// Overrides `config.device_id` when set
    pub device_id: Option<String>,
}

pub struct Agent {
    pub config: TomlConfig,
    pub state: Arc<SharedState>,
    pub store: Arc<LocalStore>,
    pub client: Arc<AuthorityClient>,
    pub mode: Arc<PlayerModeStateMachine>,
    pub engine: Arc<PlaylistDecisionEngine>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub content: Arc<ContentSyncPipeline>,
    pub databases: Arc<DatabaseSyncPipeline>,
    pub safety_db: Arc<MatchDatabase>,
    pub loyalty_db: Arc<MatchDatabase>,
    pub alerts: Arc<AlertQueue>,
    pub dispatcher: Arc<TriggerDispatcher>,
    pub pairing: Arc<PairingService>,
    pub driver: Arc<PlaybackDriver>,
    trigger_tx: mpsc::Sender<TriggerEvent>,
    trigger_rx: Mutex<Option<mpsc::Receiver<TriggerEvent>>>,
}

impl Agent {
    /// Construct every component and wire their observers
    pub fn build(settings: AgentSettings, sink: Arc<dyn VideoSink>) -> Result<Self> {
        let AgentSettings {
            config,
            config_dir,
            media_dir,
            device_id,
        } = settings;
        std::fs::create_dir_all(&media_dir)?;

        let store = Arc::new(LocalStore::new(&config_dir)?);
        let device_id = store.resolve_device_id(device_id.as_deref().or(config.device_id.as_deref()))?;
        info!(device_id = %device_id, "Device identity resolved");

        let state = Arc::new(SharedState::new(device_id.clone()));
        let client = Arc::new(AuthorityClient::new(&config.authority, device_id)?);
        let policy = RetryPolicy::from_config(&config.sync);

        let paired = store.load_pairing().paired;
        let mode = Arc::new(
            PlayerModeStateMachine::for_pairing_status(paired).with_events(state.clone()),
        );

        let engine = match store.load_manifest() {
            Some(manifest) => PlaylistDecisionEngine::with_manifest(&media_dir, &manifest),
            None => PlaylistDecisionEngine::new(&media_dir),
        };
        let engine = Arc::new(engine.with_events(state.clone()));

        let connectivity = Arc::new(
            ConnectivityMonitor::new(config.connectivity_target(), &config.connectivity)?
                .with_events(state.clone()),
        );

        let content = Arc::new(
            ContentSyncPipeline::new(
                client.clone(),
                store.clone(),
                &media_dir,
                policy.clone(),
                Duration::from_secs(config.sync.content_interval_secs.max(1)),
            )
            .with_connectivity(connectivity.clone())
            .with_events(state.clone()),
        );

        let databases = Arc::new(
            DatabaseSyncPipeline::new(
                client.clone(),
                store.clone(),
                &config_dir,
                policy,
                &config.sync,
            )?
            .with_connectivity(connectivity.clone())
            .with_events(state.clone()),
        );

        let safety_db = Arc::new(MatchDatabase::new(
            DatabaseKind::Safety,
            config.matching.safety_threshold,
            config.matching.max_results,
        ));
        let loyalty_db = Arc::new(MatchDatabase::new(
            DatabaseKind::Loyalty,
            config.matching.loyalty_threshold,
            config.matching.max_results,
        ));

        let transport: Arc<dyn AlertTransport> = client.clone();
        let alerts = Arc::new(
            AlertQueue::new(store.clone(), transport, &config.alerts)?.with_events(state.clone()),
        );

        let dispatcher = Arc::new(TriggerDispatcher::new(
            mode.clone(),
            engine.clone(),
            alerts.clone(),
        ));

        let pairing = Arc::new(PairingService::new(
            client.clone(),
            store.clone(),
            mode.clone(),
            Duration::from_secs(config.sync.pairing_poll_secs.max(1)),
            Duration::from_secs(config.sync.content_interval_secs.max(1)),
        ));

        let driver = Arc::new(PlaybackDriver::new(sink, engine.clone()).with_events(state.clone()));

        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);

        let agent = Self {
            config,
            state,
            store,
            client,
            mode,
            engine,
            connectivity,
            content,
            databases,
            safety_db,
            loyalty_db,
            alerts,
            dispatcher,
            pairing,
            driver,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        };
        agent.wire();
        Ok(agent)
    }

    fn wire(&self) {
        let engine = self.engine.clone();
        let mode = self.mode.clone();
        let driver = self.driver.clone();
        self.content
            .on_content_updated(Box::new(move |manifest: &SyncManifest| {
                engine.reload(manifest);
                // First content after pairing: the driver stopped on an empty playlist
                mode.while_in(PlayerMode::Playback, || driver.resume_if_idle());
            }));

        let content = self.content.clone();
        let databases = self.databases.clone();
        let alerts = self.alerts.clone();
        self.connectivity.on_change(Box::new(move |online| {
            if !online {
                return;
            }
            content.sync_now();
            databases.sync_now();
            // Flush is network-bound; keep it off the monitor loop
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let alerts = alerts.clone();
                handle.spawn(async move {
                    if let Err(e) = alerts.flush().await {
                        warn!(error = %e, "Alert flush after reconnect failed");
                    }
                });
            }
        }));

        self.mode.subscribe(self.driver.mode_observer());
    }

    /// Sender the perception pipeline uses to deliver trigger events
    pub fn trigger_sender(&self) -> mpsc::Sender<TriggerEvent> {
        self.trigger_tx.clone()
    }

    pub fn match_database(&self, kind: DatabaseKind) -> &Arc<MatchDatabase> {
        match kind {
            DatabaseKind::Safety => &self.safety_db,
            DatabaseKind::Loyalty => &self.loyalty_db,
        }
    }

    /// Reload any match database whose backing file changed
    pub async fn refresh_match_databases(&self) {
        for kind in DatabaseKind::ALL {
            match self.match_database(kind).refresh(&self.databases).await {
                Ok(true) => info!(kind = %kind, "Match database refreshed"),
                Ok(false) => debug!(kind = %kind, "Match database unchanged"),
                Err(e) => warn!(kind = %kind, error = %e, "Match database refresh failed"),
            }
        }
    }

    /// Search one database and dispatch every resulting trigger event
    pub async fn handle_embedding(
        &self,
        kind: DatabaseKind,
        embedding: &[f32],
    ) -> Result<Vec<DispatchOutcome>> {
        let hits = self.match_database(kind).search(embedding)?;
        let mut outcomes = Vec::new();
        for hit in &hits {
            if let Some(event) = event_from_match(kind, hit) {
                outcomes.push(self.dispatcher.dispatch(event).await);
            }
        }
        Ok(outcomes)
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot::collect(self).await
    }

    /// Start every background loop; they all stop when `cancel` fires
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.connectivity.clone().run(cancel.clone())),
            tokio::spawn(self.content.clone().run(cancel.clone())),
            tokio::spawn(self.databases.clone().run(cancel.clone())),
            tokio::spawn(self.alerts.clone().run(cancel.clone())),
            tokio::spawn(self.pairing.clone().run(cancel.clone())),
            tokio::spawn(self.clone().watch_databases(cancel.clone())),
        ];

        let receiver = self
            .trigger_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match receiver {
            Some(rx) => handles.push(tokio::spawn(self.dispatcher.clone().run(rx, cancel))),
            None => warn!("Trigger dispatcher already running"),
        }

        if self.mode.current() == PlayerMode::Playback {
            self.driver.start();
        }
        info!(tasks = handles.len(), "Agent started");
        handles
    }

    /// Refresh match databases at startup and after each verified download
    async fn watch_databases(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.state.subscribe_events();
        self.refresh_match_databases().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(AgentEvent::DatabaseUpdated { kind, .. }) => {
                        if let Err(e) = self.match_database(kind).refresh(&self.databases).await {
                            warn!(kind = %kind, error = %e, "Match database refresh failed");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Database watcher lagged, refreshing all");
                        self.refresh_match_databases().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}
