//! Background service wrapper.
//!
//! [`FlightService`] is the lifecycle contract a host process drives: start,
//! stop, bind and unbind. Binding is reference counted by the sensor handler,
//! and a stop request is refused while a recording is active.

use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::channel::{Client, Command};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::{HandlerConfig, HandlerStatus, SensorHandler};
use crate::sensors::SensorSuite;
use crate::storage::Storage;
use crate::store::{join_worker, RecordingStore};

/// A running flight recorder service.
#[derive(Debug)]
pub struct FlightService {
    handler: SensorHandler,
    store: RecordingStore,
    /// Set when the service opened the store itself and must stop it.
    worker: Option<JoinHandle<()>>,
}

impl FlightService {
    /// Start a service over an existing store.
    ///
    /// # Errors
    ///
    /// Returns an error if the sensor handler cannot load its calibration.
    pub async fn new(
        config: HandlerConfig,
        store: RecordingStore,
        sensors: SensorSuite,
    ) -> Result<Self> {
        let handler = SensorHandler::spawn(store.clone(), sensors, config).await?;
        Ok(Self {
            handler,
            store,
            worker: None,
        })
    }

    /// Open the configured database and start a service over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the store
    /// worker cannot be started.
    pub async fn open(config: &Config, sensors: SensorSuite) -> Result<Self> {
        let storage = Storage::open(config.database_path())?;
        let (store, worker) = RecordingStore::spawn(storage)?;
        let mut service = Self::new(HandlerConfig::from(config), store, sensors).await?;
        service.worker = Some(worker);
        Ok(service)
    }

    /// Host start: attach sensors regardless of bound clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SensorUnavailable`] if the GPS cannot be attached.
    pub async fn on_start(&self) -> Result<HandlerStatus> {
        info!("Service start requested");
        self.handler.execute(Command::StartSensors).await
    }

    /// Host stop. Returns `false`, changing nothing, while recording.
    pub async fn on_stop(&self) -> bool {
        match self.handler.execute(Command::StopSensors).await {
            Ok(_) | Err(Error::HandlerStopped) => true,
            Err(e) if e.is_invalid_transition() => {
                info!("Refusing to stop while recording");
                false
            }
            Err(e) => {
                warn!("Stop failed: {}", e);
                false
            }
        }
    }

    /// Bind a client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerStopped`] after teardown.
    pub async fn on_bind(&self) -> Result<Client> {
        self.handler.bind().await
    }

    /// Release a client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerStopped`] after teardown.
    pub async fn on_unbind(&self, client: Client) -> Result<HandlerStatus> {
        client.unbind().await
    }

    /// The sensor handler.
    #[must_use]
    pub fn handler(&self) -> &SensorHandler {
        &self.handler
    }

    /// The recording store.
    #[must_use]
    pub fn store(&self) -> &RecordingStore {
        &self.store
    }

    /// Host teardown: close any recording, detach sensors and wait for all
    /// queued writes.
    ///
    /// A store opened by [`FlightService::open`] is shut down and its worker
    /// joined; a store passed to [`FlightService::new`] stays open.
    ///
    /// # Errors
    ///
    /// Returns an error if the store has already stopped.
    pub async fn teardown(self) -> Result<()> {
        info!("Service teardown");
        match self.handler.shutdown().await {
            Ok(()) | Err(Error::HandlerStopped) => {}
            Err(e) => return Err(e),
        }
        let Some(worker) = self.worker else {
            return self.store.flush().await;
        };
        self.store.shutdown().await?;
        tokio::task::spawn_blocking(move || join_worker(worker))
            .await
            .map_err(|e| Error::internal(format!("store worker join failed: {e}")))
    }
}
