// src/meter.rs

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use serde::Serialize;

use crate::capture::{CaptureSettings, CaptureSource, DeviceInfo, DeviceSelector};
use crate::config::AppConfig;
use crate::error::{CaptureError, HistoryError};
use crate::io::{now_ms, HistoryWriter};
use crate::services::dispatcher::Dispatcher;
use crate::services::encounter::{EncounterMachine, EncounterSnapshot, PauseClock};
use crate::services::sniffer::{CountersSnapshot, PacketPipeline, PipelineCounters};
use crate::services::{Notice, NoticeSender};
use crate::store::DataStore;

const NOTICE_CAPACITY: usize = 256;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub start_time: u64,
    pub is_paused: bool,
    pub last_paused_at: Option<u64>,
    pub total_paused_ms: u64,
    pub active_elapsed_ms: u64,
}

struct Consumer {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Wires capture, pipeline, dispatcher, store and encounter tracking together.
pub struct Meter {
    config: AppConfig,
    store: Arc<DataStore>,
    encounter: Arc<Mutex<EncounterMachine>>,
    pause: Mutex<PauseClock>,
    capture: CaptureSource,
    counters: Arc<PipelineCounters>,
    notices: NoticeSender,
    notice_rx: Receiver<Notice>,
    history: HistoryWriter,
    consumer: Mutex<Option<Consumer>>,
}

impl Meter {
    pub fn new(config: AppConfig) -> Self {
        let (notices, notice_rx) = NoticeSender::channel(NOTICE_CAPACITY);
        Self {
            store: Arc::new(DataStore::new(&config)),
            encounter: Arc::new(Mutex::new(EncounterMachine::new(config.grace_period_ms))),
            pause: Mutex::new(PauseClock::default()),
            capture: CaptureSource::new(CaptureSettings::from(&config)),
            counters: Arc::new(PipelineCounters::default()),
            history: HistoryWriter::new(config.history_dir.clone()),
            notices,
            notice_rx,
            consumer: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Receiver side of the notice channel. Every clone competes for notices.
    pub fn notices(&self) -> Receiver<Notice> {
        self.notice_rx.clone()
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        CaptureSource::list_devices()
    }

    pub fn current_device(&self) -> Option<String> {
        self.capture.current_device()
    }

    pub fn is_running(&self) -> bool {
        self.capture.is_running()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    fn lock_consumer(&self) -> MutexGuard<'_, Option<Consumer>> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pause(&self) -> MutexGuard<'_, PauseClock> {
        self.pause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts capture on the selected device and the event consumer behind it.
    pub fn start(&self, selector: &DeviceSelector) -> Result<String, CaptureError> {
        let mut consumer = self.lock_consumer();
        if let Some(device) = self.capture.current_device() {
            return Err(CaptureError::AlreadyRunning(device));
        }

        let (tx, rx) = crossbeam_channel::bounded(self.config.queue_capacity);
        let pipeline = PacketPipeline::new(&self.config, tx, self.counters.clone());
        let device = self.capture.start(selector, pipeline)?;

        let auto_history = self.config.auto_save_history.then(|| self.history.clone());
        let dispatcher =
            Dispatcher::new(self.store.clone(), self.encounter.clone(), self.notices.clone(), auto_history);
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = dispatcher.spawn(rx, Duration::from_millis(self.config.tick_interval_ms), cancel.clone());
        *consumer = Some(Consumer { cancel, handle });

        log::info!("Meter running on {}", device);
        Ok(device)
    }

    /// Stops capture first (no frame is delivered after it returns), then the
    /// consumer. Queued events that were not applied yet are discarded.
    pub fn stop(&self) {
        let mut consumer = self.lock_consumer();
        self.capture.stop();
        if let Some(running) = consumer.take() {
            running.cancel.store(true, Ordering::SeqCst);
            if running.handle.join().is_err() {
                log::error!("Dispatcher thread panicked");
            }
        }
    }

    pub fn switch_device(&self, selector: &DeviceSelector) -> Result<String, CaptureError> {
        log::info!("Switching capture device to {}", selector);
        self.stop();
        self.start(selector)
    }

    pub fn pause(&self) -> bool {
        self.lock_pause().pause(now_ms())
    }

    pub fn resume(&self) -> bool {
        self.lock_pause().resume(now_ms())
    }

    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.session_snapshot_at(now_ms())
    }

    pub fn session_snapshot_at(&self, now: u64) -> SessionSnapshot {
        let clock = *self.lock_pause();
        let start_time = self.store.start_time();
        let active_elapsed_ms = if start_time == 0 {
            0
        } else {
            now.saturating_sub(start_time).saturating_sub(clock.paused_ms_at(now))
        };
        SessionSnapshot {
            start_time,
            is_paused: clock.is_paused(),
            last_paused_at: clock.last_paused_at(),
            total_paused_ms: clock.total_paused_ms(),
            active_elapsed_ms,
        }
    }

    pub fn encounter(&self) -> EncounterSnapshot {
        self.encounter.lock().unwrap_or_else(PoisonError::into_inner).snapshot()
    }

    pub fn reset_statistics(&self) {
        self.store.reset_statistics();
    }

    /// Drops every record and the pause bookkeeping that belonged to them.
    pub fn clear_all(&self) {
        self.store.clear_all();
        self.lock_pause().reset();
    }

    /// Writes the current state as a history snapshot keyed by the current time.
    pub fn save_history(&self) -> Result<PathBuf, HistoryError> {
        let encounter = self.encounter();
        let boss = encounter.active_boss_id.zip(encounter.active_boss_name.as_deref());
        let path = self.history.save(&self.store.snapshot(), now_ms(), boss)?;
        self.notices.send(Notice::HistorySaved { path: path.clone() });
        Ok(path)
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        self.stop();
    }
}
