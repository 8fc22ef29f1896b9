// src/services/dispatcher.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::io::{now_ms, HistoryWriter};
use crate::protocol::types::{Event, TimedEvent};
use crate::services::encounter::{EncounterMachine, Transition};
use crate::services::{Notice, NoticeSender};
use crate::store::DataStore;

/// Single consumer of the decoded-event queue. Applies events to the store in
/// arrival order, then advances the encounter machine.
pub struct Dispatcher {
    store: Arc<DataStore>,
    encounter: Arc<Mutex<EncounterMachine>>,
    notices: NoticeSender,
    auto_history: Option<HistoryWriter>,
    saves: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<DataStore>,
        encounter: Arc<Mutex<EncounterMachine>>,
        notices: NoticeSender,
        auto_history: Option<HistoryWriter>,
    ) -> Self {
        Self { store, encounter, notices, auto_history, saves: Mutex::new(Vec::new()) }
    }

    pub fn apply(&self, timed: TimedEvent) {
        self.store.apply(&timed);
        if let Event::SessionBoundary { new_start_time } = timed.event {
            self.notices.send(Notice::SessionBoundary { new_start_time });
        }
        self.advance(timed.ts_ms);
    }

    /// Periodic work independent of traffic: realtime windows decay and the
    /// grace period can expire while nothing arrives.
    pub fn tick(&self, now_ms: u64) {
        self.store.refresh_realtime(now_ms);
        self.advance(now_ms);
    }

    fn advance(&self, now_ms: u64) {
        let sightings = self.store.boss_sightings();
        let transition = self
            .encounter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(&sightings, now_ms);

        match transition {
            None => {}
            Some(Transition::Engaged { boss_id, boss_name }) => {
                self.store.reset_statistics();
                self.notices.send(Notice::EncounterStarted { boss_id, boss_name });
            }
            Some(Transition::Lost { boss_id }) => self.notices.send(Notice::EncounterGrace { boss_id }),
            Some(Transition::Recovered { boss_id }) => self.notices.send(Notice::EncounterResumed { boss_id }),
            Some(Transition::Disengaged { boss_id, boss_name, ended_at, .. }) => {
                self.notices.send(Notice::EncounterEnded { boss_id });
                if let Some(writer) = &self.auto_history {
                    self.save_in_background(writer.clone(), boss_id, boss_name, ended_at);
                }
            }
        }
    }

    // The snapshot is taken here; files are written on their own thread so
    // the queue keeps draining while the disk syncs.
    fn save_in_background(&self, writer: HistoryWriter, boss_id: u64, boss_name: String, ended_at: u64) {
        let snapshot = self.store.snapshot();
        let notices = self.notices.clone();
        let handle = thread::spawn(move || {
            match writer.save(&snapshot, ended_at, Some((boss_id, boss_name.as_str()))) {
                Ok(path) => notices.send(Notice::HistorySaved { path }),
                Err(e) => log::error!("Auto-save of encounter history failed: {}", e),
            }
        });

        let mut saves = self.saves.lock().unwrap_or_else(PoisonError::into_inner);
        saves.retain(|save| !save.is_finished());
        saves.push(handle);
    }

    /// Blocks until every history save started so far has finished.
    pub fn finish_saves(&self) {
        let saves = std::mem::take(&mut *self.saves.lock().unwrap_or_else(PoisonError::into_inner));
        for save in saves {
            if save.join().is_err() {
                log::error!("History save thread panicked");
            }
        }
    }

    /// Drains `rx` on a dedicated thread until `cancel` is set or every sender
    /// is gone. Events still queued at cancellation are discarded; history
    /// saves in flight are completed before the thread exits.
    pub fn spawn(
        self,
        rx: Receiver<TimedEvent>,
        tick_interval: Duration,
        cancel: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut last_tick = Instant::now();
            while !cancel.load(Ordering::SeqCst) {
                match rx.recv_timeout(tick_interval) {
                    Ok(timed) => self.apply(timed),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if last_tick.elapsed() >= tick_interval {
                    self.tick(now_ms());
                    last_tick = Instant::now();
                }
            }

            let discarded = rx.try_iter().count();
            if discarded > 0 {
                log::debug!("Dispatcher stopped, discarded {} queued events", discarded);
            }
            self.finish_saves();
        })
    }
}
