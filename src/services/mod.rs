pub mod dispatcher;
pub mod encounter;
pub mod sniffer;

use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;

/// Signals for external collaborators (UI, API layer).
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notice {
    #[serde(rename_all = "camelCase")]
    SessionBoundary { new_start_time: u64 },
    #[serde(rename_all = "camelCase")]
    EncounterStarted { boss_id: u64, boss_name: String },
    #[serde(rename_all = "camelCase")]
    EncounterGrace { boss_id: u64 },
    #[serde(rename_all = "camelCase")]
    EncounterResumed { boss_id: u64 },
    #[serde(rename_all = "camelCase")]
    EncounterEnded { boss_id: u64 },
    HistorySaved { path: PathBuf },
}

/// Non-blocking notice publisher. A full channel drops the notice.
#[derive(Debug, Clone)]
pub struct NoticeSender {
    tx: Sender<Notice>,
}

impl NoticeSender {
    pub fn channel(capacity: usize) -> (Self, Receiver<Notice>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }

    pub fn send(&self, notice: Notice) {
        match self.tx.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(notice)) => log::debug!("Notice channel full, dropped {:?}", notice),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
