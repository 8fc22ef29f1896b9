use serde::Serialize;

use crate::store::enemy::BossSighting;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncounterState {
    Idle,
    Active,
    GracePeriod,
}

/// What changed during one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Idle -> Active. The caller resets statistics exactly once.
    Engaged { boss_id: u64, boss_name: String },
    /// Active -> GracePeriod.
    Lost { boss_id: u64 },
    /// GracePeriod -> Active. No reset.
    Recovered { boss_id: u64 },
    /// Active/GracePeriod -> Idle.
    Disengaged { boss_id: u64, boss_name: String, started_at: u64, ended_at: u64 },
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncounterSnapshot {
    pub state: EncounterState,
    pub active_boss_id: Option<u64>,
    pub active_boss_name: Option<String>,
    pub last_boss_seen_at: Option<u64>,
    pub started_at: Option<u64>,
}

/// Boss encounter tracking, advanced explicitly by the dispatcher after every
/// applied event and on every tick.
#[derive(Debug, Clone)]
pub struct EncounterMachine {
    state: EncounterState,
    active_boss_id: Option<u64>,
    active_boss_name: Option<String>,
    last_boss_seen_at: Option<u64>,
    started_at: Option<u64>,
    grace_ms: u64,
}

impl EncounterMachine {
    pub fn new(grace_ms: u64) -> Self {
        Self {
            state: EncounterState::Idle,
            active_boss_id: None,
            active_boss_name: None,
            last_boss_seen_at: None,
            started_at: None,
            grace_ms,
        }
    }

    pub fn state(&self) -> EncounterState {
        self.state
    }

    pub fn active_boss_id(&self) -> Option<u64> {
        self.active_boss_id
    }

    pub fn active_boss_name(&self) -> Option<&str> {
        self.active_boss_name.as_deref()
    }

    pub fn snapshot(&self) -> EncounterSnapshot {
        EncounterSnapshot {
            state: self.state,
            active_boss_id: self.active_boss_id,
            active_boss_name: self.active_boss_name.clone(),
            last_boss_seen_at: self.last_boss_seen_at,
            started_at: self.started_at,
        }
    }

    /// Advances the machine given the bosses currently present in the enemy
    /// table.
    pub fn observe(&mut self, bosses: &[BossSighting], now_ms: u64) -> Option<Transition> {
        match self.state {
            EncounterState::Idle => {
                // Highest damage total wins, ties go to the lowest id
                let boss = bosses
                    .iter()
                    .filter(|b| b.total > 0)
                    .max_by(|a, b| a.total.cmp(&b.total).then_with(|| b.id.cmp(&a.id)))?;

                self.state = EncounterState::Active;
                self.active_boss_id = Some(boss.id);
                self.active_boss_name = Some(boss.name.clone());
                self.last_boss_seen_at = Some(now_ms);
                self.started_at = Some(now_ms);
                log::info!("[Encounter] Engaged {} ({})", boss.name, boss.id);
                Some(Transition::Engaged { boss_id: boss.id, boss_name: boss.name.clone() })
            }
            EncounterState::Active => {
                let boss_id = self.active_boss_id?;
                if self.is_present(bosses) {
                    self.last_boss_seen_at = Some(now_ms);
                    return None;
                }
                if self.grace_elapsed(now_ms) {
                    return Some(self.end(now_ms));
                }
                self.state = EncounterState::GracePeriod;
                log::debug!("[Encounter] Boss {} absent, grace period started", boss_id);
                Some(Transition::Lost { boss_id })
            }
            EncounterState::GracePeriod => {
                let boss_id = self.active_boss_id?;
                if self.is_present(bosses) {
                    self.state = EncounterState::Active;
                    self.last_boss_seen_at = Some(now_ms);
                    log::debug!("[Encounter] Boss {} back within grace period", boss_id);
                    return Some(Transition::Recovered { boss_id });
                }
                if self.grace_elapsed(now_ms) {
                    return Some(self.end(now_ms));
                }
                None
            }
        }
    }

    fn is_present(&self, bosses: &[BossSighting]) -> bool {
        self.active_boss_id.is_some_and(|id| bosses.iter().any(|b| b.id == id))
    }

    fn grace_elapsed(&self, now_ms: u64) -> bool {
        let seen = self.last_boss_seen_at.unwrap_or(now_ms);
        now_ms.saturating_sub(seen) >= self.grace_ms
    }

    fn end(&mut self, now_ms: u64) -> Transition {
        let boss_id = self.active_boss_id.take().unwrap_or_default();
        let boss_name = self.active_boss_name.take().unwrap_or_default();
        let started_at = self.started_at.take().unwrap_or(now_ms);
        self.state = EncounterState::Idle;
        self.last_boss_seen_at = None;
        log::info!("[Encounter] Ended {} ({}) after {} ms", boss_name, boss_id, now_ms.saturating_sub(started_at));
        Transition::Disengaged { boss_id, boss_name, started_at, ended_at: now_ms }
    }
}

/// Pause/resume bookkeeping. Capture and aggregation keep running while
/// paused; only elapsed-time accounting changes.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseClock {
    last_paused_at: Option<u64>,
    total_paused_ms: u64,
}

impl PauseClock {
    /// Returns false when already paused.
    pub fn pause(&mut self, now_ms: u64) -> bool {
        if self.last_paused_at.is_some() {
            return false;
        }
        self.last_paused_at = Some(now_ms);
        true
    }

    /// Returns false when not paused.
    pub fn resume(&mut self, now_ms: u64) -> bool {
        let Some(paused_at) = self.last_paused_at.take() else {
            return false;
        };
        self.total_paused_ms += now_ms.saturating_sub(paused_at);
        true
    }

    pub fn is_paused(&self) -> bool {
        self.last_paused_at.is_some()
    }

    pub fn last_paused_at(&self) -> Option<u64> {
        self.last_paused_at
    }

    pub fn total_paused_ms(&self) -> u64 {
        self.total_paused_ms
    }

    /// Paused time up to `now_ms`, counting a pause still in progress.
    pub fn paused_ms_at(&self, now_ms: u64) -> u64 {
        self.total_paused_ms + self.last_paused_at.map_or(0, |at| now_ms.saturating_sub(at))
    }

    pub fn reset(&mut self) {
        *self = PauseClock::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boss(id: u64, total: u64) -> BossSighting {
        BossSighting { id, name: format!("Boss {}", id), total }
    }

    #[test]
    fn boss_with_damage_engages_once() {
        let mut machine = EncounterMachine::new(5000);
        // Present but untouched bosses do not start an encounter
        assert_eq!(machine.observe(&[boss(1, 0)], 0), None);

        let t = machine.observe(&[boss(1, 10)], 100);
        assert_eq!(t, Some(Transition::Engaged { boss_id: 1, boss_name: "Boss 1".into() }));
        assert_eq!(machine.state(), EncounterState::Active);

        // Still present: no further transition
        assert_eq!(machine.observe(&[boss(1, 50)], 200), None);
        assert_eq!(machine.observe(&[boss(1, 0)], 300), None);
    }

    #[test]
    fn returning_within_grace_does_not_reengage() {
        let mut machine = EncounterMachine::new(5000);
        machine.observe(&[boss(1, 10)], 1_000);

        assert_eq!(machine.observe(&[], 2_000), Some(Transition::Lost { boss_id: 1 }));
        assert_eq!(machine.state(), EncounterState::GracePeriod);
        assert_eq!(machine.observe(&[], 5_999), None);

        assert_eq!(machine.observe(&[boss(1, 0)], 5_999), Some(Transition::Recovered { boss_id: 1 }));
        assert_eq!(machine.state(), EncounterState::Active);
        assert_eq!(machine.observe(&[boss(1, 10)], 6_500), None);
    }

    #[test]
    fn absence_shorter_than_grace_stays_engaged() {
        let mut machine = EncounterMachine::new(5000);
        machine.observe(&[boss(1, 10)], 10_000);
        machine.observe(&[], 10_500);

        assert_eq!(machine.observe(&[], 14_999), None);
        assert_eq!(machine.active_boss_id(), Some(1));
        assert_eq!(machine.active_boss_name(), Some("Boss 1"));
    }

    #[test]
    fn absence_of_full_grace_returns_to_idle() {
        let mut machine = EncounterMachine::new(5000);
        machine.observe(&[boss(1, 10)], 10_000);
        machine.observe(&[], 11_000);

        let t = machine.observe(&[], 15_000);
        assert_eq!(
            t,
            Some(Transition::Disengaged {
                boss_id: 1,
                boss_name: "Boss 1".into(),
                started_at: 10_000,
                ended_at: 15_000,
            })
        );
        assert_eq!(machine.state(), EncounterState::Idle);
        assert_eq!(machine.active_boss_id(), None);
        assert_eq!(machine.active_boss_name(), None);

        // A new encounter may start again
        assert!(matches!(machine.observe(&[boss(1, 1)], 16_000), Some(Transition::Engaged { .. })));
    }

    #[test]
    fn late_observation_ends_directly_from_active() {
        let mut machine = EncounterMachine::new(5000);
        machine.observe(&[boss(1, 10)], 0);
        assert!(matches!(machine.observe(&[], 7_000), Some(Transition::Disengaged { .. })));
    }

    #[test]
    fn highest_total_boss_is_chosen() {
        let mut machine = EncounterMachine::new(5000);
        machine.observe(&[boss(3, 10), boss(2, 90), boss(1, 90)], 0);
        assert_eq!(machine.active_boss_id(), Some(1));
    }

    #[test]
    fn pause_accounting() {
        let mut clock = PauseClock::default();
        assert!(clock.pause(1_000));
        assert!(!clock.pause(1_500)); // already paused, start unchanged
        assert_eq!(clock.paused_ms_at(1_800), 800);
        assert!(clock.resume(3_500));
        assert_eq!(clock.total_paused_ms(), 2_500);
        assert!(!clock.resume(4_000));

        clock.pause(5_000);
        clock.resume(5_000);
        assert_eq!(clock.total_paused_ms(), 2_500);
        assert_eq!(clock.last_paused_at(), None);
    }
}
