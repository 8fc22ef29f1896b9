use serde::Serialize;

use super::stats::{CountBreakdown, HitCategory};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SkillKind {
    Damage,
    Healing,
}

/// Category totals of one skill used by one player.
#[derive(Debug, Clone)]
pub struct SkillStats {
    kind: SkillKind,
    element: u8,
    damage: SkillBreakdown,
    counts: CountBreakdown,
}

/// Same split as the player's totals but without the hpLessen side bucket.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkillBreakdown {
    pub normal: u64,
    pub critical: u64,
    pub lucky: u64,
    pub crit_lucky: u64,
    pub total: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SkillSnapshot {
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: SkillKind,
    pub element_type: u8,
    pub total_damage: u64,
    pub total_count: u64,
    pub crit_count: u64,
    pub lucky_count: u64,
    pub crit_rate: f64,
    pub lucky_rate: f64,
    pub damage_breakdown: SkillBreakdown,
    pub count_breakdown: CountBreakdown,
}

impl SkillStats {
    pub fn new(kind: SkillKind, element: u8) -> Self {
        Self { kind, element, damage: SkillBreakdown::default(), counts: CountBreakdown::default() }
    }

    pub fn record(&mut self, amount: u64, category: HitCategory, element: u8) {
        let bucket = match category {
            HitCategory::Normal => &mut self.damage.normal,
            HitCategory::Critical => &mut self.damage.critical,
            HitCategory::Lucky => &mut self.damage.lucky,
            HitCategory::CritLucky => &mut self.damage.crit_lucky,
        };
        *bucket = bucket.saturating_add(amount);
        self.damage.total = self.damage.total.saturating_add(amount);
        self.counts.add(category);
        self.element = element;
    }

    pub fn total(&self) -> u64 {
        self.damage.total
    }

    pub fn snapshot(&self, display_name: String) -> SkillSnapshot {
        let rate = |n: u64| if self.counts.total == 0 { 0.0 } else { n as f64 / self.counts.total as f64 };
        SkillSnapshot {
            display_name,
            kind: self.kind,
            element_type: self.element,
            total_damage: self.damage.total,
            total_count: self.counts.total,
            crit_count: self.counts.critical,
            lucky_count: self.counts.lucky,
            crit_rate: rate(self.counts.critical),
            lucky_rate: rate(self.counts.lucky),
            damage_breakdown: self.damage,
            count_breakdown: self.counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_rates_and_breakdown() {
        let mut skill = SkillStats::new(SkillKind::Damage, 0);
        skill.record(500, HitCategory::Critical, 3);
        skill.record(300, HitCategory::Normal, 3);
        skill.record(200, HitCategory::CritLucky, 3);
        skill.record(100, HitCategory::Lucky, 3);

        let snap = skill.snapshot("Slash".to_string());
        assert_eq!(snap.total_damage, 1100);
        assert_eq!(snap.total_count, 4);
        assert_eq!(snap.crit_count, 2);
        assert_eq!(snap.lucky_count, 2);
        assert_eq!(snap.crit_rate, 0.5);
        assert_eq!(snap.element_type, 3);
        assert_eq!(
            snap.damage_breakdown,
            SkillBreakdown { normal: 300, critical: 500, lucky: 100, crit_lucky: 200, total: 1100 }
        );
    }

    #[test]
    fn snapshot_serialises_with_wire_names() {
        let mut skill = SkillStats::new(SkillKind::Healing, 1);
        skill.record(40, HitCategory::Normal, 1);

        let json = serde_json::to_value(skill.snapshot("Mend".to_string())).unwrap();
        assert_eq!(json["displayName"], "Mend");
        assert_eq!(json["type"], "healing");
        assert_eq!(json["totalDamage"], 40);
        assert_eq!(json["damageBreakdown"]["crit_lucky"], 0);
        assert_eq!(json["countBreakdown"]["normal"], 1);
    }
}
