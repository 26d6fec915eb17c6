use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncProfile {
    Aggressive,
    Balanced,
    Conservative,
    PowerSave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Cellular,
    Unknown,
}

/// Effective bandwidth class as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

/// Network and power signals fed to the controller by the host platform.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSignals {
    pub connection: ConnectionType,
    pub effective_type: EffectiveType,
    pub rtt_ms: u64,
    pub save_data: bool,
    pub battery_saver: bool,
    /// Remaining battery fraction when known, 0.0..=1.0.
    pub battery_level: Option<f32>,
}

impl Default for NetworkSignals {
    fn default() -> Self {
        NetworkSignals {
            connection: ConnectionType::Unknown,
            effective_type: EffectiveType::FourG,
            rtt_ms: 50,
            save_data: false,
            battery_saver: false,
            battery_level: None,
        }
    }
}

/// Snapshot the engine consumes each cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveSettings {
    pub profile: SyncProfile,
    pub batch_size: usize,
    pub sync_interval: Duration,
    pub compression: bool,
    pub retry_base_delay: Duration,
    /// Collections in push/pull order.
    pub priorities: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveBounds {
    pub min_batch: usize,
    pub max_batch: usize,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub enable_compression: bool,
    pub retry_base_delay: Duration,
    pub power_save_threshold: f32,
}

/// Chooses batch size, interval, compression and collection priority from
/// observed conditions. Pure state machine: the engine feeds signals and
/// outcomes, the controller answers with a clamped settings snapshot.
#[derive(Debug)]
pub struct AdaptiveController {
    bounds: AdaptiveBounds,
    signals: NetworkSignals,
    durations: VecDeque<Duration>,
    outcomes: VecDeque<bool>,
    priorities: BTreeMap<String, i32>,
    pending: BTreeMap<String, usize>,
}

const SAMPLE_WINDOW: usize = 20;

impl AdaptiveController {
    pub fn new(bounds: AdaptiveBounds) -> Self {
        AdaptiveController {
            bounds,
            signals: NetworkSignals::default(),
            durations: VecDeque::new(),
            outcomes: VecDeque::new(),
            priorities: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn update_signals(&mut self, signals: NetworkSignals) {
        self.signals = signals;
    }

    pub fn record_sync(&mut self, duration: Duration, success: bool) {
        if self.durations.len() >= SAMPLE_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(duration);
        if self.outcomes.len() >= SAMPLE_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    pub fn set_priority(&mut self, collection: &str, priority: i32) {
        self.priorities.insert(collection.to_string(), priority);
    }

    pub fn observe_pending(&mut self, collection: &str, count: usize) {
        self.pending.insert(collection.to_string(), count);
    }

    fn success_rate(&self) -> f32 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let ok = self.outcomes.iter().filter(|b| **b).count();
        ok as f32 / self.outcomes.len() as f32
    }

    fn average_duration(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        let total: Duration = self.durations.iter().sum();
        Some(total / self.durations.len() as u32)
    }

    /// Profile decision table.
    pub fn profile(&self) -> SyncProfile {
        let s = &self.signals;
        let battery_low = s
            .battery_level
            .is_some_and(|level| level <= self.bounds.power_save_threshold);
        if s.save_data || s.battery_saver || battery_low {
            return SyncProfile::PowerSave;
        }
        match s.effective_type {
            EffectiveType::Slow2g | EffectiveType::TwoG => SyncProfile::Conservative,
            EffectiveType::ThreeG => SyncProfile::Balanced,
            EffectiveType::FourG => {
                if s.rtt_ms > 500 {
                    SyncProfile::Balanced
                } else {
                    SyncProfile::Aggressive
                }
            }
        }
    }

    /// Current settings, clamped to the configured bounds.
    pub fn settings(&self, collections: &[String]) -> AdaptiveSettings {
        let profile = self.profile();
        let b = &self.bounds;
        let mid_batch = usize::midpoint(b.min_batch, b.max_batch);
        let mid_interval = (b.min_interval + b.max_interval) / 2;

        let (mut batch_size, sync_interval, delay_factor) = match profile {
            SyncProfile::Aggressive => (b.max_batch, b.min_interval, 1u32),
            SyncProfile::Balanced => (mid_batch, mid_interval, 1),
            SyncProfile::Conservative => (usize::midpoint(b.min_batch, mid_batch), mid_interval.max(b.max_interval / 2), 2),
            SyncProfile::PowerSave => (b.min_batch, b.max_interval, 4),
        };

        // A failing link gets smaller batches regardless of profile.
        if self.success_rate() < 0.5 {
            batch_size /= 2;
        }
        // Cycles eating a large share of the period stretch the interval.
        let mut sync_interval = sync_interval;
        if let Some(avg) = self.average_duration() {
            if avg.saturating_mul(4) > sync_interval {
                sync_interval = sync_interval.saturating_mul(2);
            }
        }
        let batch_size = batch_size.clamp(b.min_batch, b.max_batch);
        let sync_interval = sync_interval.clamp(b.min_interval, b.max_interval);

        let compression = b.enable_compression && profile != SyncProfile::Aggressive;

        let mut priorities: Vec<String> = collections.to_vec();
        priorities.sort_by(|a, c| {
            let pa = self.priorities.get(a).copied().unwrap_or(0);
            let pc = self.priorities.get(c).copied().unwrap_or(0);
            pc.cmp(&pa)
                .then_with(|| {
                    let qa = self.pending.get(a).copied().unwrap_or(0);
                    let qc = self.pending.get(c).copied().unwrap_or(0);
                    qc.cmp(&qa)
                })
                .then_with(|| a.cmp(c))
        });

        AdaptiveSettings {
            profile,
            batch_size,
            sync_interval,
            compression,
            retry_base_delay: b.retry_base_delay.saturating_mul(delay_factor),
            priorities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> AdaptiveBounds {
        AdaptiveBounds {
            min_batch: 10,
            max_batch: 200,
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(300),
            enable_compression: true,
            retry_base_delay: Duration::from_millis(1000),
            power_save_threshold: 0.2,
        }
    }

    fn signals(effective: EffectiveType, rtt: u64) -> NetworkSignals {
        NetworkSignals {
            connection: ConnectionType::Wifi,
            effective_type: effective,
            rtt_ms: rtt,
            ..NetworkSignals::default()
        }
    }

    #[test]
    fn decision_table() {
        let mut c = AdaptiveController::new(bounds());

        c.update_signals(NetworkSignals {
            save_data: true,
            ..signals(EffectiveType::FourG, 20)
        });
        assert_eq!(c.profile(), SyncProfile::PowerSave);

        c.update_signals(NetworkSignals {
            battery_saver: true,
            ..signals(EffectiveType::FourG, 20)
        });
        assert_eq!(c.profile(), SyncProfile::PowerSave);

        c.update_signals(NetworkSignals {
            battery_level: Some(0.1),
            ..signals(EffectiveType::FourG, 20)
        });
        assert_eq!(c.profile(), SyncProfile::PowerSave);

        c.update_signals(signals(EffectiveType::Slow2g, 20));
        assert_eq!(c.profile(), SyncProfile::Conservative);
        c.update_signals(signals(EffectiveType::TwoG, 20));
        assert_eq!(c.profile(), SyncProfile::Conservative);

        c.update_signals(signals(EffectiveType::ThreeG, 20));
        assert_eq!(c.profile(), SyncProfile::Balanced);
        c.update_signals(signals(EffectiveType::FourG, 750));
        assert_eq!(c.profile(), SyncProfile::Balanced);

        c.update_signals(signals(EffectiveType::FourG, 20));
        assert_eq!(c.profile(), SyncProfile::Aggressive);
    }

    #[test]
    fn settings_are_clamped() {
        let mut c = AdaptiveController::new(bounds());
        c.update_signals(signals(EffectiveType::FourG, 20));
        let s = c.settings(&[]);
        assert_eq!(s.batch_size, 200);
        assert_eq!(s.sync_interval, Duration::from_secs(5));
        assert!(!s.compression);

        c.update_signals(NetworkSignals {
            save_data: true,
            ..signals(EffectiveType::FourG, 20)
        });
        let s = c.settings(&[]);
        assert_eq!(s.batch_size, 10);
        assert_eq!(s.sync_interval, Duration::from_secs(300));
        assert!(s.compression);
        assert_eq!(s.retry_base_delay, Duration::from_millis(4000));
    }

    #[test]
    fn low_success_rate_shrinks_batches_within_bounds() {
        let mut c = AdaptiveController::new(bounds());
        c.update_signals(signals(EffectiveType::FourG, 20));
        for i in 0..10 {
            c.record_sync(Duration::from_millis(100), i % 4 == 0);
        }
        let s = c.settings(&[]);
        assert_eq!(s.batch_size, 100);

        // Power-save already sits at the minimum; halving cannot go below.
        c.update_signals(NetworkSignals {
            save_data: true,
            ..signals(EffectiveType::FourG, 20)
        });
        assert_eq!(c.settings(&[]).batch_size, 10);
    }

    #[test]
    fn slow_observed_cycles_stretch_the_interval() {
        let mut c = AdaptiveController::new(bounds());
        c.update_signals(signals(EffectiveType::FourG, 20));
        assert_eq!(c.settings(&[]).sync_interval, Duration::from_secs(5));

        for _ in 0..5 {
            c.record_sync(Duration::from_secs(2), true);
        }
        assert_eq!(c.settings(&[]).sync_interval, Duration::from_secs(10));
    }

    #[test]
    fn priorities_order_by_priority_then_pending() {
        let mut c = AdaptiveController::new(bounds());
        c.set_priority("critical", 10);
        c.observe_pending("busy", 42);
        c.observe_pending("quiet", 1);

        let collections: Vec<String> = ["quiet", "busy", "critical"]
            .into_iter()
            .map(String::from)
            .collect();
        let s = c.settings(&collections);
        assert_eq!(s.priorities, vec!["critical", "busy", "quiet"]);
    }

    #[test]
    fn compression_follows_enable_flag() {
        let mut disabled = bounds();
        disabled.enable_compression = false;
        let mut c = AdaptiveController::new(disabled);
        c.update_signals(NetworkSignals {
            save_data: true,
            ..signals(EffectiveType::FourG, 20)
        });
        assert!(!c.settings(&[]).compression);
    }
}
