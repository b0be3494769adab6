use rand::Rng;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kinds of screens performed by the testing coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenKind {
    Reactive,
    FollowUp,
    Preventive,
}

/// Model-wide accumulators. They only ever increase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub diagnostic_tests: u64,
    pub preventive_tests: u64,
    /// Infections that recovered without ever being detected.
    pub undetected_infections: u64,
    /// Infections detected before the onset of infectiousness.
    pub predetected_infections: u64,
    /// Transmissions by agents waiting for a positive test result.
    pub pending_test_infections: u64,
    /// Days spent in quarantine, per agent type.
    pub quarantine_days: BTreeMap<String, u64>,
}

/// Agent types screened during the current day, per kind of screen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Screens {
    pub reactive: BTreeMap<String, bool>,
    pub follow_up: BTreeMap<String, bool>,
    pub preventive: BTreeMap<String, bool>,
}

impl Screens {
    fn new<'a, I: IntoIterator<Item = &'a String>>(kinds: I) -> Self {
        let flags: BTreeMap<_, _> = kinds.into_iter().map(|kind| (kind.clone(), false)).collect();
        Self {
            reactive: flags.clone(),
            follow_up: flags.clone(),
            preventive: flags,
        }
    }

    pub fn mark(&mut self, screen: ScreenKind, kind: &str) {
        let flags = match screen {
            ScreenKind::Reactive => &mut self.reactive,
            ScreenKind::FollowUp => &mut self.follow_up,
            ScreenKind::Preventive => &mut self.preventive,
        };
        flags.insert(kind.to_string(), true);
    }

    pub fn reset(&mut self) {
        for flags in [&mut self.reactive, &mut self.follow_up, &mut self.preventive] {
            flags.values_mut().for_each(|flag| *flag = false);
        }
    }
}

/// Simulation context.
///
/// Owns everything shared between agents: the current day, the random number
/// generator, the model-wide counters, the agents with new positive results
/// waiting for contact tracing and the screens of the current day.
#[derive(Serialize, Deserialize)]
pub struct SimContext {
    pub day: u32,
    pub rng: ChaCha12Rng,
    pub counters: Counters,
    /// Indices of agents with a positive result not yet traced.
    pub newly_positive: Vec<usize>,
    pub screened: Screens,
    /// Day of the most recent positive result.
    pub last_positive_day: Option<u32>,
}

impl SimContext {
    pub fn new<'a, I>(rng: ChaCha12Rng, kinds: I) -> Self
    where
        I: IntoIterator<Item = &'a String> + Clone,
    {
        let quarantine_days = kinds.clone().into_iter().map(|kind| (kind.clone(), 0)).collect();
        Self {
            day: 0,
            rng,
            counters: Counters {
                quarantine_days,
                ..Counters::default()
            },
            newly_positive: Vec::new(),
            screened: Screens::new(kinds),
            last_positive_day: None,
        }
    }

    /// Draw a uniform number in `[0, 1)`.
    pub fn draw(&mut self) -> f64 {
        self.rng.random()
    }
}

#[cfg(test)]
impl Screens {
    pub fn get(&self, screen: ScreenKind) -> &BTreeMap<String, bool> {
        match screen {
            ScreenKind::Reactive => &self.reactive,
            ScreenKind::FollowUp => &self.follow_up,
            ScreenKind::Preventive => &self.preventive,
        }
    }
}
