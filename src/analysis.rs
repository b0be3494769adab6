use crate::config::Config;
use crate::model::{InfectionState, Record};
use crate::stats::Accumulator;
use anyhow::{Context, Result};
use rmp_serde::decode;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

pub trait Obs {
    fn update(&mut self, record: &Record) -> Result<()>;
    fn report(&self) -> serde_json::Value;
}

/// Number of agents in each compartment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Compartments {
    pub exposed: usize,
    pub infectious: usize,
    pub infectious_symptomatic: usize,
    pub infectious_asymptomatic: usize,
    pub recovered: usize,
    pub quarantined: usize,
}

impl Compartments {
    fn max(self, other: Self) -> Self {
        Self {
            exposed: self.exposed.max(other.exposed),
            infectious: self.infectious.max(other.infectious),
            infectious_symptomatic: self.infectious_symptomatic.max(other.infectious_symptomatic),
            infectious_asymptomatic: self
                .infectious_asymptomatic
                .max(other.infectious_asymptomatic),
            recovered: self.recovered.max(other.recovered),
            quarantined: self.quarantined.max(other.quarantined),
        }
    }
}

/// Peak and final compartment sizes per agent type.
#[derive(Default)]
pub struct CompartmentSizes {
    peak: BTreeMap<String, Compartments>,
    last: BTreeMap<String, Compartments>,
}

impl CompartmentSizes {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Obs for CompartmentSizes {
    fn update(&mut self, record: &Record) -> Result<()> {
        let mut sizes: BTreeMap<String, Compartments> = BTreeMap::new();
        for agent in &record.agents {
            let size = sizes.entry(agent.kind.clone()).or_default();
            match agent.infection_state {
                InfectionState::Susceptible => {}
                InfectionState::Exposed => size.exposed += 1,
                InfectionState::Infectious => {
                    size.infectious += 1;
                    if agent.symptomatic_course {
                        size.infectious_symptomatic += 1;
                    } else {
                        size.infectious_asymptomatic += 1;
                    }
                }
                InfectionState::Recovered => size.recovered += 1,
            }
            if agent.quarantine_state {
                size.quarantined += 1;
            }
        }

        for (kind, &size) in &sizes {
            let peak = self.peak.entry(kind.clone()).or_default();
            *peak = peak.max(size);
        }
        self.last = sizes;
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "compartments": { "peak": self.peak, "final": self.last } })
    }
}

/// Number of days on which each kind of screen was performed, per agent type.
#[derive(Default)]
pub struct ScreenDays {
    reactive: BTreeMap<String, usize>,
    follow_up: BTreeMap<String, usize>,
    preventive: BTreeMap<String, usize>,
}

impl ScreenDays {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Obs for ScreenDays {
    fn update(&mut self, record: &Record) -> Result<()> {
        let screened = &record.screened;
        for (days, flags) in [
            (&mut self.reactive, &screened.reactive),
            (&mut self.follow_up, &screened.follow_up),
            (&mut self.preventive, &screened.preventive),
        ] {
            for (kind, &flag) in flags {
                *days.entry(kind.clone()).or_default() += usize::from(flag);
            }
        }
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "screen_days": {
                "reactive": self.reactive,
                "follow_up": self.follow_up,
                "preventive": self.preventive,
            }
        })
    }
}

/// One link of the transmission chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionEvent {
    pub day: u32,
    pub source: String,
    pub source_type: String,
    pub target: String,
    pub target_type: String,
}

/// Outbreak statistics at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutbreakStats {
    /// Mean number of transmissions per infected agent, undefined without infections.
    pub r0: Option<f64>,
    pub r0_by_type: BTreeMap<String, Option<f64>>,
    /// Mean number of transmissions of the agents transmitting on the first transmission day.
    pub finite_size_r0: f64,
    pub infected_agents: usize,
    pub infected_by_type: BTreeMap<String, usize>,
    pub transmissions: u64,
    /// Recovered agents that never transmitted.
    pub infection_endpoints: usize,
    /// Transmissions per source type and target type.
    pub typed_transmissions: BTreeMap<String, BTreeMap<String, u64>>,
    pub quarantine_days: BTreeMap<String, u64>,
    pub diagnostic_tests: u64,
    pub preventive_tests: u64,
    pub undetected_infections: u64,
    pub predetected_infections: u64,
    pub pending_test_infections: u64,
    pub duration: usize,
    /// Agents of the screened types, the denominator of the test rates.
    pub tested_agents: usize,
    pub diagnostic_tests_per_day_per_agent: f64,
    pub preventive_tests_per_day_per_agent: f64,
    pub tests_per_day_per_agent: f64,
    pub transmission_chain: Vec<TransmissionEvent>,
}

impl OutbreakStats {
    /// Compute the statistics from the last record of a run lasting `duration` days.
    ///
    /// Test rates are relative to the agents of `tested_types`, or to every
    /// agent when no type is screened.
    pub fn from_record(
        record: &Record,
        duration: usize,
        tested_types: &BTreeSet<String>,
    ) -> Self {
        let kind_of: BTreeMap<&str, &str> = record
            .agents
            .iter()
            .map(|agent| (agent.id.as_str(), agent.kind.as_str()))
            .collect();

        let mut r0_acc = Accumulator::new();
        let mut r0_acc_by_type: BTreeMap<String, Accumulator> = BTreeMap::new();
        let mut infected_by_type = BTreeMap::new();
        let mut transmissions = 0;
        let mut infection_endpoints = 0;
        let mut typed_transmissions: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        let mut transmission_chain = Vec::new();

        for agent in &record.agents {
            let r0_acc_type = r0_acc_by_type.entry(agent.kind.clone()).or_default();
            let infected = infected_by_type.entry(agent.kind.clone()).or_insert(0);
            if agent.infection_state.was_infected() {
                r0_acc.add(agent.transmissions as f64);
                r0_acc_type.add(agent.transmissions as f64);
                *infected += 1;
                if agent.infection_state.is_recovered() && agent.transmissions == 0 {
                    infection_endpoints += 1;
                }
            }
            transmissions += u64::from(agent.transmissions);

            for (target, &day) in &agent.transmission_targets {
                let target_type = kind_of.get(target.as_str()).copied().unwrap_or("unknown");
                *typed_transmissions
                    .entry(agent.kind.clone())
                    .or_default()
                    .entry(target_type.to_string())
                    .or_default() += 1;
                transmission_chain.push(TransmissionEvent {
                    day,
                    source: agent.id.clone(),
                    source_type: agent.kind.clone(),
                    target: target.clone(),
                    target_type: target_type.to_string(),
                });
            }
        }
        transmission_chain.sort_by(|a, b| {
            (a.day, &a.source, &a.target).cmp(&(b.day, &b.source, &b.target))
        });

        let counters = &record.counters;
        let tested_agents = if tested_types.is_empty() {
            record.agents.len()
        } else {
            record
                .agents
                .iter()
                .filter(|agent| tested_types.contains(&agent.kind))
                .count()
        };
        let agent_days = (duration * tested_agents) as f64;
        let per_agent_day = |n_tests: u64| {
            if agent_days > 0.0 {
                n_tests as f64 / agent_days
            } else {
                0.0
            }
        };

        Self {
            r0: r0_acc.mean(),
            r0_by_type: r0_acc_by_type
                .into_iter()
                .map(|(kind, acc)| (kind, acc.mean()))
                .collect(),
            finite_size_r0: finite_size_r0(&transmission_chain),
            infected_agents: infected_by_type.values().sum(),
            infected_by_type,
            transmissions,
            infection_endpoints,
            typed_transmissions,
            quarantine_days: counters.quarantine_days.clone(),
            diagnostic_tests: counters.diagnostic_tests,
            preventive_tests: counters.preventive_tests,
            undetected_infections: counters.undetected_infections,
            predetected_infections: counters.predetected_infections,
            pending_test_infections: counters.pending_test_infections,
            duration,
            tested_agents,
            diagnostic_tests_per_day_per_agent: per_agent_day(counters.diagnostic_tests),
            preventive_tests_per_day_per_agent: per_agent_day(counters.preventive_tests),
            tests_per_day_per_agent: per_agent_day(
                counters.diagnostic_tests + counters.preventive_tests,
            ),
            transmission_chain,
        }
    }

    /// Scalar observables summarized over an ensemble of runs.
    ///
    /// Undefined observables are left out.
    pub fn scalars(&self) -> BTreeMap<String, f64> {
        let mut scalars = BTreeMap::new();
        if let Some(r0) = self.r0 {
            scalars.insert("r0".to_string(), r0);
        }
        for (name, val) in [
            ("finite_size_r0", self.finite_size_r0),
            ("infected_agents", self.infected_agents as f64),
            ("transmissions", self.transmissions as f64),
            ("infection_endpoints", self.infection_endpoints as f64),
            ("diagnostic_tests", self.diagnostic_tests as f64),
            ("preventive_tests", self.preventive_tests as f64),
            ("undetected_infections", self.undetected_infections as f64),
            ("predetected_infections", self.predetected_infections as f64),
            ("pending_test_infections", self.pending_test_infections as f64),
            ("tests_per_day_per_agent", self.tests_per_day_per_agent),
            ("duration", self.duration as f64),
        ] {
            scalars.insert(name.to_string(), val);
        }
        for (kind, &infected) in &self.infected_by_type {
            scalars.insert(format!("infected_{kind}"), infected as f64);
        }
        for (kind, &days) in &self.quarantine_days {
            scalars.insert(format!("quarantine_days_{kind}"), days as f64);
        }
        scalars
    }
}

/// Mean number of transmissions of the first transmitters, 0 without transmissions.
fn finite_size_r0(chain: &[TransmissionEvent]) -> f64 {
    let Some(first_day) = chain.iter().map(|event| event.day).min() else {
        return 0.0;
    };
    let first_sources: BTreeSet<&str> = chain
        .iter()
        .filter(|event| event.day == first_day)
        .map(|event| event.source.as_str())
        .collect();

    let mut acc = Accumulator::new();
    for source in first_sources {
        let n_trans = chain.iter().filter(|event| event.source == source).count();
        acc.add(n_trans as f64);
    }
    acc.mean().unwrap_or(0.0)
}

/// Outbreak statistics from the last record seen.
pub struct Outbreak {
    tested_types: BTreeSet<String>,
    last: Option<Record>,
    n_days: usize,
}

impl Outbreak {
    pub fn new(tested_types: BTreeSet<String>) -> Self {
        Self {
            tested_types,
            last: None,
            n_days: 0,
        }
    }

    pub fn stats(&self) -> Option<OutbreakStats> {
        self.last
            .as_ref()
            .map(|record| OutbreakStats::from_record(record, self.n_days, &self.tested_types))
    }
}

impl Obs for Outbreak {
    fn update(&mut self, record: &Record) -> Result<()> {
        self.last = Some(record.clone());
        self.n_days += 1;
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "outbreak": self.stats() })
    }
}

pub struct Analyzer {
    cfg: Config,
    outbreak: Outbreak,
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    pub fn new(cfg: Config) -> Self {
        let obs_ptr_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(CompartmentSizes::new()),
            Box::new(ScreenDays::new()),
        ];
        let tested_types = cfg
            .types
            .iter()
            .filter(|(_, params)| params.is_screened())
            .map(|(kind, _)| kind.clone())
            .collect();
        Self {
            cfg,
            outbreak: Outbreak::new(tested_types),
            obs_ptr_vec,
        }
    }

    pub fn add_file<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);

        for _ in 0..self.cfg.output.days_per_file {
            let record = decode::from_read(&mut reader).context("failed to read record")?;
            self.add_record(&record)?;
        }
        Ok(())
    }

    pub fn add_record(&mut self, record: &Record) -> Result<()> {
        self.outbreak
            .update(record)
            .context("failed to update outbreak")?;
        for obs in &mut self.obs_ptr_vec {
            obs.update(record).context("failed to update observable")?;
        }
        Ok(())
    }

    pub fn outbreak_stats(&self) -> Option<OutbreakStats> {
        self.outbreak.stats()
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);

        let mut reports = vec![self.outbreak.report()];
        reports.extend(self.obs_ptr_vec.iter().map(|obs| obs.report()));
        serde_json::to_writer_pretty(writer, &reports).context("failed to serialize results")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Counters, Screens};
    use crate::model::AgentSnapshot;
    use approx::assert_relative_eq;

    fn snapshot(
        id: &str,
        kind: &str,
        infection_state: InfectionState,
        targets: &[(&str, u32)],
    ) -> AgentSnapshot {
        AgentSnapshot {
            id: id.to_string(),
            kind: kind.to_string(),
            infection_state,
            quarantine_state: false,
            symptomatic_course: true,
            transmissions: targets.len() as u32,
            transmission_targets: targets
                .iter()
                .map(|&(target, day)| (target.to_string(), day))
                .collect(),
        }
    }

    fn record(agents: Vec<AgentSnapshot>) -> Record {
        Record {
            day: 9,
            agents,
            counters: Counters {
                diagnostic_tests: 6,
                preventive_tests: 14,
                ..Counters::default()
            },
            screened: Screens::default(),
        }
    }

    #[test]
    fn outbreak_statistics() {
        use InfectionState::*;
        let rec = record(vec![
            snapshot("e1", "employee", Recovered, &[("r1", 2), ("r2", 2)]),
            snapshot("r1", "resident", Recovered, &[("r3", 6)]),
            snapshot("r2", "resident", Infectious, &[]),
            snapshot("r3", "resident", Exposed, &[]),
            snapshot("r4", "resident", Susceptible, &[]),
        ]);
        let stats = OutbreakStats::from_record(&rec, 10, &BTreeSet::new());

        assert_relative_eq!(stats.r0.unwrap(), 0.75);
        assert_relative_eq!(stats.r0_by_type["employee"].unwrap(), 2.0);
        assert_relative_eq!(stats.r0_by_type["resident"].unwrap(), 1.0 / 3.0);
        assert_relative_eq!(stats.finite_size_r0, 2.0);
        assert_eq!(stats.infected_agents, 4);
        assert_eq!(stats.infected_by_type["resident"], 3);
        assert_eq!(stats.transmissions, 3);
        assert_eq!(stats.infection_endpoints, 0);
        assert_eq!(stats.typed_transmissions["employee"]["resident"], 2);
        assert_eq!(stats.typed_transmissions["resident"]["resident"], 1);
        assert_relative_eq!(stats.tests_per_day_per_agent, 20.0 / 50.0);

        let chain: Vec<_> = stats
            .transmission_chain
            .iter()
            .map(|event| (event.day, event.source.as_str(), event.target.as_str()))
            .collect();
        assert_eq!(chain, [(2, "e1", "r1"), (2, "e1", "r2"), (6, "r1", "r3")]);

        let scalars = stats.scalars();
        assert_eq!(scalars["infected_resident"], 3.0);
        assert!(scalars.contains_key("r0"));
    }

    #[test]
    fn no_infections_give_defined_statistics() {
        let rec = record(vec![snapshot(
            "r1",
            "resident",
            InfectionState::Susceptible,
            &[],
        )]);
        let stats = OutbreakStats::from_record(&rec, 0, &BTreeSet::new());
        assert_eq!(stats.r0, None);
        assert_eq!(stats.r0_by_type["resident"], None);
        assert_eq!(stats.finite_size_r0, 0.0);
        assert_eq!(stats.tests_per_day_per_agent, 0.0);
        assert!(!stats.scalars().contains_key("r0"));
        assert!(stats.scalars().values().all(|val| val.is_finite()));
    }

    #[test]
    fn test_rates_count_only_screened_types() {
        use InfectionState::*;
        let rec = record(vec![
            snapshot("f1", "family_member", Susceptible, &[]),
            snapshot("f2", "family_member", Susceptible, &[]),
            snapshot("s1", "student", Susceptible, &[]),
            snapshot("t1", "teacher", Susceptible, &[]),
        ]);
        let tested_types = BTreeSet::from(["student".to_string(), "teacher".to_string()]);
        let stats = OutbreakStats::from_record(&rec, 10, &tested_types);
        assert_eq!(stats.tested_agents, 2);
        assert_relative_eq!(stats.tests_per_day_per_agent, 1.0);
        assert_relative_eq!(stats.preventive_tests_per_day_per_agent, 0.7);
        assert_relative_eq!(stats.diagnostic_tests_per_day_per_agent, 0.3);
    }

    #[test]
    fn observables_track_peaks_and_screens() {
        use InfectionState::*;
        let mut analyzer = Analyzer::new(crate::config::tests::nursing_home());

        let mut first = record(vec![
            snapshot("e1", "employee", Infectious, &[]),
            snapshot("r1", "resident", Exposed, &[]),
        ]);
        first.screened.preventive.insert("employee".into(), true);
        let mut second = record(vec![
            snapshot("e1", "employee", Recovered, &[]),
            snapshot("r1", "resident", Infectious, &[]),
        ]);
        second.agents[1].quarantine_state = true;
        second.screened.preventive.insert("employee".into(), false);

        analyzer.add_record(&first).unwrap();
        analyzer.add_record(&second).unwrap();

        let compartments = analyzer.obs_ptr_vec[0].report();
        assert_eq!(compartments["compartments"]["peak"]["employee"]["infectious"], 1);
        assert_eq!(compartments["compartments"]["final"]["employee"]["infectious"], 0);
        assert_eq!(compartments["compartments"]["final"]["resident"]["quarantined"], 1);

        let screens = analyzer.obs_ptr_vec[1].report();
        assert_eq!(screens["screen_days"]["preventive"]["employee"], 1);

        let stats = analyzer.outbreak_stats().unwrap();
        assert_eq!(stats.duration, 2);
        assert_eq!(stats.infected_agents, 2);
        assert_eq!(stats.tested_agents, 2);
    }
}
