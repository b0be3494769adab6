use crate::config::Config;
use crate::context::SimContext;
use crate::model::{Agent, Record};
use crate::network::ContactGraph;
use crate::testing::perform_testing;
use crate::transmission::{introduce_index_cases, spread_infection};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::Uniform;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Simulation engine.
///
/// Holds the configuration, the contact network, the agents and the
/// simulation context, and provides methods to initialize, run, save, and
/// load simulations.
#[derive(Serialize, Deserialize)]
pub struct Engine {
    cfg: Config,
    graph: ContactGraph,
    agents: Vec<Agent>,
    ctx: SimContext,
}

impl Engine {
    /// Create a new `Engine` with every agent susceptible.
    ///
    /// Uses `seed` for the random number generator, or OS entropy when it is missing.
    pub fn generate_initial_condition(
        cfg: Config,
        graph: ContactGraph,
        seed: Option<u64>,
    ) -> Result<Self> {
        let rng = match seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng()?,
        };
        Self::new(cfg, graph, rng)
    }

    pub fn new(cfg: Config, graph: ContactGraph, mut rng: ChaCha12Rng) -> Result<Self> {
        graph
            .validate_against(&cfg)
            .context("network does not match config")?;

        let agents = graph
            .nodes()
            .iter()
            .map(|node| Agent::new(node, &cfg, &mut rng))
            .collect::<Result<Vec<_>>>()
            .context("failed to create agents")?;

        let ctx = SimContext::new(rng, cfg.types.keys());
        let mut engine = Self {
            cfg,
            graph,
            agents,
            ctx,
        };

        if let Some(kind) = engine.cfg.init.index_case.clone() {
            engine
                .seed_index_case(&kind)
                .context("failed to seed index case")?;
        }

        Ok(engine)
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn graph(&self) -> &ContactGraph {
        &self.graph
    }

    /// Perform the simulation and save the daily records to a binary file.
    pub fn perform_simulation<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);

        let n_days = self.cfg.output.days_per_file;
        let days_per_log = n_days.div_ceil(10);
        for i_day in 0..n_days {
            let record = self.step().context("failed to perform step")?;

            encode::write_named(&mut writer, &record).context("failed to serialize record")?;

            if (i_day + 1) % days_per_log == 0 || i_day + 1 == n_days {
                let progress = 100.0 * (i_day + 1) as f64 / n_days as f64;
                log::info!("completed {progress:06.2}%");
            }
        }

        writer.flush().context("failed to flush writer stream")?;

        Ok(())
    }

    /// Save a checkpoint of the entire engine state.
    ///
    /// Can be used to resume the simulation later.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write_named(&mut writer, &self).context("failed to serialize engine")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    /// Load a previously saved engine checkpoint.
    pub fn load_checkpoint<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let engine = decode::from_read(&mut reader).context("failed to deserialize engine")?;
        Ok(engine)
    }

    /// Simulate one day and return its record.
    pub fn step(&mut self) -> Result<Record> {
        // Decide: stage new infections against yesterday's states.
        introduce_index_cases(&mut self.agents, &mut self.ctx)
            .context("failed to introduce index cases")?;
        spread_infection(&mut self.agents, &self.graph, &self.cfg, &mut self.ctx)
            .context("failed to spread infection")?;

        // Commit: every agent advances from its own staged state and counters.
        let quarantine_duration = self.cfg.disease.quarantine_duration;
        for agent in &mut self.agents {
            agent.advance(quarantine_duration, &mut self.ctx);
        }

        perform_testing(&mut self.agents, &self.graph, &self.cfg, &mut self.ctx)
            .context("failed to perform testing")?;

        let record = self.record();
        self.ctx.day += 1;

        Ok(record)
    }

    fn record(&self) -> Record {
        Record {
            day: self.ctx.day,
            agents: self.agents.iter().map(Agent::snapshot).collect(),
            counters: self.ctx.counters.clone(),
            screened: self.ctx.screened.clone(),
        }
    }

    fn seed_index_case(&mut self, kind: &str) -> Result<()> {
        let candidates: Vec<_> = self
            .agents
            .iter()
            .enumerate()
            .filter(|(_, agent)| agent.kind() == kind)
            .map(|(i_agt, _)| i_agt)
            .collect();
        if candidates.is_empty() {
            bail!("no agent of type {kind:?} in the network");
        }

        let idx_dist = Uniform::new(0, candidates.len())?;
        let i_agt = candidates[idx_dist.sample(&mut self.ctx.rng)];
        let agent = &mut self.agents[i_agt];
        agent.stage_infection()?;
        log::info!("{} {} is the index case", agent.kind(), agent.id());

        Ok(())
    }
}

#[cfg(test)]
impl Engine {
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Index of the next day to simulate.
    pub fn day(&self) -> u32 {
        self.ctx.day
    }
}
