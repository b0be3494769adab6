use crate::analysis::Analyzer;
use crate::config::Config;
use crate::engine::Engine;
use crate::network::ContactGraph;
use crate::stats::Summary;
use anyhow::{Context, Result, bail};
use glob::glob;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
    graph: ContactGraph,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        let graph = ContactGraph::from_file(sim_dir.join("network.toml"))
            .context("failed to construct graph")?;
        graph
            .validate_against(&cfg)
            .context("network does not match config")?;
        log::info!("loaded network with {} agents", graph.n_nodes());

        Ok(Self {
            sim_dir,
            cfg,
            graph,
        })
    }

    pub fn create_run(&self) -> Result<()> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;

        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        let seed = self.cfg.init.seed.map(|seed| seed.wrapping_add(run_idx as u64));
        let engine = Engine::generate_initial_condition(self.cfg.clone(), self.graph.clone(), seed)
            .context("failed to generate initial condition")?;

        self.simulate(engine, run_idx, 0)
    }

    pub fn resume_run(&self, run_idx: usize) -> Result<()> {
        let file_idx = self
            .count_trajectory_files(run_idx)
            .context("failed to count trajectory files")?;

        let checkpoint_file = self.checkpoint_file(run_idx);
        let engine = Engine::load_checkpoint(&checkpoint_file)
            .with_context(|| format!("failed to load {checkpoint_file:?}"))?;
        if engine.cfg() != &self.cfg {
            bail!("checkpoint config differs from the current config");
        }
        if engine.graph() != &self.graph {
            bail!("checkpoint network differs from the current network");
        }
        log::info!("loaded {checkpoint_file:?}");

        self.simulate(engine, run_idx, file_idx)
    }

    fn simulate(&self, mut engine: Engine, run_idx: usize, file_idx: usize) -> Result<()> {
        engine
            .perform_simulation(self.trajectory_file(run_idx, file_idx))
            .context("failed to perform simulation")?;

        engine
            .save_checkpoint(self.checkpoint_file(run_idx))
            .context("failed to save checkpoint")?;

        Ok(())
    }

    pub fn analyze_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;

        let mut scalars: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for run_idx in 0..n_runs {
            let mut analyzer = Analyzer::new(self.cfg.clone());

            let n_files = self
                .count_trajectory_files(run_idx)
                .context("failed to count trajectory files")?;
            for file_idx in 0..n_files {
                analyzer
                    .add_file(self.trajectory_file(run_idx, file_idx))
                    .context("failed to add file")?;
            }

            analyzer
                .save_results(self.results_file(run_idx))
                .context("failed to save results")?;
            log::info!("analyzed run {run_idx} ({n_files} files)");

            if let Some(stats) = analyzer.outbreak_stats() {
                for (name, val) in stats.scalars() {
                    scalars.entry(name).or_default().push(val);
                }
            }
        }

        let summary: BTreeMap<String, Summary> = scalars
            .into_iter()
            .filter_map(|(name, vals)| Summary::from_values(&vals).map(|summary| (name, summary)))
            .collect();

        let file = self.summary_file();
        let writer = BufWriter::new(
            File::create(&file).with_context(|| format!("failed to create {file:?}"))?,
        );
        serde_json::to_writer_pretty(writer, &summary).context("failed to serialize summary")?;
        log::info!("wrote {file:?}");

        Ok(())
    }

    pub fn clean_sim(&self) -> Result<()> {
        for run_dir in self.run_dirs().context("failed to glob run dirs")? {
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }

        let file = self.summary_file();
        if file.exists() {
            fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
            log::info!("removed {file:?}");
        }

        Ok(())
    }

    fn run_dirs(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let dirs = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .collect();
        Ok(dirs)
    }

    fn count_run_dirs(&self) -> Result<usize> {
        Ok(self.run_dirs()?.len())
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }

    fn count_trajectory_files(&self, run_idx: usize) -> Result<usize> {
        let pattern = self.run_dir(run_idx).join("trajectory-*.msgpack");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob trajectory files")?
            .filter_map(Result::ok)
            .count();
        Ok(count)
    }

    fn checkpoint_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("checkpoint.msgpack")
    }

    fn trajectory_file(&self, run_idx: usize, file_idx: usize) -> PathBuf {
        self.run_dir(run_idx)
            .join(format!("trajectory-{file_idx:04}.msgpack"))
    }

    fn results_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("results.json")
    }

    fn summary_file(&self) -> PathBuf {
        self.sim_dir.join("summary.json")
    }
}
