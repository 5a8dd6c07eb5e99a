use std::{env, time::Duration};

use anyhow::{Context, bail};
use initializer::{Configuration, DeadlineResume, Initializer, JsonLinesSink, NvidiaSmi};
use log::{info, warn};
use tokio::signal;

const USAGE: &str = "Usage: fleet-init <config.json>";

fn config_path(args: &[String]) -> anyhow::Result<&str> {
    match args {
        [_, path] => Ok(path.as_str()),
        _ => bail!(USAGE),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let path = config_path(&args)?;

    let mut cfg = Configuration::load(path).with_context(|| format!("loading {path}"))?;
    cfg.apply_env().context("reading launcher variables")?;
    cfg.validate().context("invalid configuration")?;

    let rank = cfg.rank;
    let last_rank = cfg.world_size - 1;
    let resume_budget = cfg.resume_budget_secs.map(Duration::from_secs);
    let telemetry_dir = cfg.telemetry_dir.clone();

    let mut init = Initializer::new(cfg, NvidiaSmi::detect());

    if let Some(budget) = resume_budget {
        init = init.with_resume(Box::new(DeadlineResume::new(budget)));
    }

    // Only the last rank reports, every other rank would write the same records.
    if let Some(dir) = telemetry_dir.filter(|_| rank == last_rank) {
        match JsonLinesSink::create(&dir) {
            Ok(sink) => {
                info!("writing telemetry to {}", sink.path().display());
                init = init.with_sink(Box::new(sink));
            }
            Err(e) => warn!("telemetry disabled, couldn't open {}: {e}", dir.display()),
        }
    }

    let done = tokio::select! {
        ret = init.initialize() => ret.with_context(|| format!("initializing rank {rank}"))?,
        _ = signal::ctrl_c() => bail!("interrupted before initialization finished"),
    };

    info!(
        rank = done.context.rank,
        world_size = done.context.world_size,
        model_parallel_rank = done.topology.model_parallel_rank(),
        data_parallel_rank = done.topology.data_parallel_rank(),
        seed = done.seeds.base_seed();
        "initialization done, resume {:?}", done.resume
    );

    init.shutdown().await.context("leaving the job")?;
    Ok(())
}
