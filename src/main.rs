use anyhow::{Context, Result};
use tracing::info;

use distcarve::{
    carve::CarveSettings,
    cli::{self, Command, MasterArgs, WorkerArgs},
    config,
    logging,
    master::{Master, MasterSettings},
    util,
    worker::{AgentSettings, WorkerAgent},
};

fn main() -> Result<()> {
    logging::init_logging();

    let cli_opts = cli::parse();
    match cli_opts.command {
        Command::Master(args) => run_master(args),
        Command::Worker(args) => run_worker(args),
    }
}

fn run_master(args: MasterArgs) -> Result<()> {
    let loaded = config::load_config(args.config_path.as_deref())?;
    let mut cfg = loaded.config;
    util::apply_master_overrides(&mut cfg, &args)?;

    util::ensure_output_dir(&args.output)?;
    let run_dir = args.output.join(&cfg.run_id);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("create run directory {}", run_dir.display()))?;

    info!(
        "starting master run_id={} image={} output={}",
        cfg.run_id,
        args.image.display(),
        run_dir.display()
    );

    let mut settings = MasterSettings::from_config(&cfg, &loaded.config_hash, &args.image, &run_dir);
    settings.metadata_backend = Some(util::backend_from_cli(args.metadata_backend));

    let master = Master::bind(settings)?;
    let summary = master.run()?;
    info!(
        "distcarve master finished files={} lost_tasks={}",
        summary.files_persisted,
        summary.lost_tasks.len()
    );
    Ok(())
}

fn run_worker(args: WorkerArgs) -> Result<()> {
    let loaded = config::load_config(args.config_path.as_deref())?;
    let mut cfg = loaded.config;
    util::apply_worker_overrides(&mut cfg, &args)?;

    let mut settings = AgentSettings::new(args.master_addr());
    settings.worker_id = args.worker_id.clone();
    settings.stream_block_size = cfg.stream_block_size;
    settings.scratch_dir = args.scratch_dir.clone();
    settings.carve = CarveSettings::from_config(&cfg)?;

    let report = WorkerAgent::new(settings)
        .connect_and_run()
        .with_context(|| format!("worker session with {}", args.master_addr()))?;
    info!(
        "distcarve worker finished worker={} tasks={} artifacts={}",
        report.worker_id, report.tasks_completed, report.artifacts_sent
    );
    Ok(())
}
