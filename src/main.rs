use cachesim::driver::{OooDriver, TraceSource};
use cachesim::{config, Simulator};
use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use std::fs;
use std::path::PathBuf;
use trace_model::{SyntheticTrace, TraceReader};

#[derive(Debug, Parser)]
#[command(author, version, about = "Trace-driven CMP cache hierarchy and DRAM simulator")]
struct Options {
    /// Component definition file (pipeline composition).
    #[arg(long)]
    definition: PathBuf,

    /// Component configuration file (parameter files and overrides).
    #[arg(long)]
    configuration: PathBuf,

    /// Directory holding per-component-type parameter files.
    #[arg(long, default_value = "components")]
    components: PathBuf,

    /// Simulation output folder.
    #[arg(long)]
    folder: PathBuf,

    #[arg(long = "num-cpus")]
    num_cpus: usize,

    /// Comma-separated trace files, one per cpu.
    #[arg(long = "trace-files", value_delimiter = ',')]
    trace_files: Vec<PathBuf>,

    /// Instructions of warm-up per core.
    #[arg(long = "warm-up", default_value_t = 0)]
    warm_up: u64,

    /// Measured instructions per core.
    #[arg(long = "run-time", default_value_t = 0)]
    run_time: u64,

    /// Heartbeat period in cycles (0 disables).
    #[arg(long = "heart-beat", default_value_t = 0)]
    heart_beat: u64,

    #[arg(long = "ooo-window", default_value_t = 1)]
    ooo_window: u64,

    /// Use the synthetic generator with this working-set size (KB)
    /// instead of trace files.
    #[arg(long)]
    synthetic: Option<u32>,

    /// Instruction gap between synthetic memory references.
    #[arg(long = "mem-gap", default_value_t = 50)]
    mem_gap: u32,

    /// Reopen exhausted traces and continue.
    #[arg(long = "wrap-around", default_value_t = true)]
    wrap_around: bool,
}

fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();
    fs::create_dir_all(&options.folder)
        .wrap_err_with(|| format!("creating simulation folder {}", options.folder.display()))?;

    let mut sim = Simulator::new(options.num_cpus, &options.folder)
        .wrap_err("opening the simulation log")?;
    config::apply_definition(&mut sim, &options.definition)?;
    config::apply_configuration(&mut sim, &options.configuration, &options.components)?;

    let sources = if let Some(working_set) = options.synthetic {
        (0..options.num_cpus)
            .map(|cpu| {
                TraceSource::Synthetic(SyntheticTrace::new(working_set, options.mem_gap, cpu, 64))
            })
            .collect()
    } else {
        if options.trace_files.len() != options.num_cpus {
            return Err(eyre!(
                "{} trace files for {} cpus",
                options.trace_files.len(),
                options.num_cpus
            ));
        }
        options
            .trace_files
            .iter()
            .enumerate()
            .map(|(cpu, path)| {
                TraceReader::open(path, cpu, options.wrap_around)
                    .wrap_err_with(|| format!("opening trace {}", path.display()))
                    .map(TraceSource::File)
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut driver = OooDriver::new(sim, sources, options.ooo_window, &options.folder)?;
    let stats = driver.run(options.warm_up, options.run_time, options.heart_beat)?;

    let stats_path = options.folder.join("sim.stats.json");
    let writer = fs::File::create(&stats_path)
        .wrap_err_with(|| format!("creating {}", stats_path.display()))?;
    serde_json::to_writer_pretty(writer, &stats)?;

    for core in &stats.cores {
        log::info!(
            "cpu {}: {} instructions, {} cycles, ipc {:.4}",
            core.cpu,
            core.instructions,
            core.cycles,
            core.ipc()
        );
    }
    Ok(())
}
