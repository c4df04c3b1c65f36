// tierforge CLI: probe the compute device, manage the model cache, and
// generate images under the detected tier.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::Select;
use log::{info, warn};

use tierforge::assets::{self, FsAssetStore, ModelAssetStore, DEFAULT_MODEL_ID, MODELS};
use tierforge::clock::TokioClock;
use tierforge::config::GeneratorConfig;
use tierforge::gpu::device::{ComputeDevice, WgpuDevice};
use tierforge::gpu::headless::HeadlessDevice;
use tierforge::orchestrator::{
    FixedDecision, GenerationOutcome, GenerationParams, RetryOrchestrator, TimeoutDecision,
    UserDecisionChannel,
};
use tierforge::probe::CapabilityProber;
use tierforge::progress::LogProgress;
use tierforge::{GenerationEngine, Preset, Tier};

#[derive(Parser)]
#[command(name = "tierforge", about = "Adaptive GPU image synthesis", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the CPU-emulated device instead of a GPU adapter
    #[arg(long, global = true)]
    headless: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the compute device and report its tier
    Probe,
    /// Generate an image
    Generate(GenerateArgs),
    /// List the model catalog
    Models,
    /// Fetch a model into the local cache
    Download {
        #[arg(default_value = DEFAULT_MODEL_ID)]
        model: String,
    },
    /// Inspect or clear the model cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print the cache size
    Status,
    /// Delete every cached model
    Clear,
}

#[derive(clap::Args)]
struct GenerateArgs {
    prompt: String,

    #[arg(long, default_value = "")]
    negative: String,

    /// Overrides the preset's resolution
    #[arg(long)]
    resolution: Option<u32>,

    /// Overrides the preset's step count
    #[arg(long)]
    steps: Option<u32>,

    #[arg(long)]
    seed: Option<u32>,

    #[arg(long, value_enum, default_value_t = PresetArg::Balanced)]
    preset: PresetArg,

    /// Tier to generate at; never above the detected tier
    #[arg(long)]
    tier: Option<Tier>,

    /// Extra images with fresh seeds after the first
    #[arg(long, default_value_t = 0)]
    variations: u32,

    #[arg(long, short, default_value = "out.png")]
    out: PathBuf,

    /// What to do when the first attempt times out
    #[arg(long, value_enum, default_value_t = OnTimeout::Ask)]
    on_timeout: OnTimeout,
}

#[derive(Clone, Copy, ValueEnum)]
enum PresetArg {
    Fast,
    Balanced,
    Best,
}

impl From<PresetArg> for Preset {
    fn from(p: PresetArg) -> Self {
        match p {
            PresetArg::Fast => Preset::Fast,
            PresetArg::Balanced => Preset::Balanced,
            PresetArg::Best => Preset::Best,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OnTimeout {
    Ask,
    Reduce,
    Retry,
    Cancel,
}

/// Asks on the terminal.
struct PromptDecision;

#[async_trait]
impl UserDecisionChannel for PromptDecision {
    async fn present_timeout_choice(&self) -> TimeoutDecision {
        let choice = tokio::task::spawn_blocking(|| {
            Select::new()
                .with_prompt("Generation timed out")
                .items(&["Reduce settings and retry", "Retry as is", "Cancel"])
                .default(0)
                .interact()
        })
        .await;
        match choice {
            Ok(Ok(0)) => TimeoutDecision::ReduceAndRetry,
            Ok(Ok(1)) => TimeoutDecision::RetryAsIs,
            Ok(Ok(_)) => TimeoutDecision::Cancel,
            Ok(Err(e)) => {
                warn!("failed to read timeout choice: {e}");
                TimeoutDecision::Cancel
            }
            Err(e) => {
                warn!("timeout prompt task failed: {e}");
                TimeoutDecision::Cancel
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = GeneratorConfig::load_or_default(cli.config.as_deref())
        .context("loading configuration")?;
    let assets = Arc::new(FsAssetStore::new(&config.asset_source, &config.cache_dir));

    match cli.command {
        Commands::Models => {
            cmd_models();
            Ok(())
        }
        Commands::Download { model } => cmd_download(assets.as_ref(), &model).await,
        Commands::Cache { action } => cmd_cache(assets.as_ref(), action).await,
        command @ (Commands::Probe | Commands::Generate(_)) => {
            if cli.headless {
                let device = Arc::new(HeadlessDevice::new());
                return run_on_device(Some(device), command, &config, assets).await;
            }
            let poll = config.poll_interval();
            match tokio::task::spawn_blocking(move || WgpuDevice::new(poll)).await? {
                Ok(device) => run_on_device(Some(Arc::new(device)), command, &config, assets).await,
                Err(e) => {
                    warn!("no compute device available: {e}");
                    run_on_device::<WgpuDevice>(None, command, &config, assets).await
                }
            }
        }
    }
}

async fn run_on_device<D: ComputeDevice + 'static>(
    device: Option<Arc<D>>,
    command: Commands,
    config: &GeneratorConfig,
    assets: Arc<FsAssetStore>,
) -> Result<()> {
    let report = CapabilityProber::from_config(&config.probe).probe(device.as_deref()).await;

    match command {
        Commands::Probe => {
            print_probe(&report);
            Ok(())
        }
        Commands::Generate(args) => cmd_generate(device, report.tier(), args, config, assets).await,
        _ => Ok(()),
    }
}

fn print_probe(report: &tierforge::probe::ProbeReport) {
    match &report.sample {
        Some(s) => {
            println!("adapter:     {}", s.adapter_name);
            println!("max buffer:  {} MiB", s.max_buffer_size / (1024 * 1024));
            println!("benchmark:   {:.2} ms", s.elapsed.as_secs_f64() * 1000.0);
        }
        None => println!("adapter:     none"),
    }
    let tier = report.tier();
    let limits = tier.limits();
    println!("tier:        {tier}");
    println!("resolutions: {:?}", limits.resolutions);
    println!("steps:       {:?}", limits.steps);
    println!("timeout:     {}s", limits.timeout.as_secs());
    let selectable: Vec<String> = tier.selectable().iter().map(Tier::to_string).collect();
    println!("selectable:  {}", selectable.join(", "));
}

async fn cmd_generate<D: ComputeDevice + 'static>(
    device: Option<Arc<D>>,
    detected: Tier,
    args: GenerateArgs,
    config: &GeneratorConfig,
    assets: Arc<FsAssetStore>,
) -> Result<()> {
    let decisions: Arc<dyn UserDecisionChannel> = match args.on_timeout {
        OnTimeout::Ask => Arc::new(PromptDecision),
        OnTimeout::Reduce => Arc::new(FixedDecision(TimeoutDecision::ReduceAndRetry)),
        OnTimeout::Retry => Arc::new(FixedDecision(TimeoutDecision::RetryAsIs)),
        OnTimeout::Cancel => Arc::new(FixedDecision(TimeoutDecision::Cancel)),
    };
    let clock = Arc::new(TokioClock::current().context("timer runtime")?);
    let engine = GenerationEngine::new(device).with_progress(Arc::new(LogProgress));

    let mut orchestrator = RetryOrchestrator::new(engine, detected, assets, clock, decisions)
        .with_model(config.model_id.clone());
    let requested = args.tier.or(config.tier_override).unwrap_or(detected);
    let tier = orchestrator.set_tier(requested);

    let mut params = GenerationParams::from_preset(tier, args.preset.into(), args.prompt);
    params.negative_prompt = args.negative;
    params.resolution = args.resolution.unwrap_or(params.resolution);
    params.steps = args.steps.unwrap_or(params.steps);
    params.seed = args.seed;

    let cancel = orchestrator.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling at the next step");
            cancel.cancel();
        }
    });

    let result = async {
        let outcome = orchestrator.run(params).await?;
        save(&outcome, &args.out)?;
        for n in 1..=args.variations {
            let outcome = orchestrator.regenerate_new_seed().await?;
            save(&outcome, &numbered(&args.out, n))?;
        }
        anyhow::Ok(())
    }
    .await;

    interrupt.abort();
    result
}

fn save(outcome: &GenerationOutcome, path: &Path) -> Result<()> {
    outcome
        .image
        .save_png(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!(
        "{} → {} (seed {}, {} steps, attempt {})",
        outcome.image,
        path.display(),
        outcome.request.seed,
        outcome.request.steps,
        outcome.attempts
    );
    Ok(())
}

/// `out.png` → `out-3.png`.
fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("png");
    path.with_file_name(format!("{stem}-{n}.{ext}"))
}

fn cmd_models() {
    for m in &MODELS {
        println!("{:<5} {:<5} {:<8} {:<7} {}", m.id, m.name, m.strength, m.size_hint, m.description);
    }
}

async fn cmd_download(store: &FsAssetStore, model: &str) -> Result<()> {
    let info = assets::model(model).with_context(|| format!("unknown model '{model}'"))?;
    println!("Downloading {} ({})…", info.name, info.size_hint);
    let bytes = store.fetch_and_cache(model).await?;
    println!("Model cached for offline use ({}).", megabytes(bytes));
    Ok(())
}

async fn cmd_cache(store: &FsAssetStore, action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Status => {
            for m in &MODELS {
                let state = if store.is_cached(m.id).await { "cached" } else { "not loaded" };
                println!("{:<5} {state}", m.id);
            }
            println!("total: {}", megabytes(store.cached_bytes().await?));
        }
        CacheAction::Clear => {
            store.clear().await?;
            println!("Model cache cleared.");
        }
    }
    Ok(())
}

fn megabytes(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}
