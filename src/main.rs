use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use image_registration::analysis::HistogramMutualInformation;
use image_registration::config::{load_config_or_default, ConfigFormat};
use image_registration::data::{load_points, read_transform_file, write_transform_file, FileSceneIo, SceneIo};
use image_registration::logging::{init_logging, LoggingConfig};
use image_registration::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "register")]
#[command(about = "Run external 3D image registrations and evaluate their results")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a moving volume to a fixed volume with the external engine
    Register {
        /// Fixed (reference) volume
        #[arg(short, long)]
        fixed: PathBuf,

        /// Moving volume
        #[arg(short, long)]
        moving: PathBuf,

        /// Where to write the resulting transform (.tfm or .json)
        #[arg(short, long)]
        output: PathBuf,

        /// Registration strategy: rigid, affine or rigid+affine
        #[arg(short, long)]
        strategy: Option<String>,

        /// Custom engine configuration file (overrides --strategy)
        #[arg(long)]
        engine_config: Option<PathBuf>,

        /// Fixed image mask
        #[arg(long)]
        mask: Option<PathBuf>,

        /// Initial transform file
        #[arg(long)]
        initial: Option<PathBuf>,

        /// Fraction of voxels sampled by the engine, in (0, 1]
        #[arg(long)]
        sampling_percentage: Option<f64>,

        /// Initialization when no initial transform is given: none, geometry or moments
        #[arg(long)]
        init_mode: Option<String>,
    },

    /// Target registration error between two fiducial lists
    Tre {
        /// Fixed-space points (JSON array or markups file)
        #[arg(short, long)]
        fixed_points: PathBuf,

        /// Moving-space points, same order as the fixed points
        #[arg(short, long)]
        moving_points: PathBuf,

        /// Transform applied to the moving points
        #[arg(short, long)]
        transform: Option<PathBuf>,

        /// Write the report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Mutual information between two NRRD volumes
    Mi {
        #[arg(short, long)]
        fixed: PathBuf,

        #[arg(short, long)]
        moving: PathBuf,

        /// Registration result: maps moving-space points into fixed space
        #[arg(short, long)]
        transform: Option<PathBuf>,

        /// Fixed-space mask volume
        #[arg(long)]
        mask: Option<PathBuf>,

        /// Write the report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a configuration file with default values
    InitConfig {
        #[arg(default_value = "registration.toml")]
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config_or_default(cli.config.as_deref());
    let logging = match cli.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            global_level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            global_level: "trace".to_string(),
            engine_level: "trace".to_string(),
            ..config.logging.clone()
        },
    };
    let _guard = init_logging(&logging)?;

    match cli.command {
        Commands::Register {
            fixed,
            moving,
            output,
            strategy,
            engine_config,
            mask,
            initial,
            sampling_percentage,
            init_mode,
        } => {
            let mut request = RegistrationRequest::from_defaults(
                VolumeNode::file(fixed),
                VolumeNode::file(moving),
                TransformNode::new("registration_result"),
                &config.registration,
            );
            if let Some(strategy) = strategy {
                let strategy: RegistrationStrategy = strategy.parse().map_err(|e: String| anyhow!(e))?;
                request = request.with_selection(strategy);
            }
            if let Some(file) = engine_config {
                request = request.with_selection(ConfigSelection::File(file));
            }
            if let Some(mask) = mask {
                request = request.with_mask(VolumeNode::file(mask));
            }
            if let Some(initial) = initial {
                let transform = read_transform_file(&initial)?
                    .ok_or_else(|| anyhow!("{} contains no transform", initial.display()))?;
                request = request.with_initial_transform(TransformNode::with_content("initial", transform));
            }
            if let Some(sampling) = sampling_percentage {
                request = request.with_sampling_percentage(sampling);
            }
            if let Some(mode) = init_mode {
                let mode: InitMode = mode.parse().map_err(|e: String| anyhow!(e))?;
                request = request.with_init_mode(mode);
            }
            handle_register(&config, request, output)?;
        }
        Commands::Tre {
            fixed_points,
            moving_points,
            transform,
            output,
        } => {
            handle_tre(fixed_points, moving_points, transform, output)?;
        }
        Commands::Mi {
            fixed,
            moving,
            transform,
            mask,
            output,
        } => {
            handle_mi(&config, fixed, moving, transform, mask, output)?;
        }
        Commands::InitConfig { path } => {
            config.save_to_file(&path, ConfigFormat::from_path(&path))?;
            println!("Configuration written to {}", path.display());
        }
    }

    Ok(())
}

fn handle_register(config: &Config, request: RegistrationRequest, output: PathBuf) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();

    let outcome = local.block_on(&runtime, async {
        let orchestrator = RegistrationOrchestrator::from_config(config);
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        orchestrator.submit_registration(
            request,
            Completion::new(move |outcome: RegistrationOutcome| {
                let _ = tx.send(outcome);
            }),
        )?;

        let finished = tokio::select! {
            received = &mut rx => Some(received),
            _ = tokio::signal::ctrl_c() => None,
        };
        let received = match finished {
            Some(received) => received,
            None => {
                eprintln!("Interrupted, cancelling registration...");
                orchestrator.cancel();
                rx.await
            }
        };
        received.map_err(|_| anyhow!("registration finished without an outcome"))
    })?;

    match (outcome.error, outcome.transform) {
        (None, Some(node)) => {
            write_transform_file(&node.transform(), &output)?;
            println!(
                "Registration completed ({}), transform written to {}",
                outcome.artifact.as_deref().unwrap_or("unnamed artifact"),
                output.display()
            );
            Ok(())
        }
        (Some(error), _) => Err(error).context(format!("registration run {}", outcome.run_id)),
        (None, None) => bail!("registration run {} produced no transform", outcome.run_id),
    }
}

fn handle_tre(
    fixed_points: PathBuf,
    moving_points: PathBuf,
    transform: Option<PathBuf>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let fixed = load_points(&fixed_points)?;
    let moving = load_points(&moving_points)?;
    let transform_value = match transform {
        Some(ref path) => Some(
            read_transform_file(path)?.ok_or_else(|| anyhow!("{} contains no transform", path.display()))?,
        ),
        None => None,
    };

    let tre = compute_tre(&fixed, &moving, transform_value.as_ref())?;
    let name = transform.map(|p| p.display().to_string());
    finish_report(EvaluationReport::new(name).with_tre(tre), output)
}

fn handle_mi(
    config: &Config,
    fixed: PathBuf,
    moving: PathBuf,
    transform: Option<PathBuf>,
    mask: Option<PathBuf>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let io = FileSceneIo::new();
    let fixed_volume = io.load_volume(&VolumeNode::file(&fixed))?;
    let moving_volume = io.load_volume(&VolumeNode::file(&moving))?;
    let mask_volume = match mask {
        Some(ref path) => Some(io.load_volume(&VolumeNode::file(path))?),
        None => None,
    };
    let transform_value = match transform {
        Some(ref path) => Some(
            read_transform_file(path)?.ok_or_else(|| anyhow!("{} contains no transform", path.display()))?,
        ),
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();
    let evaluator = IntensityAgreementEvaluator::new(HistogramMutualInformation::from_config(&config.evaluation))
        .with_poll_interval(config.evaluation.poll_interval());

    let outcome = local.block_on(&runtime, async {
        let (tx, rx) = tokio::sync::oneshot::channel();
        evaluator.submit(
            fixed_volume,
            moving_volume,
            transform_value,
            mask_volume,
            Completion::new(move |outcome: MiOutcome| {
                let _ = tx.send(outcome);
            }),
        )?;
        rx.await.map_err(|_| anyhow!("evaluation finished without an outcome"))
    })?;

    match outcome.result {
        Some(result) if outcome.success => {
            let name = transform.map(|p| p.display().to_string());
            finish_report(EvaluationReport::new(name).with_mutual_information(result), output)
        }
        _ => match outcome.error {
            Some(error) => Err(error.into()),
            None => bail!("mutual information evaluation failed"),
        },
    }
}

fn finish_report(report: EvaluationReport, output: Option<PathBuf>) -> anyhow::Result<()> {
    print!("{}", report);
    if let Some(path) = output {
        report.save_json(&path)?;
        println!("Report saved to {}", path.display());
    }
    Ok(())
}
