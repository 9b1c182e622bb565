use anyhow::Context;
use boxwright::{telemetry, Engine};
use boxwright_models::{BaseImage, BoxError, Config, EngineKind};
use boxwright_packaging::dockerfile;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::error;

const CONFIG_FILE: &str = "boxwright.toml";

#[derive(Parser)]
#[command(name = "boxwright")]
#[command(about = "Build and launch single-entry container images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: boxwright.toml in the context directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine override
    #[arg(long, global = true, value_enum)]
    engine: Option<EngineArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EngineArg {
    Docker,
    Local,
}

impl From<EngineArg> for EngineKind {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Docker => EngineKind::Docker,
            EngineArg::Local => EngineKind::Local,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a context directory and print its artifact
    Build {
        /// Build context directory
        #[arg(long, default_value = ".")]
        context: PathBuf,
        /// Image tag (default: boxwright/<context dir>:latest)
        #[arg(long)]
        tag: Option<String>,
    },
    /// Run an image's entry command and exit with its exit code
    Run {
        /// Image tag
        tag: String,
    },
    /// Print the Dockerfile equivalent of the recipe
    Render {
        /// Build context directory
        #[arg(long, default_value = ".")]
        context: PathBuf,
    },
    /// Print a built image's artifact
    Inspect {
        /// Image tag
        tag: String,
    },
    /// Import a directory as a base image root filesystem (local engine)
    ImportBase {
        /// Base image reference, e.g. python:3.12-slim
        image: String,
        /// Root filesystem directory
        dir: PathBuf,
    },
    /// Remove cached layers no published image uses (local engine)
    Prune,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("boxwright: {e:#}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = telemetry::init(&config.logging) {
        eprintln!("boxwright: {e:#}");
        return ExitCode::from(1);
    }

    match run(cli, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = e
                .downcast_ref::<BoxError>()
                .map(BoxError::cli_exit_code)
                .unwrap_or(1);
            error!(error = %e, "Command failed");
            eprintln!("boxwright: {e:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let context = match &cli.command {
        Commands::Build { context, .. } | Commands::Render { context } => context.as_path(),
        _ => Path::new("."),
    };
    let path = cli.config.clone().or_else(|| {
        let candidate = context.join(CONFIG_FILE);
        candidate.is_file().then_some(candidate)
    });

    let mut config = Config::load(path.as_deref())?;
    if let Some(engine) = cli.engine {
        config.engine.kind = engine.into();
    }
    Ok(config)
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<u8> {
    match cli.command {
        Commands::Render { .. } => {
            print!("{}", dockerfile::render(&config.recipe));
            Ok(0)
        }
        Commands::Build { context, tag } => {
            let engine = Engine::from_config(&config)?;
            let artifact = engine
                .build(&context, config.recipe.clone(), tag.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(0)
        }
        Commands::Run { tag } => {
            let engine = Engine::from_config(&config)?;
            let outcome = engine.run(&tag).await?;
            Ok(outcome.process_exit_code() as u8)
        }
        Commands::Inspect { tag } => {
            let engine = Engine::from_config(&config)?;
            let artifact = engine.inspect(&tag).await?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(0)
        }
        Commands::ImportBase { image, dir } => {
            let image: BaseImage = image.parse()?;
            let engine = Engine::from_config(&config)?;
            let files = engine
                .import_base(&image, &dir)
                .with_context(|| format!("importing {} from {}", image, dir.display()))?;
            println!("Imported {image} ({files} files)");
            Ok(0)
        }
        Commands::Prune => {
            let engine = Engine::from_config(&config)?;
            let removed = engine.prune()?;
            println!("Removed {removed} unused layers");
            Ok(0)
        }
    }
}
