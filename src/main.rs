use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use model_preflight::{
    core::MissingArtifact,
    models::{HubSnapshot, ModelManager, ProvisionPolicy, ResolvedPaths},
    Catalog, ProvisionError, Settings,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "MODEL_PREFLIGHT_LOG";

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;

/// Makes sure the models an inference service depends on are on disk before it starts.
#[derive(Parser)]
#[command(name = "model-preflight", version, propagate_version = true)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Storage root holding one directory per model
    #[arg(long, global = true, value_name = "PATH")]
    storage: Option<PathBuf>,

    /// download | verify | assume
    #[arg(long, global = true)]
    policy: Option<ProvisionPolicy>,

    /// Model catalog manifest (JSON) replacing the built-in list
    #[arg(long, global = true, value_name = "PATH")]
    catalog: Option<PathBuf>,

    /// How resolved paths are printed on stdout
    #[arg(long, global = true, value_enum, default_value_t = PathFormat::Plain)]
    format: PathFormat,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the configured policy to every model (default)
    Run,
    /// Check whether one model is present
    Check { name: String },
    /// Download one model, retrying with backoff
    Fetch {
        name: String,
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Print model paths without looking at the disk
    Paths,
    /// List the catalog
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PathFormat {
    Plain,
    Json,
    Env,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout is reserved for resolved paths
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    ExitCode::from(exit_status(run(cli)))
}

/// Errors that escape `run` (bad settings, unknown model names) fail the process too.
fn exit_status(outcome: Result<u8>) -> u8 {
    outcome.unwrap_or_else(|error| {
        error!("{error:#}");
        EXIT_FAILED
    })
}

fn run(cli: Cli) -> Result<u8> {
    let settings = resolve_settings(&cli)?;
    let manager = build_manager(&settings)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!(policy = %settings.policy, "model preflight");
            match manager.provision(settings.policy) {
                Ok(paths) => {
                    info!(models = paths.len(), "all models ready");
                    print_paths(&paths, cli.format)?;
                    Ok(EXIT_OK)
                }
                Err(ProvisionError::ArtifactsMissing(missing)) => {
                    report_missing(&missing, &settings.endpoint);
                    Ok(EXIT_FAILED)
                }
                Err(error) => {
                    error!("model preflight failed: {}", error_chain(&error));
                    Ok(EXIT_FAILED)
                }
            }
        }
        Command::Check { name } => {
            if manager.presence_check(&name)? {
                Ok(EXIT_OK)
            } else {
                Ok(EXIT_FAILED)
            }
        }
        Command::Fetch { name, max_attempts } => {
            let attempts = max_attempts.unwrap_or(settings.max_attempts);
            match manager.fetch(&name, attempts) {
                Ok(path) => {
                    println!("{}", path.display());
                    Ok(EXIT_OK)
                }
                Err(error) => {
                    error!("fetch failed: {}", error_chain(&error));
                    Ok(EXIT_FAILED)
                }
            }
        }
        Command::Paths => {
            print_paths(&manager.resolved_paths(), cli.format)?;
            Ok(EXIT_OK)
        }
        Command::List => {
            for (name, descriptor) in manager.catalog().iter() {
                println!(
                    "{name}\t{}\t~{}GB\t{}",
                    descriptor.repo_id, descriptor.size_gb, descriptor.description
                );
            }
            Ok(EXIT_OK)
        }
    }
}

fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(storage) = &cli.storage {
        settings.storage_path = storage.clone();
    }
    if let Some(policy) = cli.policy {
        settings.policy = policy;
    }
    if let Some(catalog) = &cli.catalog {
        settings.catalog_path = Some(catalog.clone());
    }
    Ok(settings)
}

fn build_manager(settings: &Settings) -> Result<ModelManager> {
    let catalog = match &settings.catalog_path {
        Some(path) => Catalog::from_file(path)?,
        None => Catalog::builtin(),
    };
    let source = HubSnapshot::new(&settings.endpoint, &settings.revision)
        .context("initialize model hub client")?;
    Ok(
        ModelManager::new(&settings.storage_path, catalog, Box::new(source))
            .with_credential_from_env()
            .with_retry(settings.retry_policy()?),
    )
}

fn print_paths(paths: &ResolvedPaths, format: PathFormat) -> Result<()> {
    match format {
        PathFormat::Plain => {
            for (name, path) in paths.iter() {
                println!("{name}\t{}", path.display());
            }
        }
        PathFormat::Json => {
            let json = serde_json::to_string_pretty(paths).context("serialize model paths")?;
            println!("{json}");
        }
        PathFormat::Env => print!("{}", paths.to_shell_exports()),
    }
    Ok(())
}

fn report_missing(missing: &[MissingArtifact], endpoint: &str) {
    error!("{} required model(s) missing", missing.len());
    for artifact in missing {
        error!(
            model = %artifact.name,
            repo = %artifact.repo_id,
            path = %artifact.path.display(),
            "{} not found",
            artifact.description
        );
    }
    error!("provision these models into the storage volume before starting the service:");
    for artifact in missing {
        error!("  {}/{}", endpoint.trim_end_matches('/'), artifact.repo_id);
    }
    error!("or rerun with --policy download to fetch them now");
}

fn error_chain(error: &ProvisionError) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    struct Workspace {
        dir: tempfile::TempDir,
    }

    impl Workspace {
        /// Empty storage root, a single-attempt settings file and a one-model catalog.
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::write(
                dir.path().join("settings.json"),
                r#"{"maxAttempts": 1, "backoffUnitSecs": 0}"#,
            )
            .unwrap();
            fs::write(
                dir.path().join("catalog.json"),
                r#"{"tiny": {"repoId": "org/tiny", "localDir": "org/tiny"}}"#,
            )
            .unwrap();
            fs::create_dir_all(dir.path().join("storage")).unwrap();
            Self { dir }
        }

        fn path(&self, name: &str) -> String {
            self.dir.path().join(name).display().to_string()
        }

        fn populate(&self) {
            let model = self.dir.path().join("storage/org/tiny");
            fs::create_dir_all(&model).unwrap();
            fs::write(model.join("config.json"), b"{}").unwrap();
        }

        fn status(&self, args: &[&str]) -> u8 {
            let config = self.path("settings.json");
            let storage = self.path("storage");
            let catalog = self.path("catalog.json");
            let mut argv = vec![
                "model-preflight",
                "--config",
                config.as_str(),
                "--storage",
                storage.as_str(),
                "--catalog",
                catalog.as_str(),
            ];
            argv.extend_from_slice(args);
            exit_status(run(Cli::try_parse_from(argv).unwrap()))
        }
    }

    #[test]
    fn verify_exits_zero_only_when_every_model_is_present() {
        let workspace = Workspace::new();
        assert_eq!(workspace.status(&["--policy", "verify"]), EXIT_FAILED);

        workspace.populate();
        assert_eq!(workspace.status(&["--policy", "verify"]), EXIT_OK);
        assert_eq!(workspace.status(&["--policy", "verify", "run"]), EXIT_OK);
    }

    #[test]
    fn assume_and_paths_succeed_without_models() {
        let workspace = Workspace::new();
        assert_eq!(workspace.status(&["--policy", "assume"]), EXIT_OK);
        assert_eq!(workspace.status(&["--format", "env", "paths"]), EXIT_OK);
        assert_eq!(workspace.status(&["list"]), EXIT_OK);
    }

    #[test]
    fn check_reflects_presence_and_rejects_unknown_names() {
        let workspace = Workspace::new();
        assert_eq!(workspace.status(&["check", "tiny"]), EXIT_FAILED);
        assert_eq!(workspace.status(&["check", "sdxl"]), EXIT_FAILED);

        workspace.populate();
        assert_eq!(workspace.status(&["check", "tiny"]), EXIT_OK);
    }

    #[test]
    fn exhausted_download_fails() {
        let workspace = Workspace::new();
        fs::write(
            workspace.dir.path().join("settings.json"),
            r#"{"maxAttempts": 1, "backoffUnitSecs": 0, "endpoint": "http://127.0.0.1:9"}"#,
        )
        .unwrap();

        assert_eq!(workspace.status(&["fetch", "tiny"]), EXIT_FAILED);
        assert_eq!(workspace.status(&["fetch", "sdxl"]), EXIT_FAILED);
        assert!(!Path::new(&workspace.path("storage/org/tiny")).exists());
    }

    #[test]
    fn configuration_errors_fail() {
        let workspace = Workspace::new();
        fs::write(workspace.dir.path().join("settings.json"), b"not json").unwrap();
        assert_eq!(workspace.status(&["paths"]), EXIT_FAILED);

        let workspace = Workspace::new();
        fs::write(
            workspace.dir.path().join("catalog.json"),
            r#"{"bad": {"repoId": "org/bad", "localDir": "../outside"}}"#,
        )
        .unwrap();
        assert_eq!(workspace.status(&["paths"]), EXIT_FAILED);
    }

    #[test]
    fn unhandled_errors_map_to_failure() {
        assert_eq!(exit_status(Ok(EXIT_OK)), EXIT_OK);
        assert_eq!(exit_status(Err(anyhow::anyhow!("boom"))), EXIT_FAILED);
    }
}
