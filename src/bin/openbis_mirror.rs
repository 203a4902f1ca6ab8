use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use openbis_mirror::app::App;
use openbis_mirror::cache::{CacheBackend, DiskCache, MemoryCache, QueryCache};
use openbis_mirror::config::{CacheMode, ConfigLoader, ResolvedConfig};
use openbis_mirror::domain::{ContainerId, EntityKind, LocalId, PermId};
use openbis_mirror::error::MirrorError;
use openbis_mirror::mirror::JsonStore;
use openbis_mirror::openbis::OpenbisHttpClient;
use openbis_mirror::output::{JsonOutput, OutputMode, StderrProgress, print_show_text};
use openbis_mirror::reconcile::ImportRequest;
use openbis_mirror::repository::EntityRepository;

#[derive(Parser)]
#[command(name = "openbis-mirror")]
#[command(about = "Read-only openBIS client with a query cache and local sample mirrors")]
#[command(version, author)]
struct Cli {
    /// Path to openbis-mirror.json (defaults to the working directory).
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show one entity by permId")]
    Show(ShowArgs),
    #[command(about = "List every entity of a kind, newest first")]
    List(ListArgs),
    #[command(about = "Import datasets and samples into a container")]
    Import(ImportArgs),
    #[command(about = "Re-synchronize a sample mirror")]
    Refresh(MirrorArgs),
    #[command(about = "Check whether openBIS has a newer version of a sample mirror")]
    Stale(MirrorArgs),
    #[command(about = "Delete a sample mirror")]
    Destroy(MirrorArgs),
    #[command(about = "Delete every mirror of a container")]
    Wipe(ContainerArgs),
    #[command(about = "List the mirrors of a container")]
    Mirrors(ContainerArgs),
    #[command(about = "List the files of a dataset")]
    Files(FilesArgs),
    #[command(about = "Download one dataset file")]
    Download(DownloadArgs),
    #[command(about = "Manage the query cache")]
    Cache(CacheArgs),
}

#[derive(Args)]
struct ShowArgs {
    kind: EntityKind,
    perm_id: PermId,
    #[arg(long)]
    related: bool,
}

#[derive(Args)]
struct ListArgs {
    kind: EntityKind,
}

#[derive(Args)]
struct ImportArgs {
    container: String,
    #[arg(long = "dataset")]
    datasets: Vec<PermId>,
    #[arg(long = "sample")]
    samples: Vec<PermId>,
}

#[derive(Args)]
struct MirrorArgs {
    id: LocalId,
}

#[derive(Args)]
struct ContainerArgs {
    container: String,
}

#[derive(Args)]
struct FilesArgs {
    dataset: PermId,
}

#[derive(Args)]
struct DownloadArgs {
    dataset: PermId,
    path: String,
    #[arg(long, short)]
    output: PathBuf,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Drop every cached query result")]
    Clear,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<MirrorError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MirrorError) -> u8 {
    match error {
        MirrorError::EntityNotFound { .. }
        | MirrorError::MirrorNotFound(_)
        | MirrorError::MissingConfig => 2,
        MirrorError::TransientFetch(_)
        | MirrorError::QueryStatus { .. }
        | MirrorError::Transport(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = build_app(&resolved)?;
    let ctx = &resolved.connection;

    match cli.command {
        Commands::Show(args) => {
            let result = app.show(ctx, args.kind, &args.perm_id, args.related, &StderrProgress)?;
            let printed = match output_mode {
                OutputMode::Json => JsonOutput::print_show(&result),
                OutputMode::Text => print_show_text(&result),
            };
            printed.into_diagnostic()
        }
        Commands::List(args) => {
            let result = app.list(ctx, args.kind, &StderrProgress)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_list(&result).into_diagnostic(),
                OutputMode::Text => {
                    for entity in &result.entities {
                        println!(
                            "{}\t{}\t{}\t{}",
                            entity.perm_id,
                            entity.code,
                            entity.type_text,
                            entity.modified_at.to_rfc3339()
                        );
                    }
                    Ok(())
                }
            }
        }
        Commands::Import(args) => {
            let request = ImportRequest {
                datasets: args.datasets,
                samples: args.samples,
            };
            let container = ContainerId::new(args.container);
            let report = app.import(ctx, &container, &request, &StderrProgress)?;
            JsonOutput::print_import(&report).into_diagnostic()
        }
        Commands::Refresh(args) => {
            let mirror = app.refresh(ctx, args.id, &StderrProgress)?;
            JsonOutput::print_mirror(&mirror).into_diagnostic()
        }
        Commands::Stale(args) => {
            let result = app.check(ctx, args.id, &StderrProgress)?;
            JsonOutput::print_stale(&result).into_diagnostic()
        }
        Commands::Destroy(args) => {
            let mirror = app.destroy(args.id, &StderrProgress)?;
            JsonOutput::print_mirror(&mirror).into_diagnostic()
        }
        Commands::Wipe(args) => {
            let wipe = app.wipe(&ContainerId::new(args.container), &StderrProgress)?;
            JsonOutput::print_wipe(&wipe).into_diagnostic()
        }
        Commands::Mirrors(args) => {
            let result = app.mirrors(&ContainerId::new(args.container))?;
            JsonOutput::print_mirrors(&result).into_diagnostic()
        }
        Commands::Files(args) => {
            let result = app.files(ctx, &args.dataset, &StderrProgress)?;
            JsonOutput::print_files(&result).into_diagnostic()
        }
        Commands::Download(args) => {
            let result = app.download(
                ctx,
                &args.dataset,
                &args.path,
                &args.output,
                &StderrProgress,
            )?;
            JsonOutput::print_download(&result).into_diagnostic()
        }
        Commands::Cache(CacheArgs {
            command: CacheCommand::Clear,
        }) => {
            let result = app.clear_cache(&StderrProgress)?;
            JsonOutput::print_clear(&result).into_diagnostic()
        }
    }
}

fn build_app(resolved: &ResolvedConfig) -> Result<App<OpenbisHttpClient, JsonStore>, MirrorError> {
    let backend: Arc<dyn CacheBackend> = match resolved.cache {
        CacheMode::Memory => Arc::new(MemoryCache::default()),
        CacheMode::Disk => Arc::new(DiskCache::new()?),
    };
    let client = OpenbisHttpClient::new(resolved.timeout)?;
    let repo = EntityRepository::new(client, QueryCache::new(backend));
    Ok(App::new(repo, JsonStore::new()?))
}
