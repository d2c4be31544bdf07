use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ogda::config::{load_file_config, PipelineConfig};
use ogda::hash::HashMode;
use ogda::pipeline;

#[derive(Debug, Parser)]
#[command(name = "ogda")]
#[command(version)]
#[command(about = "Offline game-data asset pipeline")]
struct Cli {
    /// Root of input assets
    #[arg(short = 'i', long, value_name = "PATH")]
    input_dir: PathBuf,

    /// Root of produced assets
    #[arg(short = 'o', long, value_name = "PATH")]
    output_dir: PathBuf,

    /// Job description file
    #[arg(short = 'j', long, value_name = "PATH")]
    job_file: PathBuf,

    /// Manifest from the previous build, allows skipping conversion of
    /// unchanged files
    #[arg(long, value_name = "PATH")]
    manifest_input: Option<PathBuf>,

    /// Destination for the complete manifest of generated files
    #[arg(long, value_name = "PATH")]
    manifest_output: Option<PathBuf>,

    /// Path to the shared auxiliary database of previously built files
    #[arg(long, value_name = "PATH")]
    database_dir: Option<PathBuf>,

    /// Hash pool size (defaults to 8, or the .ogda.json overlay)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Enable debug log output
    #[arg(short = 'd', long)]
    debug_output: bool,

    /// Actually delete files the reconciler selects, instead of dry-running
    #[arg(long)]
    perform_removes: bool,

    /// Delete even on prior error or reconciler refusal
    #[arg(long)]
    force_removes: bool,

    /// Remove files present in the output but unknown to the prior manifest
    #[arg(long)]
    remove_unlisted: bool,

    /// Restore results from the shared database
    #[arg(long)]
    load_from_database: bool,

    /// Store fresh results into the shared database
    #[arg(long)]
    save_to_database: bool,

    /// Use the date modified as a surrogate hash, less reliable but faster
    #[arg(long)]
    date_modified_hash: bool,

    /// List files under the input roots that no item covers
    #[arg(long)]
    print_missing: bool,

    /// Report duplicate item references and print removable job-file rows
    #[arg(long)]
    print_duplicates: bool,

    /// Print all items initially included via the job file
    #[arg(long)]
    print_item_list: bool,

    /// Suppress the missing-item listing
    #[arg(long)]
    mute_missing: bool,

    /// Suppress progress bars
    #[arg(long)]
    hide_progress: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug_output { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("starting ogda {}", env!("CARGO_PKG_VERSION"));

    if (cli.load_from_database || cli.save_to_database) && cli.database_dir.is_none() {
        warn!(
            "asked to load or/and save database, but missing the --database-dir flag, \
             ignoring these two other flags"
        );
    }

    let file_cfg = load_file_config(&cli.input_dir);
    let config = PipelineConfig {
        input_dirs: vec![cli.input_dir],
        output_dir: cli.output_dir,
        job_file: cli.job_file,
        manifest_input: cli.manifest_input,
        manifest_output: cli.manifest_output,
        database_dir: cli.database_dir.clone(),
        threads: cli.threads.unwrap_or(file_cfg.threads).max(1),
        hash_mode: if cli.date_modified_hash {
            HashMode::DateModified
        } else {
            HashMode::Content
        },
        perform_removes: cli.perform_removes,
        force_removes: cli.force_removes,
        remove_unlisted: cli.remove_unlisted,
        load_from_database: cli.load_from_database && cli.database_dir.is_some(),
        save_to_database: cli.save_to_database && cli.database_dir.is_some(),
        print_missing: cli.print_missing,
        print_duplicates: cli.print_duplicates,
        print_item_list: cli.print_item_list,
        mute_missing: cli.mute_missing,
        hide_progress: cli.hide_progress,
        report_cross_lineage_duplicates: file_cfg.report_cross_lineage_duplicates,
    };

    match pipeline::run(&config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("one or more error(s) caused unwanted execution, see log for more information");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(10)
        }
    }
}
