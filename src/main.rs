use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bodyscript::{
    config::Config,
    model_download::{ModelDownloadEvent, default_pose_model_path, ensure_pose_model_ready},
    pipeline::{Analyzer, Mode, OrtPoseEngine, Strategy},
    server,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

const DEFAULT_CONFIG: &str = "bodyscript.toml";

#[derive(Parser, Debug)]
#[command(name = "bodyscript", version, about = "Multi-strategy pose landmark extraction for video")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract landmarks from a video file or a directory of frames
    Analyze {
        input: PathBuf,
        #[arg(long, value_enum)]
        mode: Option<Mode>,
        /// Defaults to outputs/<input name>
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[arg(long, value_enum, value_delimiter = ',')]
        strategies: Vec<Strategy>,
        /// Skip the skeleton overlay video
        #[arg(long)]
        no_render: bool,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Run the upload / processing HTTP service
    Serve {
        #[arg(long)]
        addr: Option<String>,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Fetch the pose landmark model
    DownloadModel {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Analyze {
            input,
            mode,
            output,
            strategies,
            no_render,
            config,
        } => {
            let mut config = Config::load_or_default(&config);
            if let Some(mode) = mode {
                config.analysis.mode = mode;
            }
            if !strategies.is_empty() {
                config.analysis.strategies = strategies;
            }
            if no_render {
                config.analysis.render_overlay = false;
            }
            let output = output.unwrap_or_else(|| {
                let stem = input
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "analysis".to_string());
                config.server.output_dir.join(stem)
            });
            analyze(config, &input, &output)
        }
        Command::Serve { addr, config } => {
            let mut config = Config::load_or_default(&config);
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
            runtime.block_on(server::serve(config))
        }
        Command::DownloadModel { path } => {
            let path = path.unwrap_or_else(default_pose_model_path);
            ensure_pose_model_ready(&path, |evt| {
                if evt == ModelDownloadEvent::AlreadyPresent {
                    log::info!("model already present at {}", path.display());
                }
            })?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn analyze(config: Config, input: &Path, output: &Path) -> Result<()> {
    let mut engine = OrtPoseEngine::load(&config.model, &config.analysis)?;
    let analyzer = Analyzer::new(config.analysis);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} frames ({eta})",
        )
        .unwrap()
        .progress_chars("=>-"),
    );
    let progress = |done: usize, total: usize| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    };

    let video_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let summary = analyzer
        .run(&mut engine, input, &video_name, output, &progress)
        .with_context(|| format!("analysis of {} failed", input.display()))?;
    pb.finish_with_message("done");

    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("results written to {}", output.display());
    Ok(())
}
