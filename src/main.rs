use clap::{Parser, Subcommand};
use log::{error, info};
use std::path::{Path, PathBuf};
use usability_capture::configuration::config::Config;
use usability_capture::controller::{Controller, ParticipateOptions};

#[derive(Parser)]
#[command(name = "usability-capture")]
#[command(version = "0.0.2")]
#[command(about = "Task-based usability study runner with per-task screen recording")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the study server that stores participants, recordings and submissions
    Serve {
        config_file: PathBuf,
    },
    /// Walk one participant through the tasks against a running study server
    Participate {
        config_file: PathBuf,
        /// Base URL of the study server
        #[arg(long, env = "USABILITY_CAPTURE_SERVER", default_value = "http://127.0.0.1:8080")]
        server: String,
        /// Media file an external screen recorder keeps appending to
        #[arg(long)]
        capture_file: Option<PathBuf>,
        /// The capture file also carries microphone input
        #[arg(long, requires = "capture_file")]
        with_audio: bool,
    },
}

fn load(path: &Path) -> Controller {
    info!("Importing configuration from {}", path.display());
    let config = Config::from_file(path).unwrap_or_else(|e| {
        error!("Unable to import configuration from file: {}", e);
        std::process::exit(1);
    });
    Controller::new(config).unwrap_or_else(|e| {
        error!("Unable to create a controller instance: {}, exiting...", e);
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    // https://docs.rs/env_logger/latest/env_logger/
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Serve { config_file } => load(&config_file).serve().await,
        Command::Participate {
            config_file,
            server,
            capture_file,
            with_audio,
        } => load(&config_file)
            .participate(ParticipateOptions {
                server_url: server,
                capture_file,
                with_audio,
            })
            .await
            .map(|_| ()),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
