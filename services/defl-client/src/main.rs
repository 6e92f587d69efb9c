use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use defl_client::committer::Committer;
use defl_client::config::ClientConfig;
use defl_client::epoch_loop::{EpochLoop, EpochLoopParams};
use defl_client::poison;
use defl_model::VecModel;

/// Client core of a Byzantine-robust federated-learning system.
#[derive(Parser, Debug)]
struct Cli {
    /// Path to the client's JSON configuration file.
    config: PathBuf,
}

/// Reference-implementation initial weights: the external model runtime
/// boundary this crate stands in for (see `defl-model`) — a real
/// deployment loads `init_model_path` through its own model runtime.
fn init_weights() -> defl_aggregate::Weights {
    vec![vec![0.0f32; 8], vec![0.0f32; 4]]
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match ClientConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    for (key, value) in &config.env {
        // SAFETY: single-threaded at this point in startup, before any
        // other task reads the environment.
        unsafe { std::env::set_var(key, value) };
    }

    let client_name = config.client_name.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(client_name, task = ?config.task, aggregator = ?config.aggregator, "starting defl-client");

    let (committer, queue) = match Committer::bootstrap(
        client_name.clone(),
        config.server_host.clone(),
        config.consensus_port,
        config.obsido_port,
    )
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("FATAL: failed to bootstrap committer: {e}");
            std::process::exit(1);
        }
    };

    let model = VecModel::new(init_weights()).with_label_flip(config.attack == defl_client::config::Attack::Label);
    let poisoner = poison::from_config(&config);
    let params = EpochLoopParams {
        fetch_timeout: Duration::from_millis(config.fetch_ms),
        gst_timeout: Duration::from_millis(config.gst_ms),
        save_freq: config.save_freq,
        local_train_steps: config.local_train_steps,
        num_byzantine: config.num_byzantine,
    };
    let mut epoch_loop = EpochLoop::new(
        Arc::new(committer),
        queue,
        config.aggregator,
        model,
        poisoner,
        config.init_model_path.clone(),
        params,
    );

    tokio::select! {
        result = epoch_loop.run() => {
            if let Err(e) = result {
                eprintln!("FATAL: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl-C, shutting down");
        }
    }
}
