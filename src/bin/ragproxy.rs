//! ragproxy daemon
//!
//! Long-running reverse proxy configured by `--config`. The auxiliary
//! one-shot `--flush-db` deletes a collection and exits. Exit code 0 on
//! success, 1 on any initialization or run error.

use anyhow::{bail, Context};
use clap::Parser;
use rag_proxy::embedding::EmbeddingClient;
use rag_proxy::idf::snapshot;
use rag_proxy::proxy::{self, ProxyState};
use rag_proxy::shutdown::ShutdownCoordinator;
use rag_proxy::vector_db::{flush_collection, VectorDb};
use rag_proxy::{AppContext, Config};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ragproxy", about = "Retrieval-augmented chat completion proxy")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Delete the named collection and exit
    #[arg(long)]
    flush_db: bool,

    /// Vector store host for --flush-db
    #[arg(long)]
    qhost: Option<String>,

    /// Vector store port for --flush-db
    #[arg(long)]
    qport: Option<u16>,

    /// Collection name for --flush-db
    #[arg(long)]
    qcollection: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

/// Verify the configured system user exists before running as a daemon.
fn check_service_user(user: &str) -> anyhow::Result<()> {
    let status = std::process::Command::new("id")
        .arg(user)
        .status()
        .with_context(|| "failed to run the user lookup command")?;
    if !status.success() {
        bail!("user '{user}' not found. Please create the user: sudo useradd {user}");
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.flush_db {
        let (Some(host), Some(port), Some(collection)) =
            (cli.qhost.as_deref(), cli.qport, cli.qcollection.as_deref())
        else {
            bail!("--flush-db requires --qhost, --qport, and --qcollection");
        };
        flush_collection(host, port, collection)
            .await
            .with_context(|| format!("error flushing collection '{collection}'"))?;
        println!(
            "Collection '{collection}' flushed successfully.\n\
             You can now restart the service to reinitialize it."
        );
        return Ok(());
    }

    let Some(config_path) = cli.config else {
        bail!("--config flag is required");
    };

    let config = Config::from_file_with_env(&config_path)
        .with_context(|| format!("error loading config from {}", config_path.display()))?;

    let _log_guards = rag_proxy::logging::init(&config.logging)?;
    info!(path = %config_path.display(), "configuration loaded and validated");

    if let Some(user) = &config.server.service_user {
        check_service_user(user)?;
    }

    let app = Arc::new(AppContext::new(config)?);
    info!(
        wrapper_size = app.messages_wrapper_size,
        "tokenizer initialized"
    );

    let db = Arc::new(VectorDb::new(app.config.vector_db.clone()));
    db.ensure_collection().await?;

    let embedder = Arc::new(EmbeddingClient::new(
        app.config.embedding.clone(),
        app.config.upstream.clone(),
        app.config.vector_db.vector_size,
    )?);
    embedder.check_normalization().await?;

    let idf_path = PathBuf::from(&app.config.idf.file);
    let tokenizer_name = app.tokens.encoding_name().to_string();
    {
        let app = app.clone();
        let path = idf_path.clone();
        let name = tokenizer_name.clone();
        tokio::task::spawn_blocking(move || snapshot::load(&app.idf, &path, &name)).await?;
    }

    let coordinator = ShutdownCoordinator::new();

    let autosave = if app.config.idf.autosave_interval_secs > 0 {
        Some(snapshot::spawn_autosave(
            app.idf.clone(),
            idf_path.clone(),
            tokenizer_name.clone(),
            Duration::from_secs(app.config.idf.autosave_interval_secs),
            coordinator.subscribe(),
        ))
    } else {
        None
    };

    let state = ProxyState {
        app: app.clone(),
        db,
        embedder,
        http: reqwest::Client::new(),
    };

    info!(
        listen = %app.config.server.listen,
        upstream = %app.config.upstream.base_url,
        "starting ragproxy"
    );

    let server_notifier = coordinator.subscribe();
    let mut server = tokio::spawn(proxy::serve(state, server_notifier));

    let mut run_result: anyhow::Result<()> = Ok(());
    tokio::select! {
        result = &mut server => {
            // the server ended on its own, e.g. a bind error
            run_result = match result {
                Ok(inner) => inner.map_err(anyhow::Error::from),
                Err(e) => Err(e.into()),
            };
            coordinator.shutdown();
        }
        _ = coordinator.wait_for_signal() => {
            if let Ok(Err(e)) = server.await {
                run_result = Err(e.into());
            }
        }
    }

    if let Some(autosave) = autosave {
        let _ = autosave.await;
    }

    // final snapshot after the autosaver is gone
    let final_app = app.clone();
    tokio::task::spawn_blocking(move || {
        snapshot::save(&final_app.idf, &idf_path, &tokenizer_name)
    })
    .await??;
    info!("IDF store saved");

    info!("ragproxy stopped");
    run_result
}
