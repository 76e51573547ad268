use std::sync::Arc;

use dispatchflow::api;
use dispatchflow::checkout::GitCheckouts;
use dispatchflow::config;
use dispatchflow::db;
use dispatchflow::intake::Intake;
use dispatchflow::jobs::{JobsRepo, TokenRepo};
use dispatchflow::pipeline::Pipeline;
use dispatchflow::remote::{AppTokenProvider, Committer, GithubClient, TokenSource};
use dispatchflow::scripts::ScriptRegistry;
use dispatchflow::worker::{shutdown_signal, Worker};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::Config::from_env()?;
    let api_addr = cfg.admin_addr.clone();

    tracing::info!(
        worker_id = %cfg.worker_id,
        api = api_addr.as_deref().unwrap_or("disabled"),
        auth = if cfg.api_token.is_some() { "enabled" } else { "disabled" },
        migrate_on_startup = cfg.migrate_on_startup,
        poll_ms = cfg.poll_interval().as_millis() as u64,
        subjects = cfg.subjects.len(),
        "dispatchflow starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let registry = Arc::new(ScriptRegistry::load(cfg.script_registry_path.as_deref())?);
    tracing::info!(scripts = registry.len(), "script registry loaded");

    let jobs_repo = JobsRepo::with_policy(pool.clone(), cfg.contention_policy());
    let http = reqwest::Client::new();

    let tokens = match (&cfg.github_app_id, &cfg.github_installation_id) {
        (Some(app_id), Some(installation_id)) => TokenSource::App(AppTokenProvider::new(
            TokenRepo::new(pool.clone()),
            http.clone(),
            &cfg.github_api_url,
            app_id,
            installation_id,
            &cfg.github_key_path,
        )),
        _ => {
            let token = std::env::var("GITHUB_TOKEN").map_err(|_| {
                anyhow::anyhow!(
                    "set DISPATCH_GITHUB_APP_ID and DISPATCH_GITHUB_INSTALLATION_ID, or GITHUB_TOKEN"
                )
            })?;
            tracing::warn!("no GitHub App configured, using GITHUB_TOKEN");
            TokenSource::Static(token)
        }
    };

    let remote = Arc::new(GithubClient::new(
        http,
        &cfg.github_api_url,
        &cfg.results_repo,
        &cfg.baseline_branch,
        Committer {
            name: cfg.bot_name.clone(),
            email: cfg.bot_email.clone(),
        },
        tokens,
    ));
    let checkouts = Arc::new(GitCheckouts::new(
        cfg.subjects.clone(),
        &cfg.baseline_branch,
        &cfg.bot_name,
        &cfg.bot_email,
    ));
    let pipeline = Arc::new(Pipeline::from_config(&cfg, registry.clone(), remote, checkouts));

    let shutdown = CancellationToken::new();

    // ---- API task ----
    let api_state = api::ApiState {
        jobs: jobs_repo.clone(),
        intake: Intake::new(jobs_repo.clone(), registry.clone(), cfg.bot_name.clone()),
        registry,
        api_token: cfg.api_token.clone(),
    };
    let app = api::router(api_state);

    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let Some(addr) = api_addr else {
            return Ok(());
        };
        let served = async {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");
            let stop = api_shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        if served.is_err() {
            // no api, no point in running
            api_shutdown.cancel();
        }
        served
    });

    // ---- Worker loop task ----
    let worker = Worker::new(jobs_repo, pipeline, cfg.worker_id.clone(), cfg.poll_interval());
    let worker_shutdown = shutdown.clone();
    let worker_handle = tokio::spawn(async move {
        worker.startup().await;
        worker.run(worker_shutdown).await
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::error!(error = %e, "could not install signal handlers, falling back to ctrl-c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "ctrl-c handler failed");
                return;
            }
        }
        signal_token.cancel();
    });

    let (api_res, worker_res) = tokio::join!(api_handle, worker_handle);
    api_res??;
    worker_res??;

    tracing::info!("dispatchflow stopped");
    Ok(())
}
