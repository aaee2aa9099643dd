use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nats_operator::cli::{
    format_cluster_table, format_render, Cli, Commands, RenderArgs, RunArgs, StatusArgs,
};
use nats_operator::controller::ClusterStatus;
use nats_operator::logging::TracingLogger;
use nats_operator::operator::Operator;
use nats_operator::orchestration::{InMemoryApi, KubeApi, SharedApi};
use nats_operator::resources::ResourceList;
use nats_operator::server::{create_router, OperatorState};
use nats_operator::spec::load_cluster_file;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Render(args) => render(args),
        Commands::Status(args) => status(args).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let specs = args
        .files
        .iter()
        .map(|path| {
            load_cluster_file(path)
                .with_context(|| format!("Failed to load cluster file {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let api: SharedApi = if args.local {
        info!("Using in-process orchestration backend");
        Arc::new(InMemoryApi::new())
    } else {
        info!("Using Kubernetes API at {}", args.api_url);
        Arc::new(KubeApi::new(args.api_url.clone(), args.api_timeout())?)
    };

    let operator = Arc::new(Operator::new(
        api,
        args.controller_config(),
        Arc::new(TracingLogger),
    ));

    for spec in specs {
        let key = spec.qualified_name();
        let outcome = operator
            .apply(spec)
            .await
            .with_context(|| format!("Failed to start controller for {}", key))?;
        info!("Cluster {}: {:?}", key, outcome);
    }

    let addr = args.status_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Status API listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health                                    - Health check");
    info!("  GET  /v1/clusters                               - All cluster statuses");
    info!("  GET  /v1/namespaces/{{namespace}}/clusters/{{name}} - One cluster status");

    let app = create_router(OperatorState::new(operator.clone()));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutting down");
        })
        .await;

    operator.shutdown().await;
    served.context("Status server error")?;
    Ok(())
}

fn render(args: RenderArgs) -> Result<()> {
    let cluster = load_cluster_file(&args.file)
        .with_context(|| format!("Failed to load cluster file {}", args.file.display()))?;
    print!("{}", format_render(&cluster)?);
    Ok(())
}

async fn status(args: StatusArgs) -> Result<()> {
    let url = format!("{}/v1/clusters", args.url.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?
        .error_for_status()?;

    if args.json {
        let body: serde_json::Value = response.json().await?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let body: ResourceList<ClusterStatus> = response.json().await?;
        print!("{}", format_cluster_table(&body.items));
    }
    Ok(())
}
