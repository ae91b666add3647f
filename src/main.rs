use kube::Client;
use tokio::signal;
use tracing::{error, info};

use pgcluster_operator::config::OperatorConfig;
use pgcluster_operator::{
    build_operator, run_autofail_watcher, run_job_controller, run_task_controller,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pgcluster_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    info!("Starting pgcluster-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let config = OperatorConfig::from_env();

    let mut namespaces: Vec<String> = std::env::var("WATCH_NAMESPACES")
        .unwrap_or_else(|_| "default".to_string())
        .split(',')
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .collect();
    if namespaces.is_empty() {
        namespaces.push("default".to_string());
    }
    info!(namespaces = ?namespaces, "Watching namespaces");

    let operator = build_operator(client.clone(), config);

    // seed failure-detection state from what is currently running
    for namespace in &namespaces {
        if let Err(e) = operator.detector.initialize(namespace).await {
            error!(namespace, error = %e, "failure detection initialization failed");
        }
    }

    let mut handles = Vec::new();
    for namespace in &namespaces {
        let task_client = client.clone();
        let dispatcher = operator.dispatcher.clone();
        let ns = namespace.clone();
        handles.push(tokio::spawn(async move {
            run_task_controller(task_client, dispatcher, Some(&ns)).await;
        }));

        let job_client = client.clone();
        let clone_workflow = operator.clone_workflow.clone();
        let ns = namespace.clone();
        handles.push(tokio::spawn(async move {
            run_job_controller(job_client, clone_workflow, Some(&ns)).await;
        }));

        let pod_client = client.clone();
        let detector = operator.detector.clone();
        let ns = namespace.clone();
        handles.push(tokio::spawn(async move {
            run_autofail_watcher(pod_client, detector, &ns).await;
        }));
    }

    // run until a controller dies or a shutdown signal arrives
    tokio::select! {
        _ = futures::future::select_all(handles) => {
            error!("A controller task exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
