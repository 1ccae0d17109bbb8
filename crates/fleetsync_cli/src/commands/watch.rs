//! Watch command implementation.

use fleetsync_engine::{
    ChangeSet, Credentials, EngineConfig, EngineHandle, Notification, SyncEngine,
    WebSocketConnector,
};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Builds the engine configuration from a file and command-line overrides.
pub fn load_config(
    config: Option<&Path>,
    endpoint: Option<String>,
    token: Option<String>,
) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut engine_config = match (config, endpoint.as_deref()) {
        (Some(path), _) => EngineConfig::from_file(path)?,
        (None, Some(endpoint)) => EngineConfig::new(endpoint),
        (None, None) => return Err("either --config or --endpoint is required".into()),
    };
    if let (Some(_), Some(endpoint)) = (config, endpoint) {
        engine_config.endpoint = endpoint;
    }
    if let Some(token) = token {
        engine_config = engine_config.with_credentials(Credentials::bearer(token));
    }
    engine_config.validate()?;
    Ok(engine_config)
}

/// Runs the watch command.
pub fn run(
    config: Option<&Path>,
    endpoint: Option<String>,
    token: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config, endpoint, token)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(watch(config))
}

async fn watch(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let kinds = config.kinds.clone();
    let engine = SyncEngine::new(config, WebSocketConnector::default())?;
    let handle = engine.handle();

    // Callbacks only forward; reading entity state happens on the logger task.
    let (changes_tx, mut changes_rx) = mpsc::unbounded_channel();
    for kind in kinds {
        let changes_tx = changes_tx.clone();
        handle.subscribe(kind, move |notification| {
            if let Notification::Changed(change) = notification {
                let _ = changes_tx.send(change.clone());
            }
        });
    }
    handle.subscribe_connection(|notification| {
        if let Notification::Connection(event) = notification {
            if event.persistent_failure {
                warn!(
                    failures = event.consecutive_failures,
                    "backend unreachable, still retrying"
                );
            } else {
                info!(
                    state = %event.state,
                    retry_in_ms = event.retry_in.map(|d| d.as_millis() as u64),
                    "connection"
                );
            }
        }
    });

    let (handle, task) = engine.spawn();
    let logger = handle.clone();
    tokio::spawn(async move {
        while let Some(change) = changes_rx.recv().await {
            log_change(&logger, &change);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("interrupted, closing");
    handle.close().await?;
    task.await??;

    let stats = handle.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn log_change(handle: &EngineHandle, change: &ChangeSet) {
    for id in &change.ids {
        match handle.entity(change.kind, id) {
            Some(view) => info!(
                kind = %change.kind,
                entity_id = %id,
                revision = view.entity.revision,
                status = %view.entity.status,
                optimistic = view.is_optimistic(),
                cause = ?change.cause,
                "entity changed"
            ),
            None => info!(kind = %change.kind, entity_id = %id, cause = ?change.cause, "entity removed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_and_token_from_flags() {
        let config = load_config(None, Some("ws://localhost:8080".into()), Some("s3cret".into()))
            .unwrap();
        assert_eq!(config.endpoint, "ws://localhost:8080");
        assert_eq!(config.credentials.token().as_deref(), Some("s3cret"));
    }

    #[test]
    fn config_file_with_endpoint_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{ "endpoint": "wss://api.example.com/stream", "optimistic_timeout_ms": 5000 }"#,
        )
        .unwrap();

        let config = load_config(Some(&path), None, None).unwrap();
        assert_eq!(config.endpoint, "wss://api.example.com/stream");
        assert_eq!(config.optimistic_timeout.as_millis(), 5000);

        let config = load_config(Some(&path), Some("ws://127.0.0.1:9000".into()), None).unwrap();
        assert_eq!(config.endpoint, "ws://127.0.0.1:9000");
    }

    #[test]
    fn missing_endpoint_is_an_error() {
        assert!(load_config(None, None, None).is_err());
    }
}
