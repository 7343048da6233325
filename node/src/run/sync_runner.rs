//! Main sync orchestration.

use crate::archive::{spawn_listener, GatewayArchive, GatewayConfig, ListenerConfig};
use crate::cli::SyncConfig;
use crate::logging::generate_run_report;
use crate::model::HierarchyLevel;
use crate::object::Part10Reader;
use crate::storage::{HierarchyPlacer, SqliteIndex};
use crate::sync::{
    QuiescenceConfig, QuiescencePolicy, Receiver, RetrievalMode, SynchronizationContext,
};
use eyre::{Result, WrapErr};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::session::{SessionController, SessionSettings};

/// Scratch folder under the save folder for objects still being received.
const INCOMING_DIR: &str = "incoming";

/// Run one synchronization from configuration to report.
pub async fn run_sync(config: SyncConfig, argv: Vec<String>) -> Result<()> {
    let options = config.run_options();
    info!(
        remote = %format!("{}@{}:{}", config.remote_identity, config.remote_host, config.remote_port),
        local = %config.local_identity,
        mode = ?options.mode,
        granularity = ?options.granularity,
        scope = ?options.scope,
        "starting archive synchronization"
    );
    let patterns = options.scope.patterns()?;

    let index = Arc::new(SqliteIndex::open(&config.index_path)?);
    fs::create_dir_all(&config.save_dir)
        .wrap_err_with(|| format!("failed to create {}", config.save_dir.display()))?;
    let incoming_dir = config.save_dir.join(INCOMING_DIR);

    let context = Arc::new(SynchronizationContext::new());
    let receiver = Arc::new(Receiver::new(
        Arc::clone(&context),
        index.clone(),
        Arc::new(HierarchyPlacer::new(
            &config.save_dir,
            config.duplicates_dir.clone(),
        )),
        Arc::new(Part10Reader::new(config.header_read_bytes)),
        options.granularity,
    ));

    let listener = if options.mode == RetrievalMode::Push {
        let host: IpAddr = config
            .listen_host
            .parse()
            .wrap_err_with(|| format!("invalid listen host {}", config.listen_host))?;
        let listener = spawn_listener(
            SocketAddr::new(host, config.local_port),
            ListenerConfig {
                local_identity: config.local_identity.clone(),
                incoming_dir: incoming_dir.clone(),
                transfer_syntaxes: options.transfer_syntaxes,
            },
            receiver.clone(),
        )
        .await?;
        debug!(addr = %listener.local_addr(), "awaiting pushed objects");
        Some(listener)
    } else {
        None
    };

    let archive = Arc::new(GatewayArchive::new(GatewayConfig {
        host: config.remote_host.clone(),
        port: config.remote_port,
        remote_identity: config.remote_identity.clone(),
        local_identity: config.local_identity.clone(),
        reuse_association: options.reuse_association,
        transfer_syntaxes: options.transfer_syntaxes,
        incoming_dir,
    }));

    let settings = SessionSettings {
        mode: options.mode,
        granularity: options.granularity,
        destination: config.local_identity.clone(),
        quiescence: QuiescenceConfig {
            policy: if config.skip_quiescence_wait {
                QuiescencePolicy::Skip
            } else {
                QuiescencePolicy::Wait
            },
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            idle_ceiling: Duration::from_secs(config.idle_timeout_secs),
            require_idle: false,
        },
    };
    let controller = SessionController::new(
        archive.clone(),
        index.clone(),
        context,
        receiver,
        settings,
    );

    // The session blocks on archive I/O and on the quiescence wait.
    let report = tokio::task::spawn_blocking(move || {
        let report = controller.run(&patterns);
        archive.close();
        report
    })
    .await
    .wrap_err("session task failed")?;

    if let Some(listener) = listener {
        listener.shutdown().await;
    }
    match index.count(HierarchyLevel::Instance) {
        Ok(count) => info!(indexed_instances = count, "local index updated"),
        Err(err) => warn!(error = %err, "failed to count indexed instances"),
    }

    generate_run_report(&config, &options, &argv, &report)?;
    Ok(())
}
