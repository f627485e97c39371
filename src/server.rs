//! Server bootstrap and component wiring
//!
//! Builds every component from the cluster's Config object, starts the
//! controller set, and supervises shutdown: SIGINT/SIGTERM or a detected
//! Config change cancels the root token, controllers drain, and the
//! process exits for the workload controller to restart it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::controller::Controller;
use kube::runtime::watcher;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{
    Backup, Config, ConfigSpec, DeleteBackupRequest, DownloadRequest, PodVolumeBackup,
    PodVolumeRestore, Restore,
};
use crate::backup::Backupper;
use crate::client::KubeDynamicClient;
use crate::cloud::{BackupService, BlockStore, CachedBackupService};
use crate::controller::{
    backup, backup_deletion, backup_sync, download_request, gc, pod_volume_backup,
    pod_volume_restore, restore, schedule, AgentClientImpl, BackupTracker,
};
use crate::discovery::DiscoveryHelper;
use crate::plugin::PluginManager;
use crate::podexec::KubePodCommandExecutor;
use crate::restic::{
    CrPodVolumeBackupper, CrPodVolumeRestorer, RepositoryManager, SubprocessRunner,
};
use crate::restore::Restorer;
use crate::Result;

const CONFIG_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DISCOVERY_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the Caravel server until a signal or Config change stops it
pub async fn run_server(namespace: String, plugin_dir: PathBuf) -> Result<()> {
    let client = Client::try_default().await?;
    let token = CancellationToken::new();
    handle_shutdown_signals(token.clone());

    ensure_namespace(&client, &namespace).await?;

    let (config_name, mut config) = load_config(&client, &namespace, &token).await?;
    let original_spec = config.clone();
    config.apply_defaults();
    watch_config(&client, &namespace, &config_name, original_spec, token.clone());

    // Plugins host the cloud drivers; nothing storage-shaped works
    // without them.
    let plugin_manager = Arc::new(PluginManager::new());
    plugin_manager.discover(&plugin_dir).await?;

    let provider = &config.backup_storage_provider;
    let object_store: Arc<dyn crate::cloud::ObjectStore> = Arc::new(
        plugin_manager
            .get_object_store(&provider.name, &provider.config)
            .await?,
    );
    let backup_service = Arc::new(BackupService::new(object_store));
    let cache_period = config.backup_sync_period().min(config.gc_sync_period());
    let cached_backup_service = Arc::new(CachedBackupService::new(
        (*backup_service).clone(),
        cache_period,
    ));
    let bucket = provider.bucket.clone();

    let block_store: Option<Arc<dyn BlockStore>> = match &config.persistent_volume_provider {
        Some(pv) => {
            info!(provider = %pv.name, "configuring persistent volume provider");
            Some(Arc::new(
                plugin_manager
                    .get_block_store(&pv.name, &pv.config)
                    .await?,
            ))
        }
        None => {
            info!("no persistent volume provider configured, snapshots are disabled");
            None
        }
    };

    let repo_prefix =
        RepositoryManager::repo_prefix_for(&provider.name, &config.restic_bucket());
    let repo_manager = Arc::new(RepositoryManager::new(
        client.clone(),
        &namespace,
        &repo_prefix,
        Arc::new(SubprocessRunner),
    ));
    info!("checking restic repositories");
    if let Err(e) = repo_manager.check_all_repos().await {
        warn!(error = %e, "restic repository check reported problems");
    }

    let discovery = Arc::new(DiscoveryHelper::new(client.clone()).await?);
    spawn_discovery_refresh(discovery.clone(), token.clone());

    let dynamic = Arc::new(KubeDynamicClient::new(client.clone()));
    let tracker = Arc::new(BackupTracker::new());

    let backupper = Arc::new(Backupper::new(
        discovery.clone(),
        dynamic.clone(),
        Arc::new(KubePodCommandExecutor::new(client.clone())),
        block_store.clone(),
        Some(Arc::new(CrPodVolumeBackupper::new(
            client.clone(),
            &namespace,
            repo_manager.clone(),
        ))),
        config.resource_priorities.clone(),
    ));

    let restorer = Arc::new(Restorer::new(
        discovery.clone(),
        dynamic,
        block_store.clone(),
        Some(Arc::new(CrPodVolumeRestorer::new(
            client.clone(),
            &namespace,
            &repo_prefix,
        ))),
        config.resource_priorities.clone(),
    ));

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if config.restore_only_mode {
        info!("restore only mode: backup, schedule, gc, and deletion controllers disabled");
    } else {
        tasks.push(spawn_backup_controller(
            &client,
            &namespace,
            backup::Context {
                kube: Arc::new(backup::KubeClientImpl::new(client.clone())),
                backupper,
                backup_service: backup_service.clone(),
                bucket: bucket.clone(),
                snapshots_enabled: block_store.is_some(),
                plugin_manager: plugin_manager.clone(),
                tracker: tracker.clone(),
            },
            token.clone(),
        ));

        tasks.push(spawn_deletion_controller(
            &client,
            &namespace,
            backup_deletion::Context {
                kube: Arc::new(backup_deletion::KubeClientImpl::new(client.clone())),
                backup_service: backup_service.clone(),
                bucket: bucket.clone(),
                namespace: namespace.clone(),
                block_store: block_store.clone(),
                repo_manager: Some(repo_manager.clone()),
                tracker: tracker.clone(),
            },
            token.clone(),
        ));

        tasks.push(tokio::spawn(schedule::run(
            client.clone(),
            namespace.clone(),
            config.schedule_sync_period(),
            token.clone(),
        )));

        tasks.push(tokio::spawn(gc::run(
            client.clone(),
            namespace.clone(),
            config.gc_sync_period(),
            token.clone(),
        )));
    }

    tasks.push(spawn_restore_controller(
        &client,
        &namespace,
        restore::Context {
            kube: Arc::new(restore::KubeClientImpl::new(client.clone())),
            restorer,
            backup_service: cached_backup_service.clone(),
            bucket: bucket.clone(),
            namespace: namespace.clone(),
            snapshots_enabled: block_store.is_some(),
            plugin_manager: plugin_manager.clone(),
        },
        token.clone(),
    ));

    tasks.push(spawn_download_controller(
        &client,
        &namespace,
        download_request::Context {
            kube: Arc::new(download_request::KubeClientImpl::new(client.clone())),
            backup_service: backup_service.clone(),
            bucket: bucket.clone(),
            namespace: namespace.clone(),
        },
        token.clone(),
    ));

    tasks.push(tokio::spawn(backup_sync::run(
        client.clone(),
        namespace.clone(),
        cached_backup_service,
        bucket,
        config.backup_sync_period(),
        token.clone(),
    )));

    info!("server started successfully");
    token.cancelled().await;

    info!("shutting down, draining controllers");
    drain(tasks).await;
    plugin_manager.shutdown().await;
    info!("server stopped");
    Ok(())
}

/// Run the node agent until a signal stops it
pub async fn run_agent(namespace: String, node_name: String) -> Result<()> {
    let client = Client::try_default().await?;
    let token = CancellationToken::new();
    handle_shutdown_signals(token.clone());

    info!(node = %node_name, "agent starting");

    let runner = Arc::new(SubprocessRunner);
    let mut tasks = Vec::new();

    let agent_client: Arc<AgentClientImpl> =
        Arc::new(AgentClientImpl::new(client.clone(), &namespace));

    let pvb_api: Api<PodVolumeBackup> = Api::namespaced(client.clone(), &namespace);
    let pvb_ctx = Arc::new(pod_volume_backup::Context {
        kube: agent_client.clone(),
        node_name: node_name.clone(),
        namespace: namespace.clone(),
        runner: runner.clone(),
    });
    let pvb_token = token.clone();
    tasks.push(tokio::spawn(async move {
        Controller::new(pvb_api, watcher::Config::default())
            .graceful_shutdown_on(pvb_token.cancelled_owned())
            .run(
                pod_volume_backup::reconcile,
                pod_volume_backup::error_policy,
                pvb_ctx,
            )
            .for_each(log_reconcile_result)
            .await;
    }));

    let pvr_api: Api<PodVolumeRestore> = Api::namespaced(client.clone(), &namespace);
    let pvr_ctx = Arc::new(pod_volume_restore::Context {
        kube: agent_client,
        node_name,
        namespace,
        runner,
    });
    let pvr_token = token.clone();
    tasks.push(tokio::spawn(async move {
        Controller::new(pvr_api, watcher::Config::default())
            .graceful_shutdown_on(pvr_token.cancelled_owned())
            .run(
                pod_volume_restore::reconcile,
                pod_volume_restore::error_policy,
                pvr_ctx,
            )
            .for_each(log_reconcile_result)
            .await;
    }));

    token.cancelled().await;
    drain(tasks).await;
    info!("agent stopped");
    Ok(())
}

/// Repository maintenance operations exposed by the CLI
#[derive(Clone, Copy, Debug)]
pub enum RepoOp {
    /// Create the repository and its key
    Init,
    /// Verify repository integrity
    Check,
    /// Drop unreferenced data
    Prune,
}

/// Run one restic repository operation for a namespace, for the CLI
pub async fn run_repo_op(
    server_namespace: String,
    repo_namespace: String,
    op: RepoOp,
) -> Result<()> {
    let client = Client::try_default().await?;
    let token = CancellationToken::new();

    let (_, mut config) = load_config(&client, &server_namespace, &token).await?;
    config.apply_defaults();

    let repo_prefix = RepositoryManager::repo_prefix_for(
        &config.backup_storage_provider.name,
        &config.restic_bucket(),
    );
    let repo_manager = RepositoryManager::new(
        client,
        &server_namespace,
        &repo_prefix,
        Arc::new(SubprocessRunner),
    );

    match op {
        RepoOp::Init => {
            repo_manager.init_repo(&repo_namespace).await?;
            info!(namespace = %repo_namespace, "repository initialized");
        }
        RepoOp::Check => {
            repo_manager.check_repo(&repo_namespace).await?;
            info!(namespace = %repo_namespace, "repository check passed");
        }
        RepoOp::Prune => {
            repo_manager.prune_repo(&repo_namespace).await?;
            info!(namespace = %repo_namespace, "repository pruned");
        }
    }
    Ok(())
}

fn handle_shutdown_signals(token: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        token.cancel();
    });
}

async fn ensure_namespace(client: &Client, namespace: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => info!(namespace = %namespace, "created namespace"),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            info!(namespace = %namespace, "namespace already exists")
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Fetch the Config object, retrying until it exists or we are cancelled.
async fn load_config(
    client: &Client,
    namespace: &str,
    token: &CancellationToken,
) -> Result<(String, ConfigSpec)> {
    let api: Api<Config> = Api::namespaced(client.clone(), namespace);
    loop {
        match api.get(crate::api::DEFAULT_CONFIG_NAME).await {
            Ok(config) => {
                info!("retrieved configuration");
                return Ok((
                    config.metadata.name.clone().unwrap_or_default(),
                    config.spec,
                ));
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                info!("configuration not found, will retry");
            }
            Err(e) => warn!(error = %e, "error retrieving configuration, will retry"),
        }
        tokio::select! {
            _ = token.cancelled() => {
                return Err(crate::Error::validation("cancelled while waiting for configuration"));
            }
            _ = tokio::time::sleep(CONFIG_RETRY_INTERVAL) => {}
        }
    }
}

/// Cancel the root token when the Config object's spec drifts from what
/// this process booted with; the supervisor restarts us with fresh state.
fn watch_config(
    client: &Client,
    namespace: &str,
    config_name: &str,
    original: ConfigSpec,
    token: CancellationToken,
) {
    let api: Api<Config> = Api::namespaced(client.clone(), namespace);
    let name = config_name.to_string();
    tokio::spawn(async move {
        let stream = watcher(api, watcher::Config::default());
        let mut stream = std::pin::pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(updated))
                | Ok(watcher::Event::InitApply(updated)) => {
                    if updated.metadata.name.as_deref() != Some(name.as_str()) {
                        continue;
                    }
                    if updated.spec != original {
                        info!("detected a config change, gracefully shutting down");
                        token.cancel();
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "config watch error"),
            }
        }
    });
}

fn spawn_discovery_refresh(discovery: Arc<DiscoveryHelper>, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DISCOVERY_REFRESH_INTERVAL);
        ticker.tick().await; // the constructor already ran a pass
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = discovery.refresh().await {
                        error!(error = %e, "error refreshing discovery");
                    }
                }
            }
        }
    });
}

async fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) {
    match result {
        Ok(outcome) => tracing::debug!(?outcome, "reconciliation completed"),
        Err(e) => error!(error = %e, "reconciliation error"),
    }
}

async fn drain(tasks: Vec<JoinHandle<()>>) {
    let all = futures::future::join_all(tasks);
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, all).await.is_err() {
        warn!("controllers did not drain within the shutdown window");
    }
}

fn spawn_backup_controller(
    client: &Client,
    namespace: &str,
    ctx: backup::Context,
    token: CancellationToken,
) -> JoinHandle<()> {
    let api: Api<Backup> = Api::namespaced(client.clone(), namespace);
    tokio::spawn(async move {
        Controller::new(api, watcher::Config::default())
            .graceful_shutdown_on(token.cancelled_owned())
            .run(backup::reconcile, backup::error_policy, Arc::new(ctx))
            .for_each(log_reconcile_result)
            .await;
    })
}

fn spawn_restore_controller(
    client: &Client,
    namespace: &str,
    ctx: restore::Context,
    token: CancellationToken,
) -> JoinHandle<()> {
    let api: Api<Restore> = Api::namespaced(client.clone(), namespace);
    tokio::spawn(async move {
        Controller::new(api, watcher::Config::default())
            .graceful_shutdown_on(token.cancelled_owned())
            .run(restore::reconcile, restore::error_policy, Arc::new(ctx))
            .for_each(log_reconcile_result)
            .await;
    })
}

fn spawn_deletion_controller(
    client: &Client,
    namespace: &str,
    ctx: backup_deletion::Context,
    token: CancellationToken,
) -> JoinHandle<()> {
    let api: Api<DeleteBackupRequest> = Api::namespaced(client.clone(), namespace);
    tokio::spawn(async move {
        Controller::new(api, watcher::Config::default())
            .graceful_shutdown_on(token.cancelled_owned())
            .run(
                backup_deletion::reconcile,
                backup_deletion::error_policy,
                Arc::new(ctx),
            )
            .for_each(log_reconcile_result)
            .await;
    })
}

fn spawn_download_controller(
    client: &Client,
    namespace: &str,
    ctx: download_request::Context,
    token: CancellationToken,
) -> JoinHandle<()> {
    let api: Api<DownloadRequest> = Api::namespaced(client.clone(), namespace);
    tokio::spawn(async move {
        Controller::new(api, watcher::Config::default())
            .graceful_shutdown_on(token.cancelled_owned())
            .run(
                download_request::reconcile,
                download_request::error_policy,
                Arc::new(ctx),
            )
            .for_each(log_reconcile_result)
            .await;
    })
}
