// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembles and runs the agent: identity store, certificate manager,
//! collaborator clients, the detected role controller, and the monitor
//! core, plus the long-running tasks around them (command channel, web
//! API, signal handling, platform event listener, discovery).

use crate::command;
use crate::config::Config;
use crate::detector::{self, DetectorError};
use crate::discovery::PeerBroadcaster;
use crate::http_entrypoints::{self, ApiContext};
use crate::middleware::{HttpMiddleware, MiddlewareClient};
use crate::monitor::{release_all, MonitorCore, MonitorState, ReleaseStep};
use crate::platform::{HttpOrchestration, OrchestrationClient};
use crate::roles::{controller_for, BootOutcome, ControllerError};
use camino::Utf8PathBuf;
use dropshot::{ConfigDropshot, HttpServerStarter};
use futures::{FutureExt, StreamExt};
use idstore::{DirectoryStore, IdentityStore, StoreError};
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use warden_certificates::CertificateManager;
use warden_common::cluster::NodeIdentity;

/// How the agent process should end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerOutcome {
    /// Normal shutdown; exit 0.
    Shutdown,
    /// Deliberate restart after a bootstrap step; exit with the restart
    /// code so the supervisor relaunches immediately.
    RestartRequested,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("bootstrap failed: {0}")]
    Controller(#[from] ControllerError),

    #[error("I/O error accessing {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to start web API: {0}")]
    Server(String),
}

/// Run the agent to completion.
pub async fn run(
    config: Config,
    log: Logger,
) -> Result<ServerOutcome, StartError> {
    let config = Arc::new(config);
    let store: Arc<dyn IdentityStore> =
        Arc::new(DirectoryStore::new(config.secrets_dir.clone())?);

    // First boot creates this node's identity.
    let node = match store.node_identity().await {
        Ok(node) => node,
        Err(err) if err.is_not_found() => {
            let node = NodeIdentity::new(config.hostname());
            store.put_node_identity(&node).await?;
            info!(log, "created node identity";
                "node_id" => %node.node_id,
                "hostname" => %node.hostname);
            node
        }
        Err(err) => return Err(err.into()),
    };

    let (kind, cluster_config) =
        detector::detect_node_kind(&log, &*store, config.security_level)
            .await?;

    let certificates = Arc::new(CertificateManager::new(
        &log,
        Arc::clone(&store),
        config.data_dir.join("staging"),
        node.hostname.clone(),
        config.insecure,
    ));
    let platform: Arc<dyn OrchestrationClient> = Arc::new(
        HttpOrchestration::new(&log, config.orchestration_url.clone()),
    );
    // Dependent nodes talk to the principal; everyone else to the local
    // middleware endpoint.
    let middleware_url = config
        .middleware_url
        .clone()
        .or_else(|| {
            cluster_config.as_ref().and_then(|c| c.principal_url.clone())
        })
        .unwrap_or_else(|| format!("http://{}", config.bind_address));
    let middleware: Arc<dyn MiddlewareClient> =
        Arc::new(HttpMiddleware::new(&log, middleware_url));

    let controller = controller_for(kind, &log);
    let core = Arc::new(MonitorCore::new(
        &log,
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&certificates),
        Arc::clone(&platform),
        Arc::clone(&middleware),
    ));

    spawn_signal_handler(&log, Arc::clone(&core))?;

    // The command channel opens before bootstrap: the installer's
    // externally-triggered operations arrive on it.
    command::create_pipe(&config.command_pipe).map_err(|err| {
        StartError::Io { path: config.command_pipe.clone(), err }
    })?;
    let command_task = command::spawn_reader(
        &log,
        config.command_pipe.clone(),
        Arc::clone(&core),
        Arc::clone(&controller),
    );

    let api_context =
        Arc::new(ApiContext::new(Arc::clone(&core), Arc::clone(&controller)));
    let dropshot_log = log.new(o!("component" => "dropshot"));
    let web_server = HttpServerStarter::new(
        &ConfigDropshot {
            bind_address: config.bind_address,
            ..Default::default()
        },
        http_entrypoints::api(),
        api_context,
        &dropshot_log,
    )
    .map_err(|err| StartError::Server(err.to_string()))?
    .start();
    info!(log, "agent API listening"; "address" => %config.bind_address);

    let boot_result = controller.prepare(&core).await;

    let mut discovery = None;
    if matches!(boot_result, Ok(BootOutcome::Proceed))
        && !core.shutdown_requested()
    {
        spawn_event_listener(&log, Arc::clone(&core));
        discovery = match PeerBroadcaster::start(
            &log,
            node.node_id,
            config.bind_address.port(),
            config.discovery_port,
        )
        .await
        {
            Ok(broadcaster) => Some(broadcaster),
            Err(err) => {
                // Operating without discovery beats not operating.
                warn!(log, "discovery broadcaster failed to start";
                    "error" => %err);
                None
            }
        };

        core.set_state(MonitorState::Operational);
        core.run(&*controller).await;
    }

    // The shutdown discipline: every release step runs, independently of
    // the others' success, on every exit path.
    core.set_state(MonitorState::ShuttingDown);
    core.trigger_shutdown();
    let steps = vec![
        ReleaseStep {
            name: "discovery-broadcaster",
            run: async move {
                if let Some(broadcaster) = discovery {
                    broadcaster.stop().await;
                }
                Ok(())
            }
            .boxed(),
        },
        ReleaseStep {
            name: "web-api",
            run: async move {
                web_server.close().await.map_err(|e| anyhow::anyhow!(e))
            }
            .boxed(),
        },
        ReleaseStep {
            name: "middleware",
            run: {
                let middleware = Arc::clone(&middleware);
                async move {
                    middleware.close().await;
                    Ok(())
                }
                .boxed()
            },
        },
        ReleaseStep {
            name: "platform-client",
            run: {
                let platform = Arc::clone(&platform);
                async move {
                    platform.close().await;
                    Ok(())
                }
                .boxed()
            },
        },
        ReleaseStep {
            name: "controller-helpers",
            run: {
                let controller = Arc::clone(&controller);
                let core = Arc::clone(&core);
                async move {
                    controller.stop_helpers(&core).await;
                    Ok(())
                }
                .boxed()
            },
        },
        ReleaseStep {
            name: "staged-material",
            run: {
                let certificates = Arc::clone(&certificates);
                async move {
                    certificates.clear_staging()?;
                    Ok(())
                }
                .boxed()
            },
        },
        ReleaseStep {
            name: "command-pipe",
            run: {
                let path = config.command_pipe.clone();
                async move {
                    command::remove_pipe(&path)?;
                    Ok(())
                }
                .boxed()
            },
        },
        ReleaseStep {
            name: "wake-waiters",
            run: {
                let core = Arc::clone(&core);
                async move {
                    core.wake();
                    Ok(())
                }
                .boxed()
            },
        },
    ];
    release_all(&log, steps).await;

    // The reader observes the shutdown flag within its next poll; don't
    // hang forever if it doesn't.
    let _ = tokio::time::timeout(Duration::from_secs(5), command_task).await;

    match boot_result {
        Err(err) => Err(StartError::Controller(err)),
        Ok(BootOutcome::RestartRequested) => {
            Ok(ServerOutcome::RestartRequested)
        }
        Ok(BootOutcome::StopForOperator) => {
            info!(
                log,
                "stopping for operator action; restart the agent once the \
                 emitted artifacts are provisioned"
            );
            Ok(ServerOutcome::Shutdown)
        }
        Ok(BootOutcome::Proceed) => {
            if core.restart_requested() {
                Ok(ServerOutcome::RestartRequested)
            } else {
                Ok(ServerOutcome::Shutdown)
            }
        }
    }
}

fn spawn_signal_handler(
    log: &Logger,
    core: Arc<MonitorCore>,
) -> Result<(), StartError> {
    let signals =
        signal_hook_tokio::Signals::new([libc::SIGTERM, libc::SIGINT])
            .map_err(|err| StartError::Io { path: "signals".into(), err })?;
    let log = log.new(o!("component" => "signals"));
    tokio::spawn(async move {
        let mut signals = signals.fuse();
        while let Some(signal) = signals.next().await {
            info!(log, "caught signal; requesting shutdown";
                "signal" => signal);
            core.trigger_shutdown();
        }
    });
    Ok(())
}

// Wakes the maintenance loop when the orchestration platform reports an
// event, so a dead container is noticed before the next cadence tick.
fn spawn_event_listener(log: &Logger, core: Arc<MonitorCore>) {
    let log = log.new(o!("component" => "PlatformEvents"));
    tokio::spawn(async move {
        let mut shutdown_rx = core.shutdown_watch();
        loop {
            tokio::select! {
                _ = async {
                    let _ = shutdown_rx.wait_for(|requested| *requested).await;
                } => return,
                result = core.platform().wait_event(
                    Duration::from_secs(30)) => match result
                {
                    Ok(true) => {
                        debug!(log, "platform event; waking maintenance loop");
                        core.wake();
                    }
                    Ok(false) => {}
                    Err(err) => {
                        debug!(log, "event stream error"; "error" => %err);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    });
}
