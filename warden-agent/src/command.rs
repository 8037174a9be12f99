// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command channel: a local FIFO carrying newline-delimited JSON
//! commands from operator tooling.
//!
//! A single reader task owns the pipe. Commands are dispatched to the role
//! controller and then discarded; no response channel is guaranteed (where
//! replies exist they are pushed through the web API's reply store).
//! Malformed lines and unknown commands are logged and skipped.

use crate::monitor::MonitorCore;
use crate::params::{
    DeliverCertificateParams, InitializeDomainParams, InitializeNodeParams,
    RoutingRegistration, SetNodeInfoParams,
};
use crate::roles::RoleController;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use slog::Logger;
use std::ffi::CString;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

/// Pause between reopen attempts once the writer side goes away.
const REOPEN_PAUSE: std::time::Duration = std::time::Duration::from_millis(250);

/// A structured command as received on the pipe.
#[derive(Clone, Debug, Deserialize)]
pub struct CommandMessage {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Create the FIFO at `path` if it doesn't already exist.
pub fn create_pipe(path: &Utf8Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let c_path = CString::new(path.as_str())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // Owner-only: commands can finalize the node.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

/// Remove the FIFO. Part of the shutdown discipline.
pub fn remove_pipe(path: &Utf8Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Spawn the single reader task for the command pipe.
pub fn spawn_reader(
    log: &Logger,
    path: Utf8PathBuf,
    core: Arc<MonitorCore>,
    controller: Arc<dyn RoleController>,
) -> JoinHandle<()> {
    let log = log.new(o!("component" => "CommandChannel"));
    tokio::spawn(async move {
        read_loop(log, path, core, controller).await;
    })
}

async fn read_loop(
    log: Logger,
    path: Utf8PathBuf,
    core: Arc<MonitorCore>,
    controller: Arc<dyn RoleController>,
) {
    let mut shutdown_rx = core.shutdown_watch();
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        let receiver = match pipe::OpenOptions::new()
            .open_receiver(path.as_std_path())
        {
            Ok(receiver) => receiver,
            Err(err) => {
                warn!(log, "failed to open command pipe";
                    "path" => %path, "error" => %err);
                if pause(&mut shutdown_rx).await {
                    return;
                }
                continue;
            }
        };

        let mut lines = BufReader::new(receiver).lines();
        loop {
            tokio::select! {
                _ = async {
                    let _ = shutdown_rx.wait_for(|requested| *requested).await;
                } => return,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        dispatch_line(&log, &core, &*controller, &line).await;
                    }
                    // EOF: every writer closed. Reopen after a pause so an
                    // idle pipe doesn't spin us.
                    Ok(None) => break,
                    Err(err) => {
                        warn!(log, "error reading command pipe";
                            "error" => %err);
                        break;
                    }
                }
            }
        }
        if pause(&mut shutdown_rx).await {
            return;
        }
    }
}

// Returns true when shutdown arrived during the pause.
async fn pause(shutdown_rx: &mut tokio::sync::watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_rx.wait_for(|requested| *requested) => true,
        _ = tokio::time::sleep(REOPEN_PAUSE) => false,
    }
}

async fn dispatch_line(
    log: &Logger,
    core: &MonitorCore,
    controller: &dyn RoleController,
    line: &str,
) {
    let message: CommandMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(err) => {
            warn!(log, "malformed command skipped"; "error" => %err);
            return;
        }
    };
    debug!(log, "received command";
        "name" => %message.name,
        "correlation_id" => ?message.correlation_id);
    if let Err(err) = dispatch(core, controller, message.clone()).await {
        warn!(log, "command failed";
            "name" => %message.name,
            "correlation_id" => ?message.correlation_id,
            "error" => %err);
    }
}

/// Dispatch one command to its handler.
pub async fn dispatch(
    core: &MonitorCore,
    controller: &dyn RoleController,
    message: CommandMessage,
) -> Result<(), anyhow::Error> {
    match message.name.as_str() {
        "set_node_info" => {
            let params: SetNodeInfoParams =
                serde_json::from_value(message.payload)?;
            let mut node = core.store().node_identity().await?;
            node.hostname = params.hostname;
            core.store().put_node_identity(&node).await?;
            Ok(())
        }
        "initialize_domain" => {
            let params: InitializeDomainParams =
                serde_json::from_value(message.payload)?;
            controller.initialize_domain(core, params).await?;
            Ok(())
        }
        "initialize_node" => {
            let params: InitializeNodeParams =
                serde_json::from_value(message.payload)?;
            controller.initialize_node(core, params).await?;
            Ok(())
        }
        "deliver_certificate" => {
            let params: DeliverCertificateParams =
                serde_json::from_value(message.payload)?;
            controller.deliver_certificate(core, params).await?;
            Ok(())
        }
        "relay_registration" => {
            let registration: RoutingRegistration =
                serde_json::from_value(message.payload)?;
            controller.relay_registration(core, registration).await?;
            Ok(())
        }
        other => Err(anyhow::anyhow!("unknown command {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_messages_parse_from_json_lines() {
        let message: CommandMessage = serde_json::from_str(
            r#"{"name": "set_node_info",
                "payload": {"hostname": "node2.cluster.internal"},
                "correlation_id": "op-1"}"#,
        )
        .unwrap();
        assert_eq!(message.name, "set_node_info");
        assert_eq!(message.correlation_id.as_deref(), Some("op-1"));

        // Payload and correlation id are optional on the wire.
        let message: CommandMessage =
            serde_json::from_str(r#"{"name": "noop"}"#).unwrap();
        assert!(message.payload.is_null());
        assert!(message.correlation_id.is_none());
    }

    #[test]
    fn garbage_lines_do_not_parse() {
        assert!(serde_json::from_str::<CommandMessage>("ceci n'est pas du json")
            .is_err());
    }
}
