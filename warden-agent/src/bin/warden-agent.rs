// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the warden agent

use camino::Utf8PathBuf;
use clap::Parser;
use dropshot::{ConfigLogging, ConfigLoggingLevel};
use warden_agent::config::Config;
use warden_agent::server::{self, ServerOutcome};
use warden_common::cluster::SecurityLevel;
use warden_common::cmd::{
    fatal, CmdError, EXIT_CODE_RESTART, EXIT_CODE_SHUTDOWN,
};

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Parser)]
#[command(name = "warden-agent", about = "Per-node warden cluster monitor")]
enum Args {
    /// Runs the agent.
    Run {
        /// Path to the agent config file. Defaults to `config.toml` under
        /// the config directory.
        #[arg(long)]
        config: Option<Utf8PathBuf>,

        /// Directory holding the agent configuration.
        #[arg(long, default_value = "/etc/warden")]
        config_dir: Utf8PathBuf,

        /// Raise log verbosity to debug.
        #[arg(long)]
        debug: bool,

        /// Dev mode: skip certificate expiration validation.
        #[arg(long)]
        insecure: bool,

        /// Override the security level recorded in the cluster
        /// configuration (dev aid).
        #[arg(long)]
        security_level: Option<SecurityLevel>,

        /// Override the identity store directory.
        #[arg(long)]
        secrets_dir: Option<Utf8PathBuf>,

        /// Override the scratch/data directory.
        #[arg(long)]
        data_dir: Option<Utf8PathBuf>,

        /// Override the installer webroot.
        #[arg(long)]
        webroot: Option<Utf8PathBuf>,

        /// Override the command pipe path.
        #[arg(long)]
        command_pipe: Option<Utf8PathBuf>,

        /// Override the orchestration platform URL.
        #[arg(long)]
        orchestration_url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(message) = do_run().await {
        fatal(message);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::parse();

    match args {
        Args::Run {
            config,
            config_dir,
            debug,
            insecure,
            security_level,
            secrets_dir,
            data_dir,
            webroot,
            command_pipe,
            orchestration_url,
        } => {
            let config_path =
                config.unwrap_or_else(|| config_dir.join(CONFIG_FILE));
            let mut config = Config::from_file(&config_path)
                .map_err(|err| CmdError::Failure(err.to_string()))?;
            if debug {
                config.log = raise_to_debug(config.log);
            }
            if insecure {
                config.insecure = true;
            }
            if security_level.is_some() {
                config.security_level = security_level;
            }
            if let Some(secrets_dir) = secrets_dir {
                config.secrets_dir = secrets_dir;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(webroot) = webroot {
                config.webroot = webroot;
            }
            if let Some(command_pipe) = command_pipe {
                config.command_pipe = command_pipe;
            }
            if let Some(orchestration_url) = orchestration_url {
                config.orchestration_url = orchestration_url;
            }

            let log = config
                .log
                .to_logger("warden-agent")
                .map_err(|err| CmdError::Failure(err.to_string()))?;

            let outcome = server::run(config, log)
                .await
                .map_err(|err| CmdError::Failure(err.to_string()))?;
            let code = match outcome {
                ServerOutcome::Shutdown => EXIT_CODE_SHUTDOWN,
                ServerOutcome::RestartRequested => EXIT_CODE_RESTART,
            };
            std::process::exit(code);
        }
    }
}

fn raise_to_debug(log: ConfigLogging) -> ConfigLogging {
    match log {
        ConfigLogging::StderrTerminal { .. } => {
            ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Debug }
        }
        ConfigLogging::File { path, if_exists, .. } => ConfigLogging::File {
            level: ConfigLoggingLevel::Debug,
            path,
            if_exists,
        },
    }
}
