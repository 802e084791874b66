//! Bringing simulators up: cmd, connect and in-process modes.

use crate::config::{SimulatorSpec, WorldConfig, ADDR_PLACEHOLDER};
use crate::error::WorldError;
use cosim_api::ApiError;
use cosim_core::SimId;
use cosim_env::{Endpoint, IncomingRequest, StreamTransport};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// A connected simulator plus whatever must be cleaned up with it.
pub(crate) struct Launched {
    pub endpoint: Arc<Endpoint>,
    pub child: Option<Child>,
    pub server: Option<JoinHandle<Result<(), ApiError>>>,
}

#[instrument(skip(spec, config, requests), fields(mode = spec.mode()))]
pub(crate) async fn launch(
    sid: &SimId,
    spec: &SimulatorSpec,
    config: &WorldConfig,
    requests: mpsc::UnboundedSender<IncomingRequest>,
) -> Result<Launched, WorldError> {
    match spec {
        SimulatorSpec::Cmd { cmd, cwd, env } => {
            let listener = TcpListener::bind((config.host.as_str(), 0))
                .await
                .map_err(|e| WorldError::launch(sid.as_str(), e))?;
            let addr = listener
                .local_addr()
                .map_err(|e| WorldError::launch(sid.as_str(), e))?
                .to_string();

            let line = cmd.replace(ADDR_PLACEHOLDER, &addr);
            let mut parts = line.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| WorldError::launch(sid.as_str(), "empty command"))?;

            let mut command = Command::new(program);
            command.args(parts).envs(env).kill_on_drop(true);
            if let Some(dir) = cwd {
                command.current_dir(dir);
            }
            let mut child = command
                .spawn()
                .map_err(|e| WorldError::launch(sid.as_str(), format!("{}: {}", program, e)))?;
            info!(%addr, program, pid = ?child.id(), "Spawned simulator process");

            let stream = tokio::select! {
                accepted = listener.accept() => {
                    accepted.map_err(|e| WorldError::launch(sid.as_str(), e))?.0
                }
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("process exited before connecting ({})", status),
                        Err(e) => e.to_string(),
                    };
                    return Err(WorldError::launch(sid.as_str(), reason));
                }
                _ = tokio::time::sleep(config.connect_timeout) => {
                    let _ = child.start_kill();
                    return Err(WorldError::launch(sid.as_str(), "timed out waiting for connection"));
                }
            };

            Ok(Launched {
                endpoint: Endpoint::spawn(sid.as_str(), StreamTransport::tcp(stream), requests),
                child: Some(child),
                server: None,
            })
        }
        SimulatorSpec::Connect { addr } => {
            let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr.as_str()))
                .await
                .map_err(|_| WorldError::launch(sid.as_str(), format!("timed out connecting to {}", addr)))?
                .map_err(|e| WorldError::launch(sid.as_str(), format!("{}: {}", addr, e)))?;
            info!(%addr, "Connected to simulator");

            Ok(Launched {
                endpoint: Endpoint::spawn(sid.as_str(), StreamTransport::tcp(stream), requests),
                child: None,
                server: None,
            })
        }
        SimulatorSpec::InProcess(factory) => {
            let (world_side, sim_side) = StreamTransport::in_memory_pair("world", sid.as_str());
            let server = tokio::spawn(cosim_api::serve(factory(), sim_side));
            debug!("Started in-process simulator");

            Ok(Launched {
                endpoint: Endpoint::spawn(sid.as_str(), world_side, requests),
                child: None,
                server: Some(server),
            })
        }
    }
}
