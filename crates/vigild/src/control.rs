//! Control socket: newline-delimited JSON over a unix socket.
//!
//! Read-only status plus the chaos trigger. Status is served from the
//! lock-free state view, never from the state machine itself. On the
//! single-threaded runtime a hard stall freezes this server along with
//! everything else cooperative; the thread watchdog covers that case.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};
use vigil_common::ipc::{Request, Response, ResponseData, StatusData};

use crate::chaos::{ChaosInjector, ChaosType};
use crate::heartbeat::HeartbeatSignal;
use crate::machine::StateView;

/// State shared across control connections.
pub struct ControlState {
    pub version: String,
    pub view: StateView,
    pub heartbeat: Arc<HeartbeatSignal>,
    pub chaos: Arc<ChaosInjector>,
}

/// Bind the control socket and serve until the listener task is
/// dropped.
pub async fn start_server(socket_path: PathBuf, state: Arc<ControlState>) -> Result<()> {
    if let Some(dir) = socket_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create socket directory {}", dir.display()))?;
    }
    let _ = tokio::fs::remove_file(&socket_path).await;

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind control socket {}", socket_path.display()))?;
    set_socket_permissions(&socket_path)?;
    info!("control socket listening on {}", socket_path.display());

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                if !peer_allowed(&stream) {
                    continue;
                }
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        warn!("control connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("control socket accept failed: {}", e);
            }
        }
    }
}

/// Only root and the daemon's own uid may speak to the control socket.
fn peer_allowed(stream: &UnixStream) -> bool {
    match nix::sys::socket::getsockopt(stream, nix::sys::socket::sockopt::PeerCredentials) {
        Ok(creds) => {
            let uid = creds.uid();
            if uid == 0 || uid == nix::unistd::Uid::effective().as_raw() {
                true
            } else {
                warn!("control connection from uid {} rejected", uid);
                false
            }
        }
        Err(e) => {
            warn!("could not read peer credentials, rejecting: {}", e);
            false
        }
    }
}

fn set_socket_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

async fn handle_connection(stream: UnixStream, state: Arc<ControlState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .context("failed to read from control socket")?;
        if n == 0 {
            break;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(request, &state).await,
            Err(e) => {
                warn!("invalid control request: {}", e);
                Response::err(format!("invalid request: {}", e))
            }
        };

        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer
            .write_all(payload.as_bytes())
            .await
            .context("failed to write control response")?;
    }

    Ok(())
}

async fn handle_request(request: Request, state: &ControlState) -> Response {
    match request {
        Request::Status => {
            let heartbeat_age_secs = state
                .heartbeat
                .age()
                .map(|age| age.as_secs_f64())
                .unwrap_or(-1.0);
            Response::ok(ResponseData::Status(StatusData {
                version: state.version.clone(),
                state: state.view.state(),
                consecutive_errors: state.view.consecutive_errors(),
                recovery_cycles: state.view.recovery_cycles(),
                heartbeat_age_secs,
                chaos_active: state.chaos.is_active().await,
            }))
        }

        Request::ChaosInject { chaos_type, duration_secs } => {
            let chaos_type: ChaosType = match chaos_type.parse() {
                Ok(ct) => ct,
                Err(e) => return Response::err(e.to_string()),
            };
            match state.chaos.inject(chaos_type, duration_secs).await {
                Ok(incident_id) => Response::ok(ResponseData::ChaosStarted { incident_id }),
                Err(e) => Response::err(e.to_string()),
            }
        }

        Request::ChaosStop => {
            let was_active = state.chaos.stop().await;
            Response::ok(ResponseData::ChaosStopped { was_active })
        }
    }
}
