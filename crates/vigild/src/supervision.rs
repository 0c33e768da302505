//! Process-supervision adapter.
//!
//! Speaks the notify-socket datagram protocol to the supervisor when
//! `NOTIFY_SOCKET` is present and degrades to log-only otherwise. The
//! daemon also deliberately reports liveness from the cooperative
//! scheduler itself, so a wedged event loop stops the supervisor pulse
//! and the outer supervisor gets its own independent detection path.

use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn};
use vigil_common::ExitCode;

pub struct SupervisionAdapter {
    socket: Option<UnixDatagram>,
    socket_path: Option<String>,
}

impl SupervisionAdapter {
    /// Build the adapter from the environment. Absence of
    /// `NOTIFY_SOCKET` is the normal unsupervised case, not an error.
    pub fn from_env() -> Self {
        let socket_path = match std::env::var("NOTIFY_SOCKET") {
            Ok(path) if !path.is_empty() => path,
            _ => {
                info!("NOTIFY_SOCKET not set, supervisor notifications disabled");
                return SupervisionAdapter {
                    socket: None,
                    socket_path: None,
                };
            }
        };
        if socket_path.starts_with('@') {
            warn!("abstract notify sockets are not supported, notifications disabled");
            return SupervisionAdapter {
                socket: None,
                socket_path: None,
            };
        }
        match UnixDatagram::unbound() {
            Ok(socket) => {
                info!("supervisor notify socket: {}", socket_path);
                SupervisionAdapter {
                    socket: Some(socket),
                    socket_path: Some(socket_path),
                }
            }
            Err(err) => {
                warn!("could not open notify socket: {}", err);
                SupervisionAdapter {
                    socket: None,
                    socket_path: None,
                }
            }
        }
    }

    /// Adapter that never notifies. Used in tests and unsupervised
    /// runs.
    pub fn disabled() -> Self {
        SupervisionAdapter {
            socket: None,
            socket_path: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn send(&self, payload: &str) {
        let (socket, path) = match (&self.socket, &self.socket_path) {
            (Some(socket), Some(path)) => (socket, path),
            _ => return,
        };
        if let Err(err) = socket.send_to(payload.as_bytes(), Path::new(path)) {
            warn!("supervisor notification failed ({}): {}", payload, err);
        }
    }

    pub fn notify_ready(&self) {
        self.send("READY=1");
        info!("SUPERVISOR_NOTIFY ready");
    }

    pub fn notify_watchdog(&self) {
        self.send("WATCHDOG=1");
    }

    pub fn notify_stopping(&self) {
        self.send("STOPPING=1");
        info!("SUPERVISOR_NOTIFY stopping");
    }

    /// Periodic supervisor pulse, driven from the cooperative
    /// scheduler. If the scheduler wedges this loop stops ticking and
    /// the supervisor's own watchdog takes over.
    pub async fn run_pulse(&self, interval: Duration, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.notify_watchdog(),
                changed = stop.changed() => {
                    // A dropped sender means the daemon loop is gone.
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Terminal exit path. Logs the structured exit event, tells the
    /// supervisor we are stopping, and ends the process with the
    /// classified code.
    pub fn exit_with(&self, code: ExitCode, reason: &str) -> ! {
        error!(
            "SYSTEM_EXIT code={} restart_expected={} reason={}",
            code,
            code.restart_expected(),
            reason
        );
        self.notify_stopping();
        std::process::exit(code.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram as StdDatagram;

    #[test]
    fn test_disabled_adapter_is_silent() {
        let adapter = SupervisionAdapter::disabled();
        assert!(!adapter.is_connected());
        // Must be a no-op, not a panic.
        adapter.notify_ready();
        adapter.notify_watchdog();
        adapter.notify_stopping();
    }

    #[test]
    fn test_ready_datagram_reaches_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = StdDatagram::bind(&path).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();

        let adapter = SupervisionAdapter {
            socket: Some(UnixDatagram::unbound().unwrap()),
            socket_path: Some(path.to_string_lossy().into_owned()),
        };
        adapter.notify_ready();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }
}
