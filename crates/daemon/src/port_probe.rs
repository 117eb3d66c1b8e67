// Cloudflared Tunnel Manager - Port Probe
// TCP port availability and occupying-process lookup

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::process::{Command, Stdio};

use cf_tunnel_common::TunnelError;
use tracing::debug;

/// Port availability checks used before spawning a tunnel
pub trait PortProbe: Send + Sync {
    /// Whether a listener could bind `port` on all interfaces right now
    fn is_available(&self, port: u16) -> bool;

    /// Name of the process listening on `port`, best effort
    fn occupying_process(&self, port: u16) -> Option<String>;

    /// First available port in `[start, start + max_attempts)`
    fn first_available(&self, start: u16, max_attempts: u16) -> Option<u16> {
        let mut port = start;
        for _ in 0..max_attempts {
            if self.is_available(port) {
                return Some(port);
            }
            port = port.checked_add(1)?;
        }
        None
    }

    /// `PortConflict` when the port is taken
    fn check(&self, port: u16) -> Result<(), TunnelError> {
        if self.is_available(port) {
            Ok(())
        } else {
            Err(TunnelError::PortConflict {
                port,
                occupying_process: self.occupying_process(port),
            })
        }
    }
}

/// Probe backed by real sockets and `lsof`
#[derive(Debug, Clone, Default)]
pub struct SystemPortProbe;

impl SystemPortProbe {
    pub fn new() -> Self {
        Self
    }
}

impl PortProbe for SystemPortProbe {
    fn is_available(&self, port: u16) -> bool {
        // Privileged ports fail with EACCES, which is reported as "in use"
        match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                debug!("Port {} not available: {}", port, e);
                false
            }
        }
    }

    fn occupying_process(&self, port: u16) -> Option<String> {
        let output = Command::new("lsof")
            .arg("-nP")
            .arg(format!("-iTCP:{}", port))
            .arg("-sTCP:LISTEN")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();

        match output {
            Ok(output) => parse_lsof_command(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                debug!("lsof unavailable for port {}: {}", port, e);
                None
            }
        }
    }
}

/// COMMAND column of the first data row of `lsof` output
fn parse_lsof_command(output: &str) -> Option<String> {
    output
        .lines()
        .skip(1)
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct BusyPorts(HashSet<u16>);

    impl PortProbe for BusyPorts {
        fn is_available(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }

        fn occupying_process(&self, port: u16) -> Option<String> {
            self.0.contains(&port).then(|| "Apache".to_string())
        }
    }

    #[test]
    fn test_bound_port_is_unavailable() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = SystemPortProbe::new();
        assert!(!probe.is_available(port));
        assert!(matches!(
            probe.check(port),
            Err(TunnelError::PortConflict { port: p, .. }) if p == port
        ));

        drop(listener);
        assert!(probe.is_available(port));
    }

    #[test]
    fn test_available_port_can_be_bound_again() {
        let port = {
            let listener = TcpListener::bind("0.0.0.0:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let probe = SystemPortProbe::new();
        if probe.is_available(port) {
            // Probe released the socket
            assert!(TcpListener::bind(("0.0.0.0", port)).is_ok());
        }
    }

    #[test]
    fn test_first_available_scans_linearly() {
        let probe = BusyPorts([8080, 8081].into_iter().collect());
        assert_eq!(probe.first_available(8080, 5), Some(8082));
        assert_eq!(probe.first_available(8080, 2), None);
        assert_eq!(probe.first_available(u16::MAX, 3), Some(u16::MAX));

        let probe = BusyPorts([u16::MAX].into_iter().collect());
        assert_eq!(probe.first_available(u16::MAX, 3), None);
    }

    #[test]
    fn test_check_reports_occupying_process() {
        let probe = BusyPorts([8888].into_iter().collect());
        assert_eq!(
            probe.check(8888),
            Err(TunnelError::PortConflict {
                port: 8888,
                occupying_process: Some("Apache".to_string()),
            })
        );
        assert!(probe.check(8889).is_ok());
    }

    #[test]
    fn test_parse_lsof_command() {
        let output = "COMMAND   PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME\n\
                      httpd   12345 me    4u  IPv6 0x1234      0t0  TCP *:8888 (LISTEN)\n";
        assert_eq!(parse_lsof_command(output), Some("httpd".to_string()));
        assert_eq!(parse_lsof_command(""), None);
        assert_eq!(parse_lsof_command("COMMAND PID USER\n"), None);
    }
}
