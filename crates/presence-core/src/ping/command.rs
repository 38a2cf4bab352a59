use std::io;
use std::net::IpAddr;
use std::process::{Command, Stdio};
use std::time::Duration;

use super::Pinger;

/// Unprivileged pinger that runs the system `ping` utility.
#[derive(Debug, Clone)]
pub struct CommandPinger {
    program: String,
    payload: u16,
}

impl CommandPinger {
    /// Pinger sending `payload` bytes per echo.
    pub fn new(payload: u16) -> Self {
        Self {
            program: "ping".to_string(),
            payload,
        }
    }

    /// Use a different executable with the same command line.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn arguments(&self, address: IpAddr, timeout: Duration) -> Vec<String> {
        vec![
            "-q".to_string(),
            "-c1".to_string(),
            format!("-W{}", timeout.as_secs().max(1)),
            format!("-s{}", self.payload),
            address.to_string(),
        ]
    }
}

impl Pinger for CommandPinger {
    /// Exit status 0 means a reply, 1 means none; anything else is an error.
    fn probe(&mut self, address: IpAddr, timeout: Duration) -> io::Result<bool> {
        let status = Command::new(&self.program)
            .args(self.arguments(address, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(io::Error::other(format!("{} exited with {status}", self.program))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_command_line() {
        let pinger = CommandPinger::new(56);
        let args = pinger.arguments(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), Duration::from_millis(200));
        assert_eq!(args, vec!["-q", "-c1", "-W1", "-s56", "192.168.1.10"]);
    }

    #[test]
    fn test_exit_codes_map_to_readings() {
        let address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let timeout = Duration::from_secs(1);

        assert!(CommandPinger::new(56).with_program("true").probe(address, timeout).unwrap());
        assert!(!CommandPinger::new(56).with_program("false").probe(address, timeout).unwrap());
        assert!(CommandPinger::new(56)
            .with_program("/nonexistent/ping")
            .probe(address, timeout)
            .is_err());
    }
}
