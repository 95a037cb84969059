//! Container health sync (spec §4.5 step 4, testable property 5): process
//! liveness via the engine, TCP probe when a health port is configured,
//! and the failure-count state machine that derives `health_status`.

use meridian_common::model::HealthStatus;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthOutcome {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
}

/// One observation feeding the state machine: either the container process
/// isn't running, or the process is running and a TCP probe (if
/// configured) succeeded/failed.
#[derive(Debug, Clone, Copy)]
pub enum Observation {
    ProcessNotRunning,
    NoHealthPortConfigured,
    ProbeSucceeded,
    ProbeFailed,
}

/// Advances the container health state machine by one observation
/// (testable property 5): three consecutive TCP failures drive
/// `unknown -> degraded -> degraded -> unhealthy` with failures going
/// 0->1->2->3; any success resets to `healthy, 0`.
pub fn advance(current_failures: u32, observation: Observation) -> HealthOutcome {
    match observation {
        Observation::ProcessNotRunning => HealthOutcome {
            status: HealthStatus::Unhealthy,
            consecutive_failures: current_failures + 1,
        },
        Observation::NoHealthPortConfigured | Observation::ProbeSucceeded => HealthOutcome {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
        },
        Observation::ProbeFailed => {
            let failures = current_failures + 1;
            let status = if failures >= 3 {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            };
            HealthOutcome {
                status,
                consecutive_failures: failures,
            }
        }
    }
}

pub async fn is_process_running(engine_bin: &str, container_id: &str) -> bool {
    let Ok(output) = Command::new(engine_bin)
        .arg("ps")
        .arg("--filter")
        .arg(format!("id={container_id}"))
        .arg("--quiet")
        .stdout(Stdio::piped())
        .output()
        .await
    else {
        return false;
    };
    !String::from_utf8_lossy(&output.stdout).trim().is_empty()
}

pub async fn probe_tcp(ip: IpAddr, port: u16) -> bool {
    let addr = std::net::SocketAddr::new(ip, port);
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_failures_drive_unknown_to_unhealthy() {
        let mut failures = 0;
        let o1 = advance(failures, Observation::ProbeFailed);
        assert_eq!(o1.status, HealthStatus::Degraded);
        assert_eq!(o1.consecutive_failures, 1);
        failures = o1.consecutive_failures;

        let o2 = advance(failures, Observation::ProbeFailed);
        assert_eq!(o2.status, HealthStatus::Degraded);
        assert_eq!(o2.consecutive_failures, 2);
        failures = o2.consecutive_failures;

        let o3 = advance(failures, Observation::ProbeFailed);
        assert_eq!(o3.status, HealthStatus::Unhealthy);
        assert_eq!(o3.consecutive_failures, 3);
    }

    #[test]
    fn any_success_resets() {
        let o = advance(5, Observation::ProbeSucceeded);
        assert_eq!(o.status, HealthStatus::Healthy);
        assert_eq!(o.consecutive_failures, 0);
    }

    #[test]
    fn process_not_running_is_immediately_unhealthy() {
        let o = advance(0, Observation::ProcessNotRunning);
        assert_eq!(o.status, HealthStatus::Unhealthy);
        assert_eq!(o.consecutive_failures, 1);
    }
}
