//! Aggregate reporting across a rolling deploy (spec §7 "Propagation
//! policy"): every `(service, host)` result is logged as it completes and
//! rolled into a final count the operator sees.

use crate::error::DeployError;

#[derive(Debug, Clone)]
pub struct SlotResult {
    pub service: String,
    pub host: String,
    pub outcome: Result<(), String>,
}

#[derive(Debug, Default, Clone)]
pub struct DeployReport {
    pub succeeded: Vec<SlotResult>,
    pub failed: Vec<SlotResult>,
}

impl DeployReport {
    pub fn record(&mut self, service: &str, host: &str, result: &Result<(), DeployError>) {
        let slot = SlotResult {
            service: service.to_owned(),
            host: host.to_owned(),
            outcome: result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
        };
        match result {
            Ok(()) => {
                log::info!("deploy succeeded: {service} on {host}");
                self.succeeded.push(slot);
            }
            Err(e) => {
                log::error!("deploy failed: {service} on {host}: {e}");
                self.failed.push(slot);
            }
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}
