use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Substrate status document, as parsed from `status --format json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub machines: BTreeMap<String, MachineStatus>,
    #[serde(default)]
    pub applications: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineStatus {
    #[serde(default, rename = "dns-name")]
    pub dns_name: Option<String>,
    #[serde(default, rename = "instance-id")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub series: Option<String>,
}

impl Status {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("could not parse status output")
    }

    pub fn machine_address(&self, machine_id: &str) -> Option<&str> {
        self.machines
            .get(machine_id)
            .and_then(|machine| machine.dns_name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_machines_and_addresses() {
        let status = Status::from_json(
            r#"{"machines": {"0": {"dns-name": "10.11.12.13", "series": "trusty"},
                             "1": {"instance-id": "pending"}}}"#,
        )
        .expect("parse status");
        assert_eq!(status.machine_address("0"), Some("10.11.12.13"));
        assert_eq!(status.machines["0"].series.as_deref(), Some("trusty"));
        assert_eq!(status.machine_address("1"), None);
        assert_eq!(status.machines["1"].instance_id.as_deref(), Some("pending"));
    }

    #[test]
    fn tolerates_empty_document() {
        let status = Status::from_json("{}").expect("parse empty status");
        assert!(status.machines.is_empty());
        assert!(status.applications.is_empty());
    }
}
