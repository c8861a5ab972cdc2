//! Upload side of the pipeline.
//!
//! [`LogUploader`] renders each delivered batch as JSON records and writes
//! them to the log, standing in for the cloud client that would receive
//! the same records.

use std::net::IpAddr;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use log::{error, info};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::holder::IntentsCallback;
use crate::types::{ConnectionsCount, Intent, ServiceIdentity, TimestampedIntent};

/// Wire shape of one delivered intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRecord {
    pub client: ServiceIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpAddr>,
    pub last_seen_unix_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections_count: Option<ConnectionsCount>,
}

impl From<&TimestampedIntent> for UploadRecord {
    fn from(entry: &TimestampedIntent) -> Self {
        let (client, dns_name, ips) = match &entry.intent {
            Intent::Dns(dns) => (
                dns.client.clone(),
                Some(dns.dns_name.clone()),
                dns.ips.iter().copied().collect(),
            ),
            Intent::Ip(ip) => (ip.client.clone(), None, vec![ip.ip]),
        };
        let last_seen_unix_ms = entry
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        Self {
            client,
            dns_name,
            ips,
            last_seen_unix_ms,
            connections_count: entry.connections_count,
        }
    }
}

/// Converts a batch into upload records, sorted for stable output.
pub fn to_upload_records(intents: &[TimestampedIntent]) -> Vec<UploadRecord> {
    let mut records: Vec<UploadRecord> = intents.iter().map(UploadRecord::from).collect();
    records.sort_by(|a, b| {
        (&a.client, &a.dns_name, &a.ips).cmp(&(&b.client, &b.dns_name, &b.ips))
    });
    records
}

#[derive(Debug, Default)]
pub struct LogUploader;

impl LogUploader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IntentsCallback for LogUploader {
    async fn notify(&self, cancel: &CancellationToken, intents: &[TimestampedIntent]) {
        if cancel.is_cancelled() {
            return;
        }

        let records = to_upload_records(intents);
        match serde_json::to_string(&records) {
            Ok(json) => info!("Uploading {} external traffic intents: {}", records.len(), json),
            Err(e) => error!("Failed to serialize external traffic intents: {}", e),
        }
    }
}
