//! Observation source reading newline-delimited JSON records.
//!
//! Each line is one observation:
//!
//! ```text
//! {"kind":"dns","client":{"name":"api","namespace":"prod"},"dns_name":"example.com","ips":["1.1.1.1"],"last_seen_unix_ms":1700000000000}
//! {"kind":"ip","client":{"name":"api","namespace":"prod"},"ip":"1.1.1.1"}
//! ```
//!
//! A record without `last_seen_unix_ms` is stamped with the source clock.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, Mutex};

use super::{SourceError, TrafficSource};
use crate::clock::Clock;
use crate::types::{DnsIntent, Intent, IpIntent, ServiceIdentity};

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ObservationRecord {
    Dns {
        client: ServiceIdentity,
        dns_name: String,
        #[serde(default)]
        ips: BTreeSet<IpAddr>,
        last_seen_unix_ms: Option<u64>,
        ttl_unix_ms: Option<u64>,
    },
    Ip {
        client: ServiceIdentity,
        ip: IpAddr,
        last_seen_unix_ms: Option<u64>,
    },
}

fn from_unix_ms(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Decodes one record, stamping it with `now` when it carries no time.
pub fn parse_observation(line: &str, now: SystemTime) -> Result<Intent, SourceError> {
    let intent = match serde_json::from_str::<ObservationRecord>(line)? {
        ObservationRecord::Dns {
            client,
            dns_name,
            ips,
            last_seen_unix_ms,
            ttl_unix_ms,
        } => Intent::Dns(DnsIntent {
            client,
            last_seen: last_seen_unix_ms.map_or(now, from_unix_ms),
            dns_name,
            ips,
            ttl: ttl_unix_ms.map(from_unix_ms),
        }),
        ObservationRecord::Ip {
            client,
            ip,
            last_seen_unix_ms,
        } => Intent::Ip(IpIntent {
            client,
            last_seen: last_seen_unix_ms.map_or(now, from_unix_ms),
            ip,
        }),
    };
    Ok(intent)
}

pub struct JsonLinesSource<R> {
    reader: Mutex<BufReader<R>>,
    clock: Arc<dyn Clock>,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, clock: Arc<dyn Clock>) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            clock,
        }
    }
}

#[async_trait]
impl<R> TrafficSource for JsonLinesSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn capture(&self, intent_tx: mpsc::Sender<Intent>) -> Result<(), SourceError> {
        let mut reader = self.reader.lock().await;
        let mut line = Vec::new();

        info!("Reading observation records...");
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                info!("Observation stream ended");
                return Ok(());
            }

            let decoded = std::str::from_utf8(&line)
                .map_err(SourceError::from)
                .map(str::trim);
            if matches!(&decoded, Ok(record) if record.is_empty()) {
                continue;
            }

            match decoded.and_then(|record| parse_observation(record, self.clock.now())) {
                Ok(intent) => {
                    debug!("Observed intent: {:?}", intent);
                    if intent_tx.send(intent).await.is_err() {
                        return Err(SourceError::ChannelClosed);
                    }
                }
                Err(e) => {
                    warn!("Skipping observation record: {}", e);
                }
            }
        }
    }
}
