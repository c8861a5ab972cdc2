//! Periodic delivery of aggregated intents to registered callbacks.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::holder::IntentsHolder;

/// Drains `holder` every `interval` and hands each non-empty batch to every
/// registered callback, one after another, until `cancel` fires.
///
/// Ticks with no registered callbacks skip the drain entirely, so nothing
/// is rotated or evicted until someone is listening.
pub async fn run_periodic_upload(
    holder: Arc<IntentsHolder>,
    cancel: CancellationToken,
    interval: Duration,
) {
    info!("Starting periodic external traffic intents upload every {:?}", interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Periodic external traffic intents upload stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                let callbacks = holder.callbacks();
                if callbacks.is_empty() {
                    continue;
                }

                let intents = holder.get_new_intents_since_last_get();
                if intents.is_empty() {
                    continue;
                }

                debug!(
                    "Delivering {} external traffic intents to {} callbacks",
                    intents.len(),
                    callbacks.len()
                );
                for callback in &callbacks {
                    callback.notify(&cancel, &intents).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::holder::{ExcludedNamespaces, IntentsCallback, PendingCounts};
    use crate::types::{DnsIntent, IpIntent, ServiceIdentity, TimestampedIntent};

    const INTERVAL: Duration = Duration::from_secs(10);

    fn t0() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn holder() -> Arc<IntentsHolder> {
        Arc::new(IntentsHolder::with_clock(
            Arc::new(ExcludedNamespaces::default()),
            Arc::new(ManualClock::new(t0())),
        ))
    }

    fn dns_intent() -> DnsIntent {
        DnsIntent {
            client: ServiceIdentity::new("api", "prod"),
            last_seen: t0(),
            dns_name: "example.com".into(),
            ips: ["1.1.1.1".parse().unwrap()].into_iter().collect(),
            ttl: None,
        }
    }

    fn ip_intent() -> IpIntent {
        IpIntent {
            client: ServiceIdentity::new("api", "prod"),
            last_seen: t0(),
            ip: "1.1.1.1".parse().unwrap(),
        }
    }

    /// Records batch sizes under a label so call order can be checked.
    struct Recorder {
        label: &'static str,
        calls: Arc<Mutex<Vec<(&'static str, usize)>>>,
    }

    #[async_trait]
    impl IntentsCallback for Recorder {
        async fn notify(&self, _cancel: &CancellationToken, intents: &[TimestampedIntent]) {
            self.calls.lock().push((self.label, intents.len()));
        }
    }

    fn recorder(
        label: &'static str,
        calls: &Arc<Mutex<Vec<(&'static str, usize)>>>,
    ) -> Recorder {
        Recorder {
            label,
            calls: Arc::clone(calls),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_receive_batch_in_registration_order() {
        let holder = holder();
        let calls = Arc::new(Mutex::new(Vec::new()));
        holder.register_notify_intents(recorder("first", &calls));
        holder.register_notify_intents(recorder("second", &calls));
        holder.add_intent(dns_intent());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_periodic_upload(
            Arc::clone(&holder),
            cancel.clone(),
            INTERVAL,
        ));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(*calls.lock(), vec![("first", 1), ("second", 1)]);

        cancel.cancel();
        task.await.expect("dispatcher panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn ip_intent_is_delivered_one_tick_late() {
        let holder = holder();
        let calls = Arc::new(Mutex::new(Vec::new()));
        holder.register_notify_intents(recorder("upload", &calls));
        holder.add_intent(ip_intent());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_periodic_upload(
            Arc::clone(&holder),
            cancel.clone(),
            INTERVAL,
        ));

        // First tick drains an empty immediate map and promotes the IP entry.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(calls.lock().is_empty());
        assert_eq!(holder.pending_counts().immediate, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*calls.lock(), vec![("upload", 1)]);

        cancel.cancel();
        task.await.expect("dispatcher panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_without_callbacks_do_not_drain() {
        let holder = holder();
        holder.add_intent(ip_intent());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_periodic_upload(
            Arc::clone(&holder),
            cancel.clone(),
            INTERVAL,
        ));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(
            holder.pending_counts(),
            PendingCounts {
                immediate: 0,
                delayed: 1
            }
        );

        // Registration after start is picked up by the next tick.
        let calls = Arc::new(Mutex::new(Vec::new()));
        holder.register_notify_intents(recorder("late", &calls));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(*calls.lock(), vec![("late", 1)]);

        cancel.cancel();
        task.await.expect("dispatcher panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_delivery() {
        let holder = holder();
        let calls = Arc::new(Mutex::new(Vec::new()));
        holder.register_notify_intents(recorder("upload", &calls));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_periodic_upload(
            Arc::clone(&holder),
            cancel.clone(),
            INTERVAL,
        ));

        cancel.cancel();
        task.await.expect("dispatcher panicked");

        holder.add_intent(dns_intent());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(calls.lock().is_empty());
        assert_eq!(holder.pending_counts().immediate, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_a_due_tick() {
        let holder = holder();
        let calls = Arc::new(Mutex::new(Vec::new()));
        holder.register_notify_intents(recorder("upload", &calls));
        holder.add_intent(dns_intent());
        holder.add_intent(ip_intent());

        let cancel = CancellationToken::new();
        let upload = run_periodic_upload(Arc::clone(&holder), cancel.clone(), INTERVAL);
        tokio::pin!(upload);

        // Poll once so the tick timer is armed, then stop polling.
        let pending = tokio::time::timeout(Duration::from_secs(5), upload.as_mut()).await;
        assert!(pending.is_err());

        // The tick is now due; cancel before the loop sees it.
        tokio::time::advance(Duration::from_secs(5)).await;
        cancel.cancel();
        upload.await;

        assert!(calls.lock().is_empty());
        assert_eq!(
            holder.pending_counts(),
            PendingCounts {
                immediate: 1,
                delayed: 1
            }
        );
    }
}
