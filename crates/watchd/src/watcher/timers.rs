//! The Stateful Timer Core: per-bucket warning-after-threshold and
//! reset-to-default timers, engaged only on the legacy stateful path.
//! Messages and values are snapshotted into the spawned task's closure
//! at arm time, so firing never re-reads payload state.

use crate::config::Severity;
use crate::notify::{NotificationDispatcher, SendFilter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

/// Runtime record for one stateful bucket.
#[derive(Default)]
pub struct EventStatus {
    pub last_value: String,
    pub last_handled_value: Option<String>,
    pub warning_timer: Option<JoinHandle<()>>,
    pub reset_timer: Option<JoinHandle<()>>,
    pub warning_fired: bool,
}

pub type Buckets = HashMap<String, EventStatus>;

/// Abort and drop a previously armed timer, if any.
fn clear(handle: &mut Option<JoinHandle<()>>) {
    if let Some(h) = handle.take() {
        h.abort();
    }
}

pub fn clear_warning(bucket: &mut EventStatus) {
    clear(&mut bucket.warning_timer);
    bucket.warning_fired = false;
}

pub fn clear_reset(bucket: &mut EventStatus) {
    clear(&mut bucket.reset_timer);
}

/// Arm a warning timer for `threshold_sec`. At fire time: if the warning
/// hasn't already fired and the bucket's `lastValue` still equals the
/// value observed at arm time, send `warning_message` at `warning_severity`;
/// otherwise log that the warning is no longer valid. Either way mark the
/// warning fired.
pub fn spawn_warning(
    buckets: Arc<Mutex<Buckets>>,
    bucket_key: String,
    threshold_sec: u64,
    warning_value: String,
    warning_message: String,
    warning_severity: Severity,
    dispatcher: Arc<NotificationDispatcher>,
    list_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(threshold_sec)).await;

        let still_valid = {
            let mut guard = buckets.lock().await;
            let Some(bucket) = guard.get_mut(&bucket_key) else {
                return;
            };
            let valid = !bucket.warning_fired && bucket.last_value == warning_value;
            bucket.warning_fired = true;
            valid
        };

        if still_valid {
            dispatcher.send_notifications(&list_id, &warning_message, SendFilter::Severity(warning_severity));
        } else {
            info!(bucket_key, "warning no longer valid");
        }
    })
}

/// Arm a reset timer for `reset_sec`. At fire time, set the bucket's
/// `lastValue` back to the event's stringified `default`.
pub fn spawn_reset(
    buckets: Arc<Mutex<Buckets>>,
    bucket_key: String,
    reset_sec: u64,
    default_value: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(reset_sec)).await;
        let mut guard = buckets.lock().await;
        if let Some(bucket) = guard.get_mut(&bucket_key) {
            bucket.last_value = default_value;
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MailConfig, MessageServiceConfig, MqttConfig};

    fn dispatcher() -> Arc<NotificationDispatcher> {
        Arc::new(NotificationDispatcher::new(&Config {
            mqtt: MqttConfig { host: "localhost".into(), port: 1883, username: None, password: None },
            message_service: MessageServiceConfig {
                mail: MailConfig {
                    host: "smtp.local".into(),
                    port: 25,
                    from: "a@b.c".into(),
                    ignore_tls: false,
                    require_tls: false,
                    name: None,
                    tls: None,
                    auth: None,
                },
                sms: None,
            },
            watch_list: Some(vec![]),
            notification_list: Some(vec![]),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn reset_timer_restores_default_after_duration() {
        let buckets: Arc<Mutex<Buckets>> = Arc::new(Mutex::new(HashMap::new()));
        buckets.lock().await.insert(
            "k".to_string(),
            EventStatus { last_value: "5".to_string(), ..Default::default() },
        );

        let handle = spawn_reset(buckets.clone(), "k".to_string(), 10, "0".to_string());
        tokio::time::advance(Duration::from_secs(11)).await;
        handle.await.unwrap();

        assert_eq!(buckets.lock().await.get("k").unwrap().last_value, "0");
    }

    #[tokio::test(start_paused = true)]
    async fn warning_timer_fires_when_value_still_matches() {
        let buckets: Arc<Mutex<Buckets>> = Arc::new(Mutex::new(HashMap::new()));
        buckets.lock().await.insert(
            "k".to_string(),
            EventStatus { last_value: "false".to_string(), ..Default::default() },
        );

        let handle = spawn_warning(
            buckets.clone(),
            "k".to_string(),
            300,
            "false".to_string(),
            "Open >5m".to_string(),
            Severity::Warning,
            dispatcher(),
            "door".to_string(),
        );
        tokio::time::advance(Duration::from_secs(301)).await;
        handle.await.unwrap();

        assert!(buckets.lock().await.get("k").unwrap().warning_fired);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_timer_skips_send_when_value_changed() {
        let buckets: Arc<Mutex<Buckets>> = Arc::new(Mutex::new(HashMap::new()));
        buckets.lock().await.insert(
            "k".to_string(),
            EventStatus { last_value: "true".to_string(), ..Default::default() },
        );

        let handle = spawn_warning(
            buckets.clone(),
            "k".to_string(),
            300,
            "false".to_string(),
            "Open >5m".to_string(),
            Severity::Warning,
            dispatcher(),
            "door".to_string(),
        );
        tokio::time::advance(Duration::from_secs(301)).await;
        handle.await.unwrap();

        assert!(buckets.lock().await.get("k").unwrap().warning_fired);
    }

    #[tokio::test]
    async fn clear_warning_aborts_and_resets_fired_flag() {
        let mut bucket = EventStatus { warning_fired: true, ..Default::default() };
        bucket.warning_timer = Some(tokio::spawn(async { tokio::time::sleep(Duration::from_secs(3600)).await }));
        clear_warning(&mut bucket);
        assert!(!bucket.warning_fired);
        assert!(bucket.warning_timer.is_none());
    }
}
