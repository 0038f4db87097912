//! The per-topic Watcher: decodes delivered payloads, walks its event/
//! condition list, and drives the gates, suppression, and timer machinery.
//! One Watcher owns one MQTT topic and one rule list; it runs as its own
//! task so messages for different watchers process concurrently while
//! each watcher's own messages stay strictly in delivery order.

pub mod suppression;
pub mod timers;

use crate::config::{ConditionSpec, DependencySpec, Edge, EventSpec, Method, Severity, WatchSpec};
use crate::error::WatchError;
use crate::expr::{self, typed_value_match};
use crate::notify::{NotificationDispatcher, SendFilter};
use crate::store::GlobalStore;
use chrono::Timelike;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use suppression::ConditionState;
use timers::{Buckets, EventStatus};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub struct Watcher {
    pub id: String,
    spec: WatchSpec,
    store: Arc<GlobalStore>,
    dispatcher: Arc<NotificationDispatcher>,
    buckets: Arc<Mutex<Buckets>>,
    conditions: Arc<Mutex<HashMap<String, ConditionState>>>,
}

impl Watcher {
    pub fn new(spec: WatchSpec, store: Arc<GlobalStore>, dispatcher: Arc<NotificationDispatcher>) -> Arc<Self> {
        let mut buckets = Buckets::new();
        for event in &spec.events {
            // Legacy single-bucket events (neither dynamic nor stateKey) get
            // their bucket at startup rather than on first message.
            if !event.dynamic && event.state_key.is_none() {
                buckets.insert(
                    event.subject.clone(),
                    EventStatus { last_value: stringify_default(&event.default), ..Default::default() },
                );
            }
        }

        Arc::new(Self {
            id: spec.id.clone(),
            spec,
            store,
            dispatcher,
            buckets: Arc::new(Mutex::new(buckets)),
            conditions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Spawn this watcher's own message-processing task, draining an
    /// unbounded queue serially so messages for this watcher are handled in
    /// delivery order even while other watchers process concurrently.
    pub fn spawn(self: Arc<Self>) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let watcher = self.clone();
        tokio::spawn(async move {
            watcher.seed_eager_buckets().await;
            while let Some(bytes) = rx.recv().await {
                watcher.handle_message(&bytes).await;
            }
        });
        tx
    }

    /// Seed the Global Store with the raw `default` of every eagerly-created
    /// bucket (spec §3 invariant 6) — the buckets themselves are allocated
    /// synchronously in `new`, but the store write needs an async context.
    /// Runs once, before this watcher's task starts draining messages, so a
    /// dependent watcher can observe these defaults before this watcher has
    /// published anything of its own.
    async fn seed_eager_buckets(&self) {
        for event in &self.spec.events {
            if !event.dynamic && event.state_key.is_none() {
                self.store.update(&self.id, &event.subject, event.default.clone()).await;
            }
        }
    }

    /// Entry point for one delivered `(topic, payload-bytes)` pair (spec
    /// §4.2 step 1 onward).
    pub async fn handle_message(&self, payload_bytes: &[u8]) {
        let payload: Value = match serde_json::from_slice(payload_bytes) {
            Ok(v) => v,
            Err(err) => {
                debug!(watcher = %self.id, %err, "payload is not valid JSON, dropping");
                return;
            }
        };

        for event in &self.spec.events {
            self.process_event(event, &payload).await;
        }
    }

    async fn process_event(&self, event: &EventSpec, payload: &Value) {
        let Some(extracted) = dotted_lookup(payload, &event.subject) else {
            return;
        };

        if !active_hours_gate(&event.active_hours) {
            return;
        }
        if !self.dependencies_gate(&event.dependencies).await {
            return;
        }

        let current_value_string = expr::stringify_for_template(Some(&extracted));

        let bucket_key = if !event.dynamic {
            let key = self.bucket_key(event, payload).await;
            self.ensure_bucket(&key, event).await;
            self.store.update(&self.id, &event.subject, extracted.clone()).await;
            Some(key)
        } else {
            None
        };

        for (condition_index, condition) in event.conditions.iter().enumerate() {
            self.process_condition(
                event,
                condition,
                condition_index,
                payload,
                &extracted,
                &current_value_string,
                bucket_key.as_deref(),
            )
            .await;
        }

        if let Some(bucket_key) = &bucket_key {
            let mut guard = self.buckets.lock().await;
            if let Some(bucket) = guard.get_mut(bucket_key) {
                bucket.last_value = current_value_string;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_condition(
        &self,
        event: &EventSpec,
        condition: &ConditionSpec,
        condition_index: usize,
        payload: &Value,
        extracted: &Value,
        current_value_string: &str,
        bucket_key: Option<&str>,
    ) {
        let matched = self.condition_matches(condition, extracted, payload).await;
        let source_key = self.source_key(condition, event, payload).await;
        let suppression_key = suppression::suppression_key(&self.id, &event.subject, condition_index, &source_key);

        if !matched {
            if condition.edge == Edge::Rising {
                let mut guard = self.conditions.lock().await;
                let state = guard.entry(suppression_key).or_default();
                suppression::mark_not_matched(state);
            }
            return;
        }

        if let Some(log_template) = &condition.log {
            let log_text = expr::interpolate(log_template, Some(extracted), payload, &self.store).await;
            info!(watcher = %self.id, subject = %event.subject, "{log_text}");
        }

        let now = now_epoch_sec();
        let allow = {
            let mut guard = self.conditions.lock().await;
            let state = guard.entry(suppression_key).or_default();
            suppression::should_notify(state, condition.edge, condition.cooldown_sec, now)
        };
        if !allow {
            return;
        }

        let message_text = match &condition.message {
            Some(template) => expr::interpolate(template, Some(extracted), payload, &self.store).await,
            None => String::new(),
        };

        if event.dynamic {
            if condition.message.is_some() {
                self.dispatcher
                    .send_notifications(&self.id, &message_text, SendFilter::Severity(condition.severity));
            }
            return;
        }

        let Some(bucket_key) = bucket_key else {
            return;
        };

        // Two mutually exclusive suppression regimes: legacy duplicate
        // suppression only applies when the user hasn't opted into
        // edge/cooldown controls.
        let legacy = condition.edge == Edge::Level && condition.cooldown_sec.unwrap_or(0) == 0;

        if legacy {
            let should_send = {
                let mut guard = self.buckets.lock().await;
                let bucket = guard.get_mut(bucket_key).expect("bucket created before conditions run");
                let should_send = bucket.last_value != current_value_string;
                bucket.last_handled_value = Some(current_value_string.to_string());
                should_send
            };
            if should_send && condition.message.is_some() {
                self.dispatcher
                    .send_notifications(&self.id, &message_text, SendFilter::Severity(condition.severity));
            }
            self.rearm_timers(bucket_key, event, condition, current_value_string, payload, extracted)
                .await;
        } else if condition.message.is_some() {
            self.dispatcher
                .send_notifications(&self.id, &message_text, SendFilter::Severity(condition.severity));
        }
    }

    async fn condition_matches(&self, condition: &ConditionSpec, extracted: &Value, payload: &Value) -> bool {
        match &condition.condition {
            Some(expr_text) if !expr_text.is_empty() => {
                expr::eval_expression(expr_text, Some(extracted), payload, &self.store).await
            }
            _ => typed_value_match(condition.value.as_ref(), extracted),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn rearm_timers(
        &self,
        bucket_key: &str,
        event: &EventSpec,
        condition: &ConditionSpec,
        current_value_string: &str,
        payload: &Value,
        extracted: &Value,
    ) {
        let needs_warning = {
            let mut guard = self.buckets.lock().await;
            let bucket = guard.get_mut(bucket_key).expect("bucket exists");
            match condition.warning_threshold {
                Some(threshold) if threshold > 0 => bucket.warning_timer.is_none(),
                _ => {
                    timers::clear_warning(bucket);
                    false
                }
            }
        };

        if needs_warning {
            let threshold = condition.warning_threshold.expect("checked above");
            let warning_message = match &condition.warning_message {
                Some(template) => expr::interpolate(template, Some(extracted), payload, &self.store).await,
                None => String::new(),
            };
            let handle = timers::spawn_warning(
                self.buckets.clone(),
                bucket_key.to_string(),
                threshold,
                current_value_string.to_string(),
                warning_message,
                condition.warning_severity,
                self.dispatcher.clone(),
                self.id.clone(),
            );
            let mut guard = self.buckets.lock().await;
            if let Some(bucket) = guard.get_mut(bucket_key) {
                bucket.warning_timer = Some(handle);
            }
        }

        {
            let mut guard = self.buckets.lock().await;
            if let Some(bucket) = guard.get_mut(bucket_key) {
                timers::clear_reset(bucket);
            }
        }
        if let Some(reset_sec) = condition.reset {
            if reset_sec > 0 {
                let default_value = stringify_default(&event.default);
                let handle = timers::spawn_reset(self.buckets.clone(), bucket_key.to_string(), reset_sec, default_value);
                let mut guard = self.buckets.lock().await;
                if let Some(bucket) = guard.get_mut(bucket_key) {
                    bucket.reset_timer = Some(handle);
                }
            }
        }
    }

    /// Create `key`'s bucket on first observation, seeded from `event`'s raw
    /// `default`. Per spec §3 invariant 6, the Global Store is seeded with
    /// that same raw `default` at bucket creation — so a dependent watcher's
    /// gate or a `${store.w.s}` read sees a value even before this bucket's
    /// first matching payload arrives.
    async fn ensure_bucket(&self, key: &str, event: &EventSpec) {
        let is_new = {
            let mut guard = self.buckets.lock().await;
            match guard.entry(key.to_string()) {
                std::collections::hash_map::Entry::Occupied(_) => false,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(EventStatus {
                        last_value: stringify_default(&event.default),
                        ..Default::default()
                    });
                    true
                }
            }
        };
        if is_new {
            self.store.update(&self.id, &event.subject, event.default.clone()).await;
        }
    }

    async fn bucket_key(&self, event: &EventSpec, payload: &Value) -> String {
        match &event.state_key {
            Some(template) => {
                let rendered = expr::interpolate(template, None, payload, &self.store).await;
                format!("{rendered}::{}", event.subject)
            }
            None => event.subject.clone(),
        }
    }

    /// Source key for edge/cooldown partitioning: condition `key`, else
    /// event `stateKey`, else `tags.host:tags.path` if both exist, else
    /// the event subject.
    async fn source_key(&self, condition: &ConditionSpec, event: &EventSpec, payload: &Value) -> String {
        if let Some(template) = &condition.key {
            return expr::interpolate(template, None, payload, &self.store).await;
        }
        if let Some(template) = &event.state_key {
            return expr::interpolate(template, None, payload, &self.store).await;
        }
        if let (Some(host), Some(path)) = (
            payload.get("tags").and_then(|t| t.get("host")).and_then(|v| v.as_str()),
            payload.get("tags").and_then(|t| t.get("path")).and_then(|v| v.as_str()),
        ) {
            return format!("{host}:{path}");
        }
        event.subject.clone()
    }

    async fn dependencies_gate(&self, dependencies: &Option<Vec<DependencySpec>>) -> bool {
        let Some(dependencies) = dependencies else {
            return true;
        };
        for dep in dependencies {
            match parse_dependency_path(&dep.path) {
                Some((watch_id, subject)) => {
                    let stored = self.store.get(watch_id, subject).await;
                    let satisfied = expr::normalize_for_equality(stored.as_ref())
                        == expr::normalize_for_equality(Some(&dep.state));
                    if !satisfied {
                        return false;
                    }
                }
                None => {
                    let err = WatchError::DependencyPath(dep.path.clone());
                    warn!(watcher = %self.id, %err, "dependency gated out");
                    return false;
                }
            }
        }
        true
    }
}

/// A dependency path must be exactly `<watchId>.<subject>`. Subjects that
/// are themselves dotted paths are not addressable from a dependency —
/// a three-or-more-segment path is rejected as malformed rather than
/// guessed at.
fn parse_dependency_path(path: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = path.split('.').collect();
    match parts.as_slice() {
        [watch_id, subject] if !watch_id.is_empty() && !subject.is_empty() => Some((watch_id, subject)),
        _ => None,
    }
}

fn stringify_default(default: &Value) -> String {
    expr::stringify_for_template(Some(default))
}

fn now_epoch_sec() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn dotted_lookup(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

/// Active-hours gate: each range is `HH:MM-HH:MM` local time; `from <= to`
/// is an inclusive same-day range, `from > to` wraps past midnight.
fn active_hours_gate(ranges: &Option<Vec<String>>) -> bool {
    let Some(ranges) = ranges else {
        return true;
    };
    if ranges.is_empty() {
        return true;
    }
    let parsed: Vec<(u32, u32)> = ranges.iter().filter_map(|r| parse_range(r)).collect();
    in_active_hours(&parsed, current_local_minutes())
}

/// The pure predicate behind the gate, exposed for property testing.
fn in_active_hours(ranges: &[(u32, u32)], now_min: u32) -> bool {
    ranges.iter().any(|&(from, to)| {
        if from <= to {
            now_min >= from && now_min <= to
        } else {
            now_min >= from || now_min <= to
        }
    })
}

fn parse_range(range: &str) -> Option<(u32, u32)> {
    let (from, to) = range.split_once('-')?;
    Some((parse_hhmm(from)?, parse_hhmm(to)?))
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    Some(h * 60 + m)
}

fn current_local_minutes() -> u32 {
    let now = chrono::Local::now();
    now.hour() * 60 + now.minute()
}

/// The set of methods a `sendNotifications` call may filter by, per spec
/// §4.6 — re-exported for callers building method-based filters.
pub type MethodSet = HashSet<Method>;

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MailConfig, MessageServiceConfig, MqttConfig};
    use serde_json::json;

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

    fn door_spec() -> WatchSpec {
        WatchSpec {
            id: "door".to_string(),
            topic: "zigbee2mqtt/DoorSensor".to_string(),
            enabled: true,
            dynamic: false,
            events: vec![EventSpec {
                subject: "contact".to_string(),
                default: json!(true),
                active_hours: None,
                dependencies: None,
                dynamic: false,
                state_key: None,
                conditions: vec![ConditionSpec {
                    value: Some(json!(false)),
                    condition: None,
                    log: Some("contact is now ${value}".to_string()),
                    message: Some("Door open!".to_string()),
                    severity: Severity::Warning,
                    edge: Edge::Level,
                    cooldown_sec: None,
                    key: None,
                    warning_threshold: Some(300),
                    warning_message: Some("Open >5m".to_string()),
                    warning_severity: Severity::Warning,
                    reset: None,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn parse_dependency_path_rejects_three_segments() {
        assert!(parse_dependency_path("a.b.c").is_none());
        assert_eq!(parse_dependency_path("lock.contact"), Some(("lock", "contact")));
    }

    #[test]
    fn active_hours_property_matches_formula() {
        // fromMin <= toMin: inclusive same-day range.
        assert!(in_active_hours(&[(60, 120)], 90));
        assert!(!in_active_hours(&[(60, 120)], 30));
        // fromMin > toMin: wraps past midnight.
        assert!(in_active_hours(&[(22 * 60, 6 * 60)], 23 * 60));
        assert!(in_active_hours(&[(22 * 60, 6 * 60)], 1 * 60));
        assert!(!in_active_hours(&[(22 * 60, 6 * 60)], 12 * 60));
    }

    #[test]
    fn empty_active_hours_always_passes() {
        assert!(active_hours_gate(&None));
        assert!(active_hours_gate(&Some(vec![])));
    }

    #[tokio::test]
    async fn scenario_s1_legacy_dedup_then_bucket_created_at_startup() {
        let watcher = Watcher::new(door_spec(), GlobalStore::new(), dispatcher());
        // Non-dynamic event without stateKey allocates its bucket eagerly.
        assert!(watcher.buckets.lock().await.contains_key("contact"));

        watcher.handle_message(br#"{"contact":false}"#).await;
        {
            let buckets = watcher.buckets.lock().await;
            assert_eq!(buckets.get("contact").unwrap().last_value, "false");
        }

        // Same payload again: legacy duplicate suppression means no second send,
        // but the bucket's lastValue stays the same and no panic occurs.
        watcher.handle_message(br#"{"contact":false}"#).await;
        let buckets = watcher.buckets.lock().await;
        assert_eq!(buckets.get("contact").unwrap().last_value, "false");
    }

    #[tokio::test]
    async fn seed_eager_buckets_writes_raw_default_to_the_store() {
        let store = GlobalStore::new();
        let watcher = Watcher::new(door_spec(), store.clone(), dispatcher());
        assert_eq!(store.get("door", "contact").await, None);

        watcher.seed_eager_buckets().await;
        assert_eq!(store.get("door", "contact").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn lazily_created_bucket_seeds_the_store_with_raw_default() {
        let mut spec = door_spec();
        spec.events[0].state_key = Some("fixed".to_string());
        let store = GlobalStore::new();
        let watcher = Watcher::new(spec, store.clone(), dispatcher());
        // stateKey set: no eager bucket, so nothing in the store yet.
        assert!(watcher.buckets.lock().await.is_empty());
        assert_eq!(store.get("door", "contact").await, None);

        watcher.handle_message(br#"{"contact":false}"#).await;
        // The bucket's creation write seeds the raw `default` (true), and the
        // subsequent per-message write then overwrites it with the extracted
        // value (false) — both paths reach the store.
        assert_eq!(store.get("door", "contact").await, Some(json!(false)));
    }

    #[tokio::test]
    async fn dynamic_event_never_allocates_a_bucket_or_writes_the_store() {
        let mut spec = door_spec();
        spec.events[0].dynamic = true;
        let store = GlobalStore::new();
        let watcher = Watcher::new(spec, store.clone(), dispatcher());
        assert!(watcher.buckets.lock().await.is_empty());

        watcher.handle_message(br#"{"contact":false}"#).await;
        assert!(watcher.buckets.lock().await.is_empty());
        assert_eq!(store.get("door", "contact").await, None);
    }

    #[tokio::test]
    async fn scenario_s3_cross_watcher_dependency_gates_the_event() {
        let store = GlobalStore::new();
        let mut door = door_spec();
        door.events[0].dependencies = Some(vec![DependencySpec { path: "lock.contact".to_string(), state: json!(true) }]);
        let watcher = Watcher::new(door, store.clone(), dispatcher());

        // No dependency value yet: gated out, bucket lastValue unchanged.
        watcher.handle_message(br#"{"contact":false}"#).await;
        assert_eq!(watcher.buckets.lock().await.get("contact").unwrap().last_value, "true");

        store.update("lock", "contact", json!(true)).await;
        watcher.handle_message(br#"{"contact":false}"#).await;
        assert_eq!(watcher.buckets.lock().await.get("contact").unwrap().last_value, "false");

        store.update("lock", "contact", json!(false)).await;
        watcher.handle_message(br#"{"contact":true}"#).await;
        // Gated out again: lastValue stays at the previous observation.
        assert_eq!(watcher.buckets.lock().await.get("contact").unwrap().last_value, "false");
    }

    #[tokio::test]
    async fn scenario_s4_malformed_dependency_path_gates_the_event() {
        let store = GlobalStore::new();
        let mut door = door_spec();
        door.events[0].dependencies = Some(vec![DependencySpec { path: "a.b.c".to_string(), state: json!(true) }]);
        let watcher = Watcher::new(door, store.clone(), dispatcher());

        watcher.handle_message(br#"{"contact":false}"#).await;
        assert_eq!(watcher.buckets.lock().await.get("contact").unwrap().last_value, "true");
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_s5_reset_timer_clears_last_value() {
        let spec = WatchSpec {
            id: "sensor".to_string(),
            topic: "t".to_string(),
            enabled: true,
            dynamic: false,
            events: vec![EventSpec {
                subject: "v".to_string(),
                default: json!(0),
                active_hours: None,
                dependencies: None,
                dynamic: false,
                state_key: None,
                conditions: vec![ConditionSpec {
                    value: Some(json!(5)),
                    condition: None,
                    log: None,
                    message: Some("five".to_string()),
                    severity: Severity::Info,
                    edge: Edge::Level,
                    cooldown_sec: None,
                    key: None,
                    warning_threshold: None,
                    warning_message: None,
                    warning_severity: Severity::Warning,
                    reset: Some(10),
                }],
            }],
        };
        let watcher = Watcher::new(spec, GlobalStore::new(), dispatcher());

        watcher.handle_message(br#"{"v":5}"#).await;
        assert_eq!(watcher.buckets.lock().await.get("v").unwrap().last_value, "5");

        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(watcher.buckets.lock().await.get("v").unwrap().last_value, "0");
    }

    #[tokio::test]
    async fn malformed_json_payload_is_dropped_silently() {
        let watcher = Watcher::new(door_spec(), GlobalStore::new(), dispatcher());
        watcher.handle_message(b"not json").await;
        assert_eq!(watcher.buckets.lock().await.get("contact").unwrap().last_value, "true");
    }

    #[tokio::test]
    async fn missing_subject_skips_the_event() {
        let watcher = Watcher::new(door_spec(), GlobalStore::new(), dispatcher());
        watcher.handle_message(br#"{"other":1}"#).await;
        assert_eq!(watcher.buckets.lock().await.get("contact").unwrap().last_value, "true");
    }
}
