//! watchd entry point: loads the JSON config, builds the global store and
//! notification dispatcher, spawns one watcher task per enabled watch spec,
//! and drives the single MQTT event loop that routes delivered publishes to
//! their owning watcher.
//!
//! Safety/lifecycle properties carried from the config format:
//! - SIGINT/SIGTERM both trigger the same graceful shutdown path.
//! - Subscriptions are re-issued on every ConnAck, since a broker can drop a
//!   session across a reconnect even with persistent sessions requested.
//! - A fixed 2.5s backoff follows every transport error before the next
//!   `eventloop.poll()` — no cap, no jitter, per the supervisor's state
//!   machine.

mod config;
mod error;
mod expr;
mod mqtt;
mod notify;
mod store;
mod watcher;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use notify::NotificationDispatcher;
use store::GlobalStore;
use watcher::Watcher;

/// Fixed MQTT reconnect backoff (spec §4.6 supervisor state machine).
const MQTT_RECONNECT_BACKOFF: Duration = Duration::from_millis(2500);

/// One enabled watch's routing entry: the MQTT topic filter it subscribed
/// with, and the channel into its own serial message-processing task.
struct WatcherRoute {
    id: String,
    topic_filter: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
    let _log_guard = init_logging(&log_level);

    let config_path = config_path();
    let config = match config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %config_path, "{err:#}");
            std::process::exit(1);
        }
    };

    let store = GlobalStore::new();
    let dispatcher = Arc::new(NotificationDispatcher::new(&config));

    let mut routes: Vec<WatcherRoute> = Vec::new();
    for spec in config.watch_list.as_deref().unwrap_or_default() {
        if !spec.enabled {
            continue;
        }
        let id = spec.id.clone();
        let topic_filter = spec.topic.clone();
        let watcher = Watcher::new(spec.clone(), store.clone(), dispatcher.clone());
        let tx = watcher.spawn();
        routes.push(WatcherRoute { id, topic_filter, tx });
    }
    info!(watchers = routes.len(), "watchers started");

    let (client, mut eventloop) = connect_mqtt(&config.mqtt)?;
    for route in &routes {
        subscribe(&client, &route.topic_filter).await;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let shutdown_signal: &str = loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        for route in &routes {
                            subscribe(&client, &route.topic_filter).await;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        route_publish(&routes, &publish.topic, publish.payload.as_ref());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "mqtt transport error — reconnecting");
                        tokio::time::sleep(MQTT_RECONNECT_BACKOFF).await;
                    }
                }
            }
            _ = &mut ctrl_c => break "SIGINT",
            _ = sigterm.recv() => break "SIGTERM",
        }
    };

    warn!(signal = shutdown_signal, "shutting down");
    Ok(())
}

/// Find the first route (declaration order) whose subscribed filter matches
/// the delivered topic, and hand it the raw payload bytes.
fn route_publish(routes: &[WatcherRoute], topic: &str, payload: &[u8]) {
    let pairs = routes.iter().map(|r| (r.id.as_str(), r.topic_filter.as_str()));
    match mqtt::find_matching_watcher(pairs, topic) {
        Some(id) => {
            let route = routes.iter().find(|r| r.id == id).expect("matched id came from routes");
            debug!(watcher = %route.id, topic, "routed delivered message");
            let _ = route.tx.send(payload.to_vec());
        }
        None => {
            warn!(topic, "no watcher subscribed to delivered topic");
        }
    }
}

async fn subscribe(client: &AsyncClient, topic_filter: &str) {
    if let Err(err) = client.subscribe(topic_filter, QoS::AtMostOnce).await {
        error!(topic = topic_filter, %err, "mqtt subscribe failed");
    }
}

fn connect_mqtt(mqtt_cfg: &config::MqttConfig) -> Result<(AsyncClient, rumqttc::EventLoop)> {
    let client_id = "watchd";
    let mut options = MqttOptions::new(client_id, &mqtt_cfg.host, mqtt_cfg.port);
    options.set_keep_alive(Duration::from_secs(30));

    if let (Some(user), Some(pass)) = (&mqtt_cfg.username, &mqtt_cfg.password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    Ok(AsyncClient::new(options, 64))
}

fn config_path() -> String {
    env::var("CONFIG_FILE").unwrap_or_else(|_| {
        env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("config.json")))
            .unwrap_or_else(|| PathBuf::from("config.json"))
            .to_string_lossy()
            .into_owned()
    })
}

/// Build the `tracing` subscriber: `LOG_LEVEL` drives the default filter
/// (overridden by `RUST_LOG`/`EnvFilter`'s own env var if set), and output
/// goes to `LOG_PATH`/log.txt when `LOG_PATH` is set, stderr otherwise. The
/// returned guard must be kept alive for the process lifetime — dropping it
/// stops the non-blocking writer from flushing.
fn init_logging(default_level: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level.to_string()));

    match env::var("LOG_PATH") {
        Ok(dir) => {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                eprintln!("failed to create LOG_PATH '{dir}': {err:#}");
            }
            let appender = tracing_appender::rolling::never(&dir, "log.txt");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
