//! WiFi panel simulation driving a notification registry.
//!
//! Usage: `shellhooks-demo [config.toml]`
//!
//! Builds three panel widgets on top of a watch-backed network source, fires a
//! burst of upstream changes, silently releases one widget and lets the
//! registry heal. Diagnostic output goes to stderr; the final registry stats
//! are printed to stdout as JSON.

use anyhow::Context;
use shellhooks::network::{AccessPoint, Connectivity, NetworkSnapshot, WifiState};
use shellhooks::{HooksConfig, NotificationRegistry, TokioTimers, WatchSource, WidgetHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shellhooks=info")),
        )
        .init();

    let config = load_config()?;
    tracing::info!(?config, "shellhooks-demo starting");

    let source = Arc::new(WatchSource::new(initial_snapshot())?);
    let timers = Arc::new(TokioTimers::new()?);
    let registry = NotificationRegistry::new(
        Arc::clone(&source),
        timers,
        config.registry.clone(),
    )?;

    let ssid_label = WidgetHandle::attached("current-network", "wifi-panel");
    let status_label = WidgetHandle::attached("status", "wifi-panel");
    let ap_list = WidgetHandle::attached("access-points", "wifi-panel");

    registry.register(ssid_label.clone(), |snapshot: &NetworkSnapshot| {
        let ssid = snapshot.wifi.ssid.as_deref().unwrap_or("not connected");
        tracing::info!(widget = "current-network", ssid, "label updated");
        Ok(())
    })?;
    registry.register(status_label.clone(), |snapshot: &NetworkSnapshot| {
        let wifi = &snapshot.wifi;
        let text = if wifi.requires_credentials() {
            "password required"
        } else if wifi.state.is_connecting() {
            "connecting"
        } else {
            wifi.state.as_str()
        };
        tracing::info!(widget = "status", status = text, connectivity = ?snapshot.connectivity, "label updated");
        Ok(())
    })?;
    let list_index = registry.register(ap_list.clone(), |snapshot: &NetworkSnapshot| {
        let ssids: Vec<String> = snapshot
            .wifi
            .strongest_by_ssid()
            .into_iter()
            .map(|ap| format!("{} ({}%)", ap.ssid, ap.strength))
            .collect();
        tracing::info!(widget = "access-points", networks = ?ssids, "list rebuilt");
        Ok(())
    })?;
    tracing::info!(index = %list_index, "access point list registered");

    let settle = config.registry.debounce() + config.registry.initial_delivery();
    tokio::time::sleep(settle).await;

    // A scan completing: several property changes land within a few milliseconds.
    let gap = Duration::from_millis(config.demo.burst_gap_ms);
    for step in 0..config.demo.burst_len {
        source.update(|snapshot| {
            snapshot.wifi.strength = snapshot.wifi.strength.saturating_sub(3);
            snapshot.wifi.access_points.push(AccessPoint {
                ssid: format!("neighbour-{step}"),
                bssid: format!("02:00:00:00:00:{step:02x}"),
                strength: 20 + (step % 60) as u8,
                frequency: 5_180,
                active: false,
                secured: true,
            });
        });
        tokio::time::sleep(gap).await;
    }
    tokio::time::sleep(settle).await;

    // The display layer drops the status label without telling anyone.
    status_label.release_silently();
    source.update(|snapshot| {
        snapshot.wifi.state = WifiState::NeedAuth;
        snapshot.connectivity = Connectivity::Limited;
    });
    tokio::time::sleep(settle).await;

    // A proper teardown of the list widget fires its destroy hook.
    ap_list.destroy();

    let report = registry.compact_now();
    tracing::info!(
        reclaimed = report.reclaimed,
        trimmed = report.trimmed,
        live = report.live,
        "compaction finished"
    );

    let stats = registry.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "live": stats.live,
            "tombstoned": stats.tombstoned,
            "vacant": stats.vacant,
            "capacity": stats.capacity,
            "sweeps": stats.sweeps,
            "deliveries": stats.deliveries,
            "callback_failures": stats.callback_failures,
            "compactions": stats.compactions,
            "reclaimed": stats.reclaimed,
        }))
        .context("failed to serialize registry stats")?
    );

    registry.destroy();
    ssid_label.destroy();
    tracing::info!("shellhooks-demo shut down cleanly");
    Ok(())
}

fn load_config() -> anyhow::Result<HooksConfig> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(HooksConfig::default_config_path);
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(HooksConfig::default());
    }
    HooksConfig::from_file(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

fn initial_snapshot() -> NetworkSnapshot {
    let mut snapshot = NetworkSnapshot::default();
    snapshot.wifi.enabled = true;
    snapshot.wifi.state = WifiState::Activated;
    snapshot.wifi.ssid = Some("home".to_owned());
    snapshot.wifi.strength = 72;
    snapshot.wifi.access_points = vec![AccessPoint {
        ssid: "home".to_owned(),
        bssid: "02:00:00:00:01:01".to_owned(),
        strength: 72,
        frequency: 2_437,
        active: true,
        secured: true,
    }];
    snapshot.connectivity = Connectivity::Full;
    snapshot
}
