//! Network state snapshot delivered to the WiFi panel's subscribers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Full upstream network state at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSnapshot {
    /// Wireless device state.
    pub wifi: WifiSnapshot,
    /// Overall internet reachability.
    pub connectivity: Connectivity,
}

/// Wireless device state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiSnapshot {
    /// Whether the radio is enabled.
    pub enabled: bool,
    /// Device state.
    pub state: WifiState,
    /// SSID of the active connection.
    pub ssid: Option<String>,
    /// Signal strength of the active connection (0–100).
    pub strength: u8,
    /// Access points from the last scan.
    pub access_points: Vec<AccessPoint>,
}

/// One scanned access point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPoint {
    pub ssid: String,
    pub bssid: String,
    /// Signal strength (0–100).
    pub strength: u8,
    /// Frequency in MHz.
    pub frequency: u32,
    /// Whether this access point carries the active connection.
    pub active: bool,
    /// Whether the network requires credentials.
    pub secured: bool,
}

/// Wireless device state, as reported by NetworkManager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WifiState {
    #[default]
    Unknown,
    Unmanaged,
    Unavailable,
    Disconnected,
    Prepare,
    Config,
    NeedAuth,
    IpConfig,
    IpCheck,
    Secondaries,
    Activated,
    Deactivating,
    Failed,
}

impl WifiState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Unmanaged => "unmanaged",
            Self::Unavailable => "unavailable",
            Self::Disconnected => "disconnected",
            Self::Prepare => "prepare",
            Self::Config => "config",
            Self::NeedAuth => "need_auth",
            Self::IpConfig => "ip_config",
            Self::IpCheck => "ip_check",
            Self::Secondaries => "secondaries",
            Self::Activated => "activated",
            Self::Deactivating => "deactivating",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "unknown" => Some(Self::Unknown),
            "unmanaged" => Some(Self::Unmanaged),
            "unavailable" => Some(Self::Unavailable),
            "disconnected" => Some(Self::Disconnected),
            "prepare" => Some(Self::Prepare),
            "config" => Some(Self::Config),
            "need_auth" => Some(Self::NeedAuth),
            "ip_config" => Some(Self::IpConfig),
            "ip_check" => Some(Self::IpCheck),
            "secondaries" => Some(Self::Secondaries),
            "activated" | "connected" => Some(Self::Activated),
            "deactivating" => Some(Self::Deactivating),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the device is somewhere between "prepare" and "activated".
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Prepare
                | Self::Config
                | Self::NeedAuth
                | Self::IpConfig
                | Self::IpCheck
                | Self::Secondaries
        )
    }
}

/// Internet reachability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    #[default]
    Unknown,
    None,
    Portal,
    Limited,
    Full,
}

impl WifiSnapshot {
    /// Whether the panel should prompt for credentials for the current SSID.
    pub fn requires_credentials(&self) -> bool {
        matches!(self.state, WifiState::Failed | WifiState::NeedAuth) && self.ssid.is_some()
    }

    /// One access point per SSID: the strongest, marked active if any
    /// duplicate is active. Sorted by descending strength, then SSID.
    /// Hidden networks (empty SSID) are skipped.
    pub fn strongest_by_ssid(&self) -> Vec<AccessPoint> {
        let mut best: HashMap<&str, AccessPoint> = HashMap::new();
        for ap in self.access_points.iter().filter(|ap| !ap.ssid.is_empty()) {
            match best.get_mut(ap.ssid.as_str()) {
                Some(current) => {
                    let active = current.active || ap.active;
                    if ap.strength > current.strength {
                        *current = ap.clone();
                    }
                    current.active = active;
                }
                None => {
                    best.insert(ap.ssid.as_str(), ap.clone());
                }
            }
        }

        let mut list: Vec<AccessPoint> = best.into_values().collect();
        list.sort_by(|a, b| b.strength.cmp(&a.strength).then_with(|| a.ssid.cmp(&b.ssid)));
        list
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn ap(ssid: &str, bssid: &str, strength: u8, active: bool) -> AccessPoint {
        AccessPoint {
            ssid: ssid.to_owned(),
            bssid: bssid.to_owned(),
            strength,
            frequency: 2_437,
            active,
            secured: true,
        }
    }

    #[test]
    fn state_parse_accepts_wire_names() {
        assert_eq!(WifiState::parse("need_auth"), Some(WifiState::NeedAuth));
        assert_eq!(WifiState::parse("IP-CONFIG"), Some(WifiState::IpConfig));
        assert_eq!(WifiState::parse("connected"), Some(WifiState::Activated));
        assert_eq!(WifiState::parse("bogus"), None);
        assert_eq!(WifiState::Failed.as_str(), "failed");
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&WifiState::NeedAuth).unwrap();
        assert_eq!(json, "\"need_auth\"");
        assert!(WifiState::IpCheck.is_connecting());
        assert!(!WifiState::Activated.is_connecting());
    }

    #[test]
    fn credentials_prompt_needs_ssid_and_failure() {
        let mut wifi = WifiSnapshot {
            state: WifiState::NeedAuth,
            ssid: Some("home".to_owned()),
            ..WifiSnapshot::default()
        };
        assert!(wifi.requires_credentials());

        wifi.ssid = None;
        assert!(!wifi.requires_credentials());

        wifi.ssid = Some("home".to_owned());
        wifi.state = WifiState::Activated;
        assert!(!wifi.requires_credentials());
    }

    #[test]
    fn strongest_by_ssid_dedupes_and_sorts() {
        let wifi = WifiSnapshot {
            access_points: vec![
                ap("cafe", "aa:01", 40, false),
                ap("home", "bb:01", 55, true),
                ap("home", "bb:02", 80, false),
                ap("", "cc:01", 99, false),
                ap("attic", "dd:01", 40, false),
            ],
            ..WifiSnapshot::default()
        };

        let list = wifi.strongest_by_ssid();
        let ssids: Vec<&str> = list.iter().map(|ap| ap.ssid.as_str()).collect();
        assert_eq!(ssids, vec!["home", "attic", "cafe"]);
        assert_eq!(list[0].bssid, "bb:02");
        assert!(list[0].active);
    }

    #[test]
    fn snapshot_json_round_trip_keeps_defaults() {
        let snapshot: NetworkSnapshot =
            serde_json::from_str(r#"{"wifi":{"enabled":true,"state":"activated"}}"#).unwrap();
        assert!(snapshot.wifi.enabled);
        assert_eq!(snapshot.wifi.state, WifiState::Activated);
        assert_eq!(snapshot.connectivity, Connectivity::Unknown);
        assert!(snapshot.wifi.access_points.is_empty());
    }
}
