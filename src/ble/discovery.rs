//! Scan result model and candidate ordering.

use super::BdAddr;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;

pub const NINTENDO_COMPANY_ID: u16 = 0x037E;

pub const NINTENDO_OUIS: [[u8; 3]; 8] = [
    [0x3C, 0xA9, 0xAB],
    [0x98, 0xB6, 0xE9],
    [0x7C, 0xBB, 0x8A],
    [0x58, 0x2F, 0x40],
    [0xD8, 0x6B, 0xF7],
    [0x04, 0x03, 0xD6],
    [0xA4, 0xC0, 0xE1],
    [0x40, 0xF4, 0x07],
];

const NAME_PATTERNS: [&str; 6] = [
    "pro controller",
    "nintendo",
    "joy-con",
    "hori",
    "nso",
    "devicename",
];

/// RSSI reported when the stack has none.
pub const RSSI_UNKNOWN: i16 = -999;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub address: BdAddr,
    pub name: Option<String>,
    pub rssi: i16,
    #[serde(default)]
    pub manufacturer_ids: Vec<u16>,
}

impl Advertisement {
    pub fn is_vendor(&self) -> bool {
        self.manufacturer_ids.contains(&NINTENDO_COMPANY_ID)
            || NINTENDO_OUIS.contains(&self.address.oui())
    }

    pub fn name_matches(&self) -> bool {
        self.name
            .as_deref()
            .map(|name| {
                let lower = name.to_lowercase();
                NAME_PATTERNS.iter().any(|p| lower.contains(p))
            })
            .unwrap_or(false)
    }
}

/// Orders scan results for connection attempts.
///
/// Vendor signature first, then name match, then signal strength, then address. A `target`
/// that was seen is moved to the front; addresses in `exclude` are dropped.
pub fn rank_candidates(
    advertisements: &[Advertisement],
    target: Option<BdAddr>,
    exclude: &[BdAddr],
) -> Vec<Advertisement> {
    let mut latest: HashMap<BdAddr, Advertisement> = HashMap::new();
    for ad in advertisements {
        latest
            .entry(ad.address)
            .and_modify(|seen| {
                if seen.name.is_none() {
                    seen.name = ad.name.clone();
                }
                if ad.rssi != RSSI_UNKNOWN {
                    seen.rssi = ad.rssi;
                }
                for id in &ad.manufacturer_ids {
                    if !seen.manufacturer_ids.contains(id) {
                        seen.manufacturer_ids.push(*id);
                    }
                }
            })
            .or_insert_with(|| ad.clone());
    }

    let mut ranked: Vec<Advertisement> = latest
        .into_values()
        .filter(|ad| !exclude.contains(&ad.address))
        .collect();
    ranked.sort_by_key(|ad| {
        (
            Reverse(ad.is_vendor()),
            Reverse(ad.name_matches()),
            Reverse(ad.rssi),
            ad.address,
        )
    });

    if let Some(target) = target {
        if let Some(pos) = ranked.iter().position(|ad| ad.address == target) {
            let found = ranked.remove(pos);
            ranked.insert(0, found);
        }
    }
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ad(addr: &str, name: Option<&str>, rssi: i16, ids: &[u16]) -> Advertisement {
        Advertisement {
            address: addr.parse().unwrap(),
            name: name.map(str::to_string),
            rssi,
            manufacturer_ids: ids.to_vec(),
        }
    }

    #[test]
    fn vendor_beats_name_beats_signal() {
        let ads = vec![
            ad("11:22:33:44:55:66", Some("Speaker"), -30, &[]),
            ad("11:22:33:44:55:67", Some("Pro Controller"), -80, &[]),
            ad("11:22:33:44:55:68", None, -90, &[NINTENDO_COMPANY_ID]),
            ad("11:22:33:44:55:69", Some("Headphones"), -20, &[]),
        ];
        let order: Vec<String> = rank_candidates(&ads, None, &[])
            .into_iter()
            .map(|a| a.address.to_string())
            .collect();
        assert_eq!(
            order,
            vec![
                "11:22:33:44:55:68",
                "11:22:33:44:55:67",
                "11:22:33:44:55:69",
                "11:22:33:44:55:66",
            ]
        );
    }

    #[test]
    fn oui_counts_as_vendor_signature() {
        assert!(ad("98:B6:E9:00:00:01", None, -50, &[]).is_vendor());
        assert!(!ad("98:B6:EA:00:00:01", None, -50, &[]).is_vendor());
        assert!(ad("00:00:00:00:00:01", Some("DeviceName"), -50, &[]).name_matches());
    }

    #[test]
    fn target_goes_first_and_excluded_are_skipped() {
        let ads = vec![
            ad("98:B6:E9:00:00:01", Some("Pro Controller"), -40, &[]),
            ad("98:B6:E9:00:00:02", Some("Pro Controller"), -60, &[]),
            ad("98:B6:E9:00:00:03", Some("Pro Controller"), -50, &[]),
            ad("98:B6:E9:00:00:02", None, RSSI_UNKNOWN, &[]),
        ];
        let target: BdAddr = "98:B6:E9:00:00:02".parse().unwrap();
        let exclude: BdAddr = "98:B6:E9:00:00:01".parse().unwrap();
        let ranked = rank_candidates(&ads, Some(target), &[exclude]);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].address, target);
        assert_eq!(ranked[0].rssi, -60);
        assert_eq!(ranked[1].address.to_string(), "98:B6:E9:00:00:03");
    }
}
