//! Distance computation, proximity search, and banner slotting.

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashMap;

use crate::model::{Banner, Event, Region, UserSnapshot};

/// Radius of the circle that groups banners into one region.
pub const REGION_RADIUS_KM: f64 = 30.0;

/// Maximum concurrently active banners sharing one region circle.
pub const MAX_BANNERS_PER_REGION: usize = 3;

/// User snapshots older than this are ignored for broadcast targeting.
pub const SNAPSHOT_STALE_DAYS: i64 = 30;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle (haversine) distance between two coordinates, in km.
pub fn distance_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Active events within `radius_km` of `point`, boosted listings first,
/// ties broken by distance.
pub fn find_nearby(
    point: (f64, f64),
    radius_km: f64,
    events: &[Event],
    now: DateTime<Utc>,
) -> Vec<Event> {
    let mut hits: Vec<(f64, Event)> = events
        .iter()
        .filter(|ev| ev.visible(now))
        .filter_map(|ev| {
            let d = distance_km(point, (ev.lat, ev.lon));
            (d <= radius_km).then(|| (d, ev.clone()))
        })
        .collect();
    hits.sort_by(|(da, a), (db, b)| {
        let rank_a = if a.is_top { 0 } else { 1 };
        let rank_b = if b.is_top { 0 } else { 1 };
        rank_a
            .cmp(&rank_b)
            .then(da.partial_cmp(db).unwrap_or(std::cmp::Ordering::Equal))
    });
    hits.into_iter().map(|(_, ev)| ev).collect()
}

/// Active coordinate-bearing banners within `radius_km` of `point`.
pub fn banners_in_region(
    point: (f64, f64),
    radius_km: f64,
    banners: &[Banner],
    now: DateTime<Utc>,
) -> Vec<Banner> {
    banners
        .iter()
        .filter(|b| b.active(now))
        .filter(|b| match b.region {
            Region::At { lat, lon } => distance_km(point, (lat, lon)) <= radius_km,
            Region::Global => false,
        })
        .cloned()
        .collect()
}

/// Pick a banner for a user: a random region match when their location is
/// known, otherwise a random active global banner, otherwise none.
pub fn pick_banner(
    snapshot: Option<&UserSnapshot>,
    banners: &[Banner],
    now: DateTime<Utc>,
) -> Option<Banner> {
    let mut rng = thread_rng();
    if let Some(point) = snapshot.and_then(|s| s.lat.zip(s.lon)) {
        let regional = banners_in_region(point, REGION_RADIUS_KM, banners, now);
        if let Some(b) = regional.choose(&mut rng) {
            return Some(b.clone());
        }
    }
    let global: Vec<&Banner> = banners
        .iter()
        .filter(|b| b.active(now) && b.region == Region::Global)
        .collect();
    global.choose(&mut rng).map(|b| (*b).clone())
}

/// Users with a fresh snapshot located within `radius_km` of the event.
pub fn broadcast_targets(
    event: &Event,
    users: &HashMap<i64, UserSnapshot>,
    radius_km: f64,
    staleness: Duration,
    now: DateTime<Utc>,
) -> Vec<i64> {
    users
        .iter()
        .filter(|(_, snap)| now - snap.last_seen <= staleness)
        .filter_map(|(id, snap)| {
            let point = snap.lat.zip(snap.lon)?;
            (distance_km(point, (event.lat, event.lon)) <= radius_km).then_some(*id)
        })
        .collect()
}
