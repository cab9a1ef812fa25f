//! Domain model for listings, banners, and user presence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Schema version written into every persisted document.
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of a media attachment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

/// A single media attachment referenced by its transport file id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    pub kind: MediaKind,
    /// Opaque file reference understood by the chat transport.
    pub file_ref: String,
}

/// Fixed set of listing categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Concert,
    Party,
    Sport,
    Education,
    Market,
    Other,
}

impl Category {
    /// All categories in menu order.
    pub const ALL: [Category; 6] = [
        Category::Concert,
        Category::Party,
        Category::Sport,
        Category::Education,
        Category::Market,
        Category::Other,
    ];

    /// Stable token used in callback data.
    pub fn token(self) -> &'static str {
        match self {
            Category::Concert => "concert",
            Category::Party => "party",
            Category::Sport => "sport",
            Category::Education => "education",
            Category::Market => "market",
            Category::Other => "other",
        }
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Category::Concert => "Concert",
            Category::Party => "Party",
            Category::Sport => "Sport",
            Category::Education => "Education",
            Category::Market => "Market",
            Category::Other => "Other",
        }
    }

    pub fn from_token(token: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|c| c.token() == token)
    }
}

/// A geotagged, time-bounded listing.
///
/// Visible in proximity search while `now < expire_at`. Boosted while
/// `is_top` is set together with a future `top_expire_at`; the notifier
/// pass clears both once the boost lapses. `notified` guards the lead-time
/// renewal reminder and flips false to true exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonically assigned, never reused.
    pub id: u64,
    /// Owner's opaque chat user id.
    pub author: i64,
    pub title: String,
    pub description: String,
    pub category: Category,
    /// Scheduled real-world moment; informational only.
    pub occurs_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    /// At most three attachments.
    pub media: Vec<MediaItem>,
    pub contact: Option<String>,
    /// Listing visibility deadline.
    pub expire_at: DateTime<Utc>,
    /// Lead-time renewal reminder already sent.
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub is_top: bool,
    #[serde(default)]
    pub top_expire_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Whether the listing is visible in search at `now`.
    pub fn visible(&self, now: DateTime<Utc>) -> bool {
        now < self.expire_at
    }
}

/// Where a banner is shown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum Region {
    /// Shown to users near a coordinate (30 km circle).
    At { lat: f64, lon: f64 },
    /// Fallback shown to users without a known location.
    Global,
}

/// A region-scoped advertisement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Banner {
    pub media: MediaItem,
    pub url: Option<String>,
    pub region: Region,
    pub expire_at: DateTime<Utc>,
}

impl Banner {
    pub fn active(&self, now: DateTime<Utc>) -> bool {
        now < self.expire_at
    }
}

/// Last known presence of a user, overwritten on every location report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSnapshot {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

/// Persisted listings collection with the id counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsDoc {
    pub version: u32,
    /// Next id to assign; only ever increments.
    pub next_id: u64,
    pub events: Vec<Event>,
}

impl Default for EventsDoc {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            next_id: 1,
            events: Vec::new(),
        }
    }
}

/// Persisted banners collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BannersDoc {
    pub version: u32,
    pub banners: Vec<Banner>,
}

impl Default for BannersDoc {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            banners: Vec::new(),
        }
    }
}

/// Persisted user snapshots keyed by user id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsersDoc {
    pub version: u32,
    pub users: HashMap<i64, UserSnapshot>,
}

impl Default for UsersDoc {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            users: HashMap::new(),
        }
    }
}

/// Persisted favorites: user id to ordered event ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FavoritesDoc {
    pub version: u32,
    pub favorites: HashMap<i64, Vec<u64>>,
}

impl Default for FavoritesDoc {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            favorites: HashMap::new(),
        }
    }
}

/// Listing lifetime tiers offered at the end of the creation workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeTier {
    /// 24 hours, no payment.
    Free,
    /// 48 hours.
    TwoDays,
    /// 7 days.
    Week,
    /// 30 days.
    Month,
}

impl LifetimeTier {
    pub const ALL: [LifetimeTier; 4] = [
        LifetimeTier::Free,
        LifetimeTier::TwoDays,
        LifetimeTier::Week,
        LifetimeTier::Month,
    ];

    /// The three paid tiers, also offered as renewal extensions.
    pub const PAID: [LifetimeTier; 3] = [
        LifetimeTier::TwoDays,
        LifetimeTier::Week,
        LifetimeTier::Month,
    ];

    pub fn hours(self) -> i64 {
        match self {
            LifetimeTier::Free => 24,
            LifetimeTier::TwoDays => 48,
            LifetimeTier::Week => 7 * 24,
            LifetimeTier::Month => 30 * 24,
        }
    }

    /// Fixed price in whole USD; zero means no payment gate.
    pub fn price_usd(self) -> u32 {
        match self {
            LifetimeTier::Free => 0,
            LifetimeTier::TwoDays => 3,
            LifetimeTier::Week => 5,
            LifetimeTier::Month => 10,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            LifetimeTier::Free => "free",
            LifetimeTier::TwoDays => "48h",
            LifetimeTier::Week => "7d",
            LifetimeTier::Month => "30d",
        }
    }

    pub fn label(self) -> String {
        match self {
            LifetimeTier::Free => "24 hours — free".to_string(),
            LifetimeTier::TwoDays => format!("48 hours — ${}", self.price_usd()),
            LifetimeTier::Week => format!("7 days — ${}", self.price_usd()),
            LifetimeTier::Month => format!("30 days — ${}", self.price_usd()),
        }
    }

    pub fn from_token(token: &str) -> Option<LifetimeTier> {
        LifetimeTier::ALL.into_iter().find(|t| t.token() == token)
    }
}
