//! Routing of inbound chat updates to the engine, search, and favorites.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::config::Settings;
use crate::geo;
use crate::model::{Banner, LifetimeTier, MediaItem, MediaKind, Region, UserSnapshot};
use crate::presenter::Presenter;
use crate::storage::Store;
use crate::update::{Callback, Message, Update};
use crate::workflow::{BannerPlacement, Engine, Input};

/// Search results are capped to keep replies readable.
const MAX_RESULTS: usize = 10;

const MENU_TEXT: &str = "What I can do:\n\
    /new — post an event near you\n\
    /nearby — events around your last location\n\
    /favorites — listings you saved\n\
    /fav <id>, /unfav <id> — save or unsave a listing\n\
    Share a location at any time to search there.";

/// Routes one webhook update to the right handler.
pub struct Dispatcher {
    store: Arc<Store>,
    engine: Arc<Engine>,
    presenter: Arc<dyn Presenter>,
    search_radius_km: f64,
    admin_users: Vec<i64>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<Engine>,
        presenter: Arc<dyn Presenter>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            engine,
            presenter,
            search_radius_km: settings.search_radius_km,
            admin_users: settings.admin_users.clone(),
        }
    }

    pub async fn dispatch(&self, update: Update) -> Result<()> {
        self.dispatch_at(update, Utc::now()).await
    }

    pub async fn dispatch_at(&self, update: Update, now: DateTime<Utc>) -> Result<()> {
        if let Some(msg) = update.message {
            self.on_message(msg, now).await
        } else if let Some(cb) = update.callback {
            self.on_callback(cb, now).await
        } else {
            Ok(())
        }
    }

    async fn on_message(&self, msg: Message, now: DateTime<Utc>) -> Result<()> {
        let user = msg.from;

        // A location report always refreshes the snapshot and searches there,
        // whether or not a workflow is in progress.
        if let Some(loc) = msg.location {
            self.store
                .update_users(|doc| {
                    doc.users.insert(
                        user,
                        UserSnapshot {
                            lat: Some(loc.lat),
                            lon: Some(loc.lon),
                            last_seen: now,
                        },
                    );
                })
                .await?;
            return self.search(user, (loc.lat, loc.lon), now).await;
        }

        if let Some(text) = msg.text.as_deref() {
            if text.starts_with('/') {
                return self.on_command(user, text, &msg, now).await;
            }
        }

        if self.engine.is_active(user).await {
            let input = if let Some(file_ref) = &msg.photo {
                Input::Media(MediaItem {
                    kind: MediaKind::Photo,
                    file_ref: file_ref.clone(),
                })
            } else if let Some(file_ref) = &msg.video {
                Input::Media(MediaItem {
                    kind: MediaKind::Video,
                    file_ref: file_ref.clone(),
                })
            } else if msg.other_attachment.is_some() {
                Input::UnsupportedMedia
            } else if let Some(text) = msg.text.as_deref() {
                Input::Text(text)
            } else {
                return Ok(());
            };
            return self.engine.handle(user, input, now).await;
        }

        self.presenter.send_text(user, MENU_TEXT, None).await
    }

    async fn on_command(
        &self,
        user: i64,
        text: &str,
        msg: &Message,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or_default();
        match command {
            "/start" => self.presenter.send_text(user, MENU_TEXT, None).await,
            "/new" => self.engine.start(user, now).await,
            "/nearby" => {
                let snapshot = self.store.users().await.users.get(&user).cloned();
                match snapshot.and_then(|s| s.lat.zip(s.lon)) {
                    Some(point) => self.search(user, point, now).await,
                    None => {
                        self.presenter
                            .send_text(user, "Share a location first and I'll search around it.", None)
                            .await
                    }
                }
            }
            "/favorites" => self.list_favorites(user, now).await,
            "/fav" => {
                let id = parts.next().and_then(|s| s.parse::<u64>().ok());
                self.add_favorite(user, id, now).await
            }
            "/unfav" => {
                let id = parts.next().and_then(|s| s.parse::<u64>().ok());
                self.remove_favorite(user, id).await
            }
            "/banner" => self.place_banner_command(user, text, msg, now).await,
            _ => {
                self.presenter
                    .send_text(user, "Unknown command. Send /start for the menu.", None)
                    .await
            }
        }
    }

    async fn on_callback(&self, cb: Callback, now: DateTime<Utc>) -> Result<()> {
        let user = cb.from;
        if let Some(rest) = cb.data.strip_prefix("renew:") {
            let mut parts = rest.splitn(2, ':');
            let event_id = parts.next().and_then(|s| s.parse::<u64>().ok());
            let tier = parts.next().and_then(LifetimeTier::from_token);
            if let (Some(event_id), Some(tier)) = (event_id, tier) {
                return self.engine.start_renewal(user, event_id, tier, now).await;
            }
            return Ok(());
        }
        // Everything else belongs to the workflow keyboards.
        self.engine.handle(user, Input::Select(&cb.data), now).await
    }

    /// Proximity search: ranked listings, then one banner for the region.
    async fn search(&self, user: i64, point: (f64, f64), now: DateTime<Utc>) -> Result<()> {
        let events = self.store.events().await.events;
        let hits = geo::find_nearby(point, self.search_radius_km, &events, now);
        if hits.is_empty() {
            self.presenter
                .send_text(user, "Nothing happening nearby yet. Post something with /new!", None)
                .await?;
        } else {
            for ev in hits.iter().take(MAX_RESULTS) {
                if let Err(e) = self.presenter.send_listing(user, ev).await {
                    warn!(user, event = ev.id, error = %e, "listing delivery failed");
                }
            }
        }

        let banners = self.store.banners().await.banners;
        let snapshot = self.store.users().await.users.get(&user).cloned();
        if let Some(banner) = geo::pick_banner(snapshot.as_ref(), &banners, now) {
            if let Err(e) = self.presenter.send_banner(user, &banner).await {
                warn!(user, error = %e, "banner delivery failed");
            }
        }
        Ok(())
    }

    /// Favorites referencing missing or expired listings are filtered at
    /// read time and never pruned from the index.
    async fn list_favorites(&self, user: i64, now: DateTime<Utc>) -> Result<()> {
        let ids = self
            .store
            .favorites()
            .await
            .favorites
            .get(&user)
            .cloned()
            .unwrap_or_default();
        let events = self.store.events().await.events;
        let saved: Vec<_> = ids
            .iter()
            .filter_map(|id| events.iter().find(|ev| ev.id == *id && ev.visible(now)))
            .collect();
        if saved.is_empty() {
            self.presenter
                .send_text(user, "No saved listings. Save one with /fav <id>.", None)
                .await?;
            return Ok(());
        }
        for ev in saved {
            if let Err(e) = self.presenter.send_listing(user, ev).await {
                warn!(user, event = ev.id, error = %e, "favorite delivery failed");
            }
        }
        Ok(())
    }

    async fn add_favorite(&self, user: i64, id: Option<u64>, now: DateTime<Utc>) -> Result<()> {
        let Some(id) = id else {
            self.presenter
                .send_text(user, "Usage: /fav <listing id>", None)
                .await?;
            return Ok(());
        };
        let exists = self
            .store
            .events()
            .await
            .events
            .iter()
            .any(|ev| ev.id == id && ev.visible(now));
        if !exists {
            self.presenter
                .send_text(user, "No such listing.", None)
                .await?;
            return Ok(());
        }
        self.store
            .update_favorites(|doc| {
                let list = doc.favorites.entry(user).or_default();
                if !list.contains(&id) {
                    list.push(id);
                }
            })
            .await?;
        self.presenter
            .send_text(user, &format!("Saved listing #{id}."), None)
            .await
    }

    async fn remove_favorite(&self, user: i64, id: Option<u64>) -> Result<()> {
        let Some(id) = id else {
            self.presenter
                .send_text(user, "Usage: /unfav <listing id>", None)
                .await?;
            return Ok(());
        };
        self.store
            .update_favorites(|doc| {
                if let Some(list) = doc.favorites.get_mut(&user) {
                    list.retain(|saved| *saved != id);
                }
            })
            .await?;
        self.presenter
            .send_text(user, &format!("Removed listing #{id}."), None)
            .await
    }

    async fn place_banner_command(
        &self,
        user: i64,
        text: &str,
        msg: &Message,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.admin_users.contains(&user) {
            self.presenter
                .send_text(user, "Banner placement is restricted.", None)
                .await?;
            return Ok(());
        }
        let media = if let Some(file_ref) = &msg.photo {
            MediaItem {
                kind: MediaKind::Photo,
                file_ref: file_ref.clone(),
            }
        } else if let Some(file_ref) = &msg.video {
            MediaItem {
                kind: MediaKind::Video,
                file_ref: file_ref.clone(),
            }
        } else {
            self.presenter
                .send_text(user, "Attach the banner image or video to the command.", None)
                .await?;
            return Ok(());
        };
        let Some((region, days, url)) = parse_banner_args(text) else {
            self.presenter
                .send_text(user, "Usage: /banner <lat>,<lon>|global <days> [url]", None)
                .await?;
            return Ok(());
        };
        let banner = Banner {
            media,
            url,
            region,
            expire_at: now + Duration::days(days),
        };
        match self.engine.place_banner(banner, now).await? {
            BannerPlacement::Placed => {
                self.presenter
                    .send_text(user, &format!("Banner active for {days} days."), None)
                    .await
            }
            BannerPlacement::RegionFull => {
                self.presenter
                    .send_text(user, "All banner slots in that region are taken.", None)
                    .await
            }
        }
    }
}

/// Parse `/banner <lat>,<lon>|global <days> [url]`.
fn parse_banner_args(text: &str) -> Option<(Region, i64, Option<String>)> {
    let mut parts = text.split_whitespace();
    parts.next()?; // the command itself
    let where_to = parts.next()?;
    let region = if where_to.eq_ignore_ascii_case("global") {
        Region::Global
    } else {
        let (lat, lon) = where_to.split_once(',')?;
        Region::At {
            lat: lat.trim().parse().ok()?,
            lon: lon.trim().parse().ok()?,
        }
    };
    let days: i64 = parts.next()?.parse().ok()?;
    if days <= 0 {
        return None;
    }
    let url = parts.next().map(|s| s.to_string());
    Some((region, days, url))
}
