//! Per-user creation and monetization workflow.
//!
//! Each user drives an explicit state machine: the creation steps collect a
//! draft, the lifetime step either publishes immediately (free tier) or
//! gates publication behind an invoice, and the upsell steps gate boosts and
//! broadcasts the same way. Sessions live only in memory and are evicted
//! after a day of inactivity.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::geo::{self, MAX_BANNERS_PER_REGION, REGION_RADIUS_KM, SNAPSHOT_STALE_DAYS};
use crate::model::{Banner, Category, Event, LifetimeTier, MediaItem, Region};
use crate::payments::{order_id, PaymentGateway};
use crate::presenter::{Button, Keyboard, Presenter};
use crate::storage::Store;

/// Accepted schedule input format, interpreted as UTC.
pub const SCHEDULE_FORMAT: &str = "%d.%m.%Y %H:%M";

/// Boost duration granted by the `top` upsell.
pub const TOP_DAYS: i64 = 7;

/// Fixed upsell prices in whole USD.
pub const TOP_PRICE_USD: u32 = 5;
pub const PUSH_PRICE_USD: u32 = 10;

/// Sessions idle longer than this are evicted.
pub const SESSION_TTL_HOURS: i64 = 24;

const MAX_MEDIA: usize = 3;

/// Workflow step the session currently waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Title,
    Description,
    Category,
    Schedule,
    Media,
    Contact,
    Lifetime,
    Payment,
    Upsell,
    UpsellPayment,
    /// Paying for a lifetime extension offered by the renewal reminder.
    ExtendPayment,
}

/// What a pending invoice entitles once settled.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Purchase {
    Listing(LifetimeTier),
    Top,
    Push,
    Extend(LifetimeTier),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingInvoice {
    id: String,
    purchase: Purchase,
}

/// Accumulated field values for the listing under construction.
#[derive(Debug, Clone, Default)]
struct Draft {
    title: String,
    description: String,
    category: Option<Category>,
    occurs_at: Option<DateTime<Utc>>,
    media: Vec<MediaItem>,
    contact: Option<String>,
    lat: f64,
    lon: f64,
    tier: Option<LifetimeTier>,
    upsell: Option<Purchase>,
}

/// Ephemeral per-user workflow state.
#[derive(Debug, Clone)]
struct Session {
    step: Step,
    draft: Draft,
    /// Id of the event this session created; upsells attach to it.
    event_id: Option<u64>,
    pending: Option<PendingInvoice>,
    touched_at: DateTime<Utc>,
}

/// One piece of user input routed into the state machine.
#[derive(Debug, Clone)]
pub enum Input<'a> {
    Text(&'a str),
    Media(MediaItem),
    /// An attachment kind the workflow does not accept.
    UnsupportedMedia,
    /// Callback data from an inline keyboard press.
    Select(&'a str),
}

/// Outcome of a banner placement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerPlacement {
    Placed,
    /// All slots in the 30 km region circle are taken.
    RegionFull,
}

/// The workflow engine: sessions plus the collaborators terminal steps need.
pub struct Engine {
    store: Arc<Store>,
    gateway: Arc<dyn PaymentGateway>,
    presenter: Arc<dyn Presenter>,
    push_radius_km: f64,
    sessions: Mutex<HashMap<i64, Session>>,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn PaymentGateway>,
        presenter: Arc<dyn Presenter>,
        push_radius_km: f64,
    ) -> Self {
        Self {
            store,
            gateway,
            presenter,
            push_radius_km,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the user has a workflow in progress.
    pub async fn is_active(&self, user: i64) -> bool {
        self.sessions.lock().await.contains_key(&user)
    }

    /// Begin a new creation workflow. Requires a known location: the
    /// listing is pinned where its author last reported being.
    pub async fn start(&self, user: i64, now: DateTime<Utc>) -> Result<()> {
        let snapshot = self.store.users().await.users.get(&user).cloned();
        let Some((lat, lon)) = snapshot.and_then(|s| s.lat.zip(s.lon)) else {
            self.presenter
                .send_text(user, "Share your location first so the listing can be placed on the map.", None)
                .await?;
            return Ok(());
        };
        let session = Session {
            step: Step::Title,
            draft: Draft {
                lat,
                lon,
                ..Draft::default()
            },
            event_id: None,
            pending: None,
            touched_at: now,
        };
        self.sessions.lock().await.insert(user, session);
        self.presenter
            .send_text(user, "What's the title of your event?", None)
            .await
    }

    /// Begin a renewal payment for an expiring listing the user owns.
    pub async fn start_renewal(
        &self,
        user: i64,
        event_id: u64,
        tier: LifetimeTier,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.is_active(user).await {
            self.presenter
                .send_text(user, "Finish your current flow first, then renew.", None)
                .await?;
            return Ok(());
        }
        let owned = self
            .store
            .events()
            .await
            .events
            .iter()
            .any(|ev| ev.id == event_id && ev.author == user);
        if !owned {
            self.presenter
                .send_text(user, "That listing no longer exists.", None)
                .await?;
            return Ok(());
        }
        let session = Session {
            step: Step::ExtendPayment,
            draft: Draft {
                tier: Some(tier),
                ..Draft::default()
            },
            event_id: Some(event_id),
            pending: None,
            touched_at: now,
        };
        self.sessions.lock().await.insert(user, session);
        self.presenter
            .send_text(
                user,
                &format!("Extend listing #{event_id}: {}.", tier.label()),
                Some(pay_keyboard()),
            )
            .await
    }

    /// Route one piece of input into the user's session.
    pub async fn handle(&self, user: i64, input: Input<'_>, now: DateTime<Utc>) -> Result<()> {
        let Some(mut session) = self.sessions.lock().await.get(&user).cloned() else {
            self.presenter
                .send_text(user, "No flow in progress. Send /new to post an event.", None)
                .await?;
            return Ok(());
        };
        session.touched_at = now;

        let result = if matches!(input, Input::Select("back")) {
            self.on_back(user, &mut session).await
        } else {
            match session.step {
                Step::Title => self.on_title(user, &mut session, input).await,
                Step::Description => self.on_description(user, &mut session, input).await,
                Step::Category => self.on_category(user, &mut session, input).await,
                Step::Schedule => self.on_schedule(user, &mut session, input, now).await,
                Step::Media => self.on_media(user, &mut session, input).await,
                Step::Contact => self.on_contact(user, &mut session, input).await,
                Step::Lifetime => self.on_lifetime(user, &mut session, input, now).await,
                Step::Payment => self.on_payment(user, &mut session, input, now).await,
                Step::Upsell => self.on_upsell(user, &mut session, input).await,
                Step::UpsellPayment => {
                    self.on_upsell_payment(user, &mut session, input, now).await
                }
                Step::ExtendPayment => {
                    self.on_extend_payment(user, &mut session, input, now).await
                }
            }
        };

        // The session is committed even when the handler failed mid-step:
        // a consumed invoice must never reappear as pending just because
        // an outbound send bounced.
        let mut sessions = self.sessions.lock().await;
        match result {
            Ok(true) => {
                sessions.remove(&user);
                Ok(())
            }
            Ok(false) => {
                sessions.insert(user, session);
                Ok(())
            }
            Err(e) => {
                sessions.insert(user, session);
                Err(e)
            }
        }
    }

    /// Drop sessions idle for longer than the TTL; returns how many.
    pub async fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| now - s.touched_at <= Duration::hours(SESSION_TTL_HOURS));
        before - sessions.len()
    }

    /// Place an advertising banner, enforcing the per-region slot cap.
    /// Global banners bypass the cap.
    pub async fn place_banner(&self, banner: Banner, now: DateTime<Utc>) -> Result<BannerPlacement> {
        // The cap check runs inside the collection lock so two concurrent
        // placements cannot both observe a free slot.
        self.store
            .update_banners(|doc| {
                if let Region::At { lat, lon } = banner.region {
                    let active =
                        geo::banners_in_region((lat, lon), REGION_RADIUS_KM, &doc.banners, now);
                    if active.len() >= MAX_BANNERS_PER_REGION {
                        return BannerPlacement::RegionFull;
                    }
                }
                doc.banners.push(banner);
                BannerPlacement::Placed
            })
            .await
    }

    async fn on_back(&self, user: i64, session: &mut Session) -> Result<bool> {
        match session.step {
            Step::Title => {
                self.presenter.send_text(user, "Cancelled.", None).await?;
                return Ok(true);
            }
            Step::Description => {
                session.step = Step::Title;
                self.presenter
                    .send_text(user, "What's the title of your event?", None)
                    .await?;
            }
            Step::Category => {
                session.step = Step::Description;
                self.presenter
                    .send_text(user, "Describe your event.", None)
                    .await?;
            }
            Step::Schedule => {
                session.step = Step::Category;
                self.presenter
                    .send_text(user, "Pick a category.", Some(category_keyboard()))
                    .await?;
            }
            Step::Media => {
                // Pop attachments one by one; fall back only once empty.
                if session.draft.media.pop().is_some() {
                    let left = session.draft.media.len();
                    self.presenter
                        .send_text(
                            user,
                            &format!("Removed the last attachment ({left}/{MAX_MEDIA} kept)."),
                            Some(media_keyboard()),
                        )
                        .await?;
                } else {
                    session.step = Step::Schedule;
                    self.prompt_schedule(user).await?;
                }
            }
            Step::Contact => {
                session.step = Step::Media;
                self.prompt_media(user, session.draft.media.len()).await?;
            }
            Step::Lifetime => {
                session.step = Step::Contact;
                self.prompt_contact(user).await?;
            }
            Step::Payment => {
                // The invoice, if any, stays unpaid on the gateway side.
                session.pending = None;
                session.step = Step::Lifetime;
                self.prompt_lifetime(user).await?;
            }
            Step::Upsell => {
                self.presenter
                    .send_text(user, "Done! Your listing is posted.", None)
                    .await?;
                return Ok(true);
            }
            Step::UpsellPayment => {
                session.pending = None;
                session.draft.upsell = None;
                session.step = Step::Upsell;
                self.prompt_upsell(user).await?;
            }
            Step::ExtendPayment => {
                self.presenter.send_text(user, "Cancelled.", None).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn on_title(&self, user: i64, session: &mut Session, input: Input<'_>) -> Result<bool> {
        match input {
            Input::Text(text) if !text.trim().is_empty() => {
                session.draft.title = text.trim().to_string();
                session.step = Step::Description;
                self.presenter
                    .send_text(user, "Describe your event.", None)
                    .await?;
            }
            _ => {
                self.presenter
                    .send_text(user, "Send the title as plain text.", None)
                    .await?;
            }
        }
        Ok(false)
    }

    async fn on_description(
        &self,
        user: i64,
        session: &mut Session,
        input: Input<'_>,
    ) -> Result<bool> {
        match input {
            Input::Text(text) if !text.trim().is_empty() => {
                session.draft.description = text.trim().to_string();
                session.step = Step::Category;
                self.presenter
                    .send_text(user, "Pick a category.", Some(category_keyboard()))
                    .await?;
            }
            _ => {
                self.presenter
                    .send_text(user, "Send the description as plain text.", None)
                    .await?;
            }
        }
        Ok(false)
    }

    async fn on_category(
        &self,
        user: i64,
        session: &mut Session,
        input: Input<'_>,
    ) -> Result<bool> {
        let category = match input {
            Input::Select(data) => data
                .strip_prefix("cat:")
                .and_then(Category::from_token),
            _ => None,
        };
        match category {
            Some(category) => {
                session.draft.category = Some(category);
                session.step = Step::Schedule;
                self.prompt_schedule(user).await?;
            }
            None => {
                self.presenter
                    .send_text(user, "Pick a category.", Some(category_keyboard()))
                    .await?;
            }
        }
        Ok(false)
    }

    async fn on_schedule(
        &self,
        user: i64,
        session: &mut Session,
        input: Input<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Input::Text(text) = input else {
            self.prompt_schedule(user).await?;
            return Ok(false);
        };
        match parse_schedule(text) {
            Some(at) if at > now => {
                session.draft.occurs_at = Some(at);
                session.step = Step::Media;
                self.prompt_media(user, 0).await?;
            }
            Some(_) => {
                self.presenter
                    .send_text(user, "That moment is already in the past. Send a future date.", None)
                    .await?;
            }
            None => {
                self.presenter
                    .send_text(
                        user,
                        "Use the format DD.MM.YYYY HH:MM, e.g. 24.06.2025 19:30.",
                        None,
                    )
                    .await?;
            }
        }
        Ok(false)
    }

    async fn on_media(&self, user: i64, session: &mut Session, input: Input<'_>) -> Result<bool> {
        match input {
            Input::Media(item) => {
                session.draft.media.push(item);
                if session.draft.media.len() >= MAX_MEDIA {
                    session.step = Step::Contact;
                    self.prompt_contact(user).await?;
                } else {
                    let n = session.draft.media.len();
                    self.presenter
                        .send_text(
                            user,
                            &format!("Attached {n}/{MAX_MEDIA}. Send more or press Done."),
                            Some(media_keyboard()),
                        )
                        .await?;
                }
            }
            Input::UnsupportedMedia => {
                self.presenter
                    .send_text(
                        user,
                        "Only photos and videos are supported. Try another attachment.",
                        Some(media_keyboard()),
                    )
                    .await?;
            }
            Input::Select("done") => {
                session.step = Step::Contact;
                self.prompt_contact(user).await?;
            }
            _ => {
                self.prompt_media(user, session.draft.media.len()).await?;
            }
        }
        Ok(false)
    }

    async fn on_contact(&self, user: i64, session: &mut Session, input: Input<'_>) -> Result<bool> {
        match input {
            Input::Text(text) if !text.trim().is_empty() => {
                session.draft.contact = Some(text.trim().to_string());
            }
            Input::Select("skip") => {
                session.draft.contact = None;
            }
            _ => {
                self.prompt_contact(user).await?;
                return Ok(false);
            }
        }
        session.step = Step::Lifetime;
        self.prompt_lifetime(user).await?;
        Ok(false)
    }

    async fn on_lifetime(
        &self,
        user: i64,
        session: &mut Session,
        input: Input<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let tier = match input {
            Input::Select(data) => data.strip_prefix("life:").and_then(LifetimeTier::from_token),
            _ => None,
        };
        let Some(tier) = tier else {
            self.prompt_lifetime(user).await?;
            return Ok(false);
        };
        session.draft.tier = Some(tier);
        if tier.price_usd() == 0 {
            let id = self.publish(user, session, tier, now).await?;
            session.event_id = Some(id);
            session.step = Step::Upsell;
            self.prompt_upsell(user).await?;
        } else {
            session.step = Step::Payment;
            self.presenter
                .send_text(
                    user,
                    &format!("{} — request a payment link to continue.", tier.label()),
                    Some(pay_keyboard()),
                )
                .await?;
        }
        Ok(false)
    }

    async fn on_payment(
        &self,
        user: i64,
        session: &mut Session,
        input: Input<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(tier) = session.draft.tier else {
            self.presenter
                .send_text(user, "Something went wrong: no lifetime selected.", None)
                .await?;
            return Ok(true);
        };
        match input {
            Input::Select("pay:link") => {
                let order = order_id("listing", 0, user, now);
                let desc = format!("Listing for {}", tier.label());
                self.issue_invoice(user, session, tier.price_usd(), &order, &desc, Purchase::Listing(tier))
                    .await?;
            }
            Input::Select("pay:check") => {
                let Some(pending) = session.pending.clone() else {
                    self.presenter
                        .send_text(user, "Request a payment link first.", Some(pay_keyboard()))
                        .await?;
                    return Ok(false);
                };
                if !self.gateway.is_paid(&pending.id).await {
                    self.presenter
                        .send_text(
                            user,
                            "Payment not received yet. Pay the invoice, then press Check again.",
                            Some(pay_keyboard()),
                        )
                        .await?;
                    return Ok(false);
                }
                // Consume the invoice before granting anything.
                session.pending = None;
                let id = self.publish(user, session, tier, now).await?;
                session.event_id = Some(id);
                session.step = Step::Upsell;
                self.prompt_upsell(user).await?;
            }
            _ => {
                self.presenter
                    .send_text(user, "Pay the invoice or go back.", Some(pay_keyboard()))
                    .await?;
            }
        }
        Ok(false)
    }

    async fn on_upsell(&self, user: i64, session: &mut Session, input: Input<'_>) -> Result<bool> {
        let choice = match input {
            Input::Select(data) => data.strip_prefix("up:"),
            _ => None,
        };
        match choice {
            Some("none") => {
                self.presenter
                    .send_text(user, "Done! Your listing is posted.", None)
                    .await?;
                return Ok(true);
            }
            Some(kind @ ("top" | "push")) => {
                if session.event_id.is_none() {
                    // Should be impossible: upsell is only reachable after
                    // publication. Surface it and end the session.
                    self.presenter
                        .send_text(user, "Something went wrong: no listing to promote.", None)
                        .await?;
                    return Ok(true);
                }
                let (purchase, price) = if kind == "top" {
                    (Purchase::Top, TOP_PRICE_USD)
                } else {
                    (Purchase::Push, PUSH_PRICE_USD)
                };
                session.draft.upsell = Some(purchase);
                session.step = Step::UpsellPayment;
                self.presenter
                    .send_text(
                        user,
                        &format!("That option costs ${price}. Request a payment link to continue."),
                        Some(pay_keyboard()),
                    )
                    .await?;
            }
            _ => {
                self.prompt_upsell(user).await?;
            }
        }
        Ok(false)
    }

    async fn on_upsell_payment(
        &self,
        user: i64,
        session: &mut Session,
        input: Input<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(event_id) = session.event_id else {
            self.presenter
                .send_text(user, "Something went wrong: no listing to promote.", None)
                .await?;
            return Ok(true);
        };
        match input {
            Input::Select("pay:link") => {
                let (purpose, price, desc) = match session.draft.upsell {
                    Some(Purchase::Push) => ("push", PUSH_PRICE_USD, "Broadcast to nearby users"),
                    _ => ("top", TOP_PRICE_USD, "Top placement for 7 days"),
                };
                let purchase = if purpose == "push" { Purchase::Push } else { Purchase::Top };
                let order = order_id(purpose, event_id, user, now);
                self.issue_invoice(user, session, price, &order, desc, purchase).await?;
                Ok(false)
            }
            Input::Select("pay:check") => {
                let Some(pending) = session.pending.clone() else {
                    self.presenter
                        .send_text(user, "Request a payment link first.", Some(pay_keyboard()))
                        .await?;
                    return Ok(false);
                };
                if !self.gateway.is_paid(&pending.id).await {
                    self.presenter
                        .send_text(
                            user,
                            "Payment not received yet. Pay the invoice, then press Check again.",
                            Some(pay_keyboard()),
                        )
                        .await?;
                    return Ok(false);
                }
                session.pending = None;
                match pending.purchase {
                    Purchase::Top => self.grant_top(user, event_id, now).await?,
                    Purchase::Push => self.grant_push(user, event_id, now).await?,
                    _ => {}
                }
                Ok(true)
            }
            _ => {
                self.presenter
                    .send_text(user, "Pay the invoice or go back.", Some(pay_keyboard()))
                    .await?;
                Ok(false)
            }
        }
    }

    async fn on_extend_payment(
        &self,
        user: i64,
        session: &mut Session,
        input: Input<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (Some(event_id), Some(tier)) = (session.event_id, session.draft.tier) else {
            self.presenter
                .send_text(user, "Something went wrong: nothing to extend.", None)
                .await?;
            return Ok(true);
        };
        match input {
            Input::Select("pay:link") => {
                let order = order_id("extend", event_id, user, now);
                let desc = format!("Extension: {}", tier.label());
                self.issue_invoice(user, session, tier.price_usd(), &order, &desc, Purchase::Extend(tier))
                    .await?;
                Ok(false)
            }
            Input::Select("pay:check") => {
                let Some(pending) = session.pending.clone() else {
                    self.presenter
                        .send_text(user, "Request a payment link first.", Some(pay_keyboard()))
                        .await?;
                    return Ok(false);
                };
                if !self.gateway.is_paid(&pending.id).await {
                    self.presenter
                        .send_text(
                            user,
                            "Payment not received yet. Pay the invoice, then press Check again.",
                            Some(pay_keyboard()),
                        )
                        .await?;
                    return Ok(false);
                }
                session.pending = None;
                let extended = self
                    .store
                    .update_events(|doc| {
                        let Some(ev) = doc.events.iter_mut().find(|ev| ev.id == event_id) else {
                            return None;
                        };
                        let base = ev.expire_at.max(now);
                        ev.expire_at = base + Duration::hours(tier.hours());
                        Some(ev.expire_at)
                    })
                    .await?;
                match extended {
                    Some(until) => {
                        self.presenter
                            .send_text(
                                user,
                                &format!("Extended. The listing now runs until {}.", until.format(SCHEDULE_FORMAT)),
                                None,
                            )
                            .await?;
                    }
                    None => {
                        self.presenter
                            .send_text(user, "That listing no longer exists.", None)
                            .await?;
                    }
                }
                Ok(true)
            }
            _ => {
                self.presenter
                    .send_text(user, "Pay the invoice or go back.", Some(pay_keyboard()))
                    .await?;
                Ok(false)
            }
        }
    }

    /// Create the invoice and report the payment URL, leaving state
    /// untouched when the gateway is unavailable.
    async fn issue_invoice(
        &self,
        user: i64,
        session: &mut Session,
        price: u32,
        order: &str,
        description: &str,
        purchase: Purchase,
    ) -> Result<()> {
        match self.gateway.create_invoice(price, order, description).await {
            Ok(invoice) => {
                self.presenter
                    .send_text(
                        user,
                        &format!("Pay here: {}\nThen press Check.", invoice.url),
                        Some(pay_keyboard()),
                    )
                    .await?;
                session.pending = Some(PendingInvoice {
                    id: invoice.id,
                    purchase,
                });
            }
            Err(e) => {
                warn!(user, error = %e, "invoice creation failed");
                self.presenter
                    .send_text(
                        user,
                        "The payment service is unavailable right now. Try again in a minute.",
                        Some(pay_keyboard()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Persist the drafted listing and confirm to the author.
    async fn publish(
        &self,
        user: i64,
        session: &Session,
        tier: LifetimeTier,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let draft = &session.draft;
        let expire_at = now + Duration::hours(tier.hours());
        let event = Event {
            id: 0, // assigned under the store lock below
            author: user,
            title: draft.title.clone(),
            description: draft.description.clone(),
            category: draft.category.unwrap_or(Category::Other),
            occurs_at: draft.occurs_at.unwrap_or(now),
            lat: draft.lat,
            lon: draft.lon,
            media: draft.media.clone(),
            contact: draft.contact.clone(),
            expire_at,
            notified: false,
            is_top: false,
            top_expire_at: None,
        };
        let id = self
            .store
            .update_events(move |doc| {
                let id = doc.next_id;
                doc.next_id += 1;
                doc.events.push(Event { id, ..event });
                id
            })
            .await?;
        self.presenter
            .send_text(
                user,
                &format!("Listing #{id} is live until {}.", expire_at.format(SCHEDULE_FORMAT)),
                None,
            )
            .await?;
        Ok(id)
    }

    async fn grant_top(&self, user: i64, event_id: u64, now: DateTime<Utc>) -> Result<()> {
        let granted = self
            .store
            .update_events(|doc| {
                let Some(ev) = doc.events.iter_mut().find(|ev| ev.id == event_id) else {
                    return false;
                };
                ev.is_top = true;
                ev.top_expire_at = Some(now + Duration::days(TOP_DAYS));
                true
            })
            .await?;
        let text = if granted {
            format!("Your listing is pinned on top for {TOP_DAYS} days.")
        } else {
            "That listing no longer exists.".to_string()
        };
        self.presenter.send_text(user, &text, None).await
    }

    /// Deliver the listing to every fresh nearby user, tolerating
    /// per-recipient failures.
    async fn grant_push(&self, user: i64, event_id: u64, now: DateTime<Utc>) -> Result<()> {
        let event = self
            .store
            .events()
            .await
            .events
            .into_iter()
            .find(|ev| ev.id == event_id);
        let Some(event) = event else {
            self.presenter
                .send_text(user, "That listing no longer exists.", None)
                .await?;
            return Ok(());
        };
        let users = self.store.users().await.users;
        let targets = geo::broadcast_targets(
            &event,
            &users,
            self.push_radius_km,
            Duration::days(SNAPSHOT_STALE_DAYS),
            now,
        );
        let mut delivered = 0usize;
        for target in &targets {
            if *target == user {
                continue;
            }
            match self.presenter.send_listing(*target, &event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(target, event = event_id, error = %e, "push delivery failed"),
            }
        }
        self.presenter
            .send_text(
                user,
                &format!("Broadcast sent to {delivered} nearby users."),
                None,
            )
            .await
    }

    async fn prompt_schedule(&self, user: i64) -> Result<()> {
        self.presenter
            .send_text(
                user,
                "When does it happen? Send DD.MM.YYYY HH:MM (UTC).",
                None,
            )
            .await
    }

    async fn prompt_media(&self, user: i64, attached: usize) -> Result<()> {
        self.presenter
            .send_text(
                user,
                &format!("Send up to {MAX_MEDIA} photos or videos ({attached} attached), then press Done."),
                Some(media_keyboard()),
            )
            .await
    }

    async fn prompt_contact(&self, user: i64) -> Result<()> {
        self.presenter
            .send_text(
                user,
                "How can people reach you? Send contact info or skip.",
                Some(vec![vec![
                    Button::new("Skip", "skip"),
                    Button::new("Back", "back"),
                ]]),
            )
            .await
    }

    async fn prompt_lifetime(&self, user: i64) -> Result<()> {
        self.presenter
            .send_text(
                user,
                "How long should the listing stay visible?",
                Some(lifetime_keyboard()),
            )
            .await
    }

    async fn prompt_upsell(&self, user: i64) -> Result<()> {
        let keyboard = vec![
            vec![Button::new(
                format!("Pin on top, {TOP_DAYS} days — ${TOP_PRICE_USD}"),
                "up:top",
            )],
            vec![Button::new(
                format!("Notify nearby users — ${PUSH_PRICE_USD}"),
                "up:push",
            )],
            vec![Button::new("Post free, no options", "up:none")],
        ];
        self.presenter
            .send_text(user, "Give your listing a push?", Some(keyboard))
            .await
    }
}

/// Parse schedule input against the fixed format, as UTC.
pub fn parse_schedule(text: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), SCHEDULE_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

fn category_keyboard() -> Keyboard {
    let mut rows: Vec<Vec<Button>> = Category::ALL
        .chunks(2)
        .map(|pair| {
            pair.iter()
                .map(|c| Button::new(c.label(), format!("cat:{}", c.token())))
                .collect()
        })
        .collect();
    rows.push(vec![Button::new("Back", "back")]);
    rows
}

fn lifetime_keyboard() -> Keyboard {
    let mut rows: Vec<Vec<Button>> = LifetimeTier::ALL
        .into_iter()
        .map(|t| vec![Button::new(t.label(), format!("life:{}", t.token()))])
        .collect();
    rows.push(vec![Button::new("Back", "back")]);
    rows
}

fn media_keyboard() -> Keyboard {
    vec![vec![Button::new("Done", "done"), Button::new("Back", "back")]]
}

fn pay_keyboard() -> Keyboard {
    vec![
        vec![Button::new("Get payment link", "pay:link")],
        vec![Button::new("Check payment", "pay:check")],
        vec![Button::new("Back", "back")],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaKind, UserSnapshot};
    use crate::payments::Invoice;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    const BERLIN: (f64, f64) = (52.52, 13.405);

    struct MockGateway {
        paid: StdMutex<bool>,
        fail_create: bool,
        counter: StdMutex<u32>,
    }

    impl MockGateway {
        fn working() -> Arc<Self> {
            Arc::new(Self {
                paid: StdMutex::new(false),
                fail_create: false,
                counter: StdMutex::new(0),
            })
        }

        fn down() -> Arc<Self> {
            Arc::new(Self {
                paid: StdMutex::new(false),
                fail_create: true,
                counter: StdMutex::new(0),
            })
        }

        fn settle(&self) {
            *self.paid.lock().unwrap() = true;
        }
    }

    #[async_trait::async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_invoice(
            &self,
            _amount_usd: u32,
            _order_id: &str,
            _description: &str,
        ) -> Result<Invoice> {
            if self.fail_create {
                anyhow::bail!("gateway down");
            }
            let mut c = self.counter.lock().unwrap();
            *c += 1;
            Ok(Invoice {
                id: format!("inv-{c}"),
                url: format!("https://pay.example/inv-{c}"),
            })
        }

        async fn is_paid(&self, _invoice_id: &str) -> bool {
            *self.paid.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct RecordingPresenter {
        texts: StdMutex<Vec<(i64, String)>>,
        listings: StdMutex<Vec<(i64, u64)>>,
        failing: HashSet<i64>,
        fail_texts: StdMutex<bool>,
    }

    impl RecordingPresenter {
        fn last_text(&self, user: i64) -> String {
            self.texts
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(t, _)| *t == user)
                .map(|(_, msg)| msg.clone())
                .unwrap_or_default()
        }

        fn listing_targets(&self) -> Vec<i64> {
            let mut targets: Vec<i64> =
                self.listings.lock().unwrap().iter().map(|(t, _)| *t).collect();
            targets.sort_unstable();
            targets
        }
    }

    #[async_trait::async_trait]
    impl Presenter for RecordingPresenter {
        async fn send_text(&self, target: i64, text: &str, _kb: Option<Keyboard>) -> Result<()> {
            if *self.fail_texts.lock().unwrap() {
                anyhow::bail!("chat transport down");
            }
            self.texts.lock().unwrap().push((target, text.to_string()));
            Ok(())
        }

        async fn send_listing(&self, target: i64, event: &Event) -> Result<()> {
            if self.failing.contains(&target) {
                anyhow::bail!("recipient unreachable");
            }
            self.listings.lock().unwrap().push((target, event.id));
            Ok(())
        }

        async fn send_banner(&self, _target: i64, _banner: &Banner) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<Store>,
        gateway: Arc<MockGateway>,
        presenter: Arc<RecordingPresenter>,
        engine: Engine,
        now: DateTime<Utc>,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_gateway(MockGateway::working(), RecordingPresenter::default()).await
        }

        async fn with_gateway(gateway: Arc<MockGateway>, presenter: RecordingPresenter) -> Self {
            let dir = TempDir::new().unwrap();
            let store = Store::open(dir.path()).unwrap();
            let now = Utc::now();
            store
                .update_users(|doc| {
                    doc.users.insert(
                        1,
                        UserSnapshot {
                            lat: Some(BERLIN.0),
                            lon: Some(BERLIN.1),
                            last_seen: now,
                        },
                    );
                })
                .await
                .unwrap();
            let presenter = Arc::new(presenter);
            let engine = Engine::new(store.clone(), gateway.clone(), presenter.clone(), 30.0);
            Fixture {
                _dir: dir,
                store,
                gateway,
                presenter,
                engine,
                now,
            }
        }

        /// Drive the creation steps up to the lifetime choice.
        async fn to_lifetime(&self, user: i64) {
            self.engine.start(user, self.now).await.unwrap();
            self.step(user, Input::Text("Garage sale")).await;
            self.step(user, Input::Text("Old cameras and records")).await;
            self.step(user, Input::Select("cat:market")).await;
            let when = (self.now + Duration::days(1)).format(SCHEDULE_FORMAT).to_string();
            self.step(user, Input::Text(&when)).await;
            self.step(user, Input::Select("done")).await;
            self.step(user, Input::Select("skip")).await;
        }

        async fn step(&self, user: i64, input: Input<'_>) {
            self.engine.handle(user, input, self.now).await.unwrap();
        }

        fn photo(&self, name: &str) -> MediaItem {
            MediaItem {
                kind: MediaKind::Photo,
                file_ref: name.into(),
            }
        }

        async fn events(&self) -> Vec<Event> {
            self.store.events().await.events
        }
    }

    #[tokio::test]
    async fn start_requires_a_known_location() {
        let fx = Fixture::new().await;
        fx.engine.start(99, fx.now).await.unwrap();
        assert!(!fx.engine.is_active(99).await);
        assert!(fx.presenter.last_text(99).contains("Share your location"));
    }

    #[tokio::test]
    async fn free_tier_publishes_immediately_then_offers_upsell() {
        let fx = Fixture::new().await;
        fx.to_lifetime(1).await;
        fx.step(1, Input::Select("life:free")).await;

        let events = fx.events().await;
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.author, 1);
        assert_eq!(ev.title, "Garage sale");
        assert_eq!(ev.category, Category::Market);
        assert_eq!(ev.expire_at, fx.now + Duration::hours(24));
        assert!(!ev.is_top);
        assert!(fx.presenter.last_text(1).contains("Give your listing a push?"));

        fx.step(1, Input::Select("up:none")).await;
        assert!(!fx.engine.is_active(1).await);
    }

    #[tokio::test]
    async fn schedule_rejects_garbage_and_past_dates() {
        let fx = Fixture::new().await;
        fx.engine.start(1, fx.now).await.unwrap();
        fx.step(1, Input::Text("Title")).await;
        fx.step(1, Input::Text("Description")).await;
        fx.step(1, Input::Select("cat:party")).await;

        fx.step(1, Input::Text("soonish")).await;
        assert!(fx.presenter.last_text(1).contains("DD.MM.YYYY"));

        let past = (fx.now - Duration::days(1)).format(SCHEDULE_FORMAT).to_string();
        fx.step(1, Input::Text(&past)).await;
        assert!(fx.presenter.last_text(1).contains("in the past"));

        let future = (fx.now + Duration::days(1)).format(SCHEDULE_FORMAT).to_string();
        fx.step(1, Input::Text(&future)).await;
        assert!(fx.presenter.last_text(1).contains("photos or videos"));
    }

    #[tokio::test]
    async fn media_rejects_unsupported_kinds_and_caps_at_three() {
        let fx = Fixture::new().await;
        fx.engine.start(1, fx.now).await.unwrap();
        fx.step(1, Input::Text("Title")).await;
        fx.step(1, Input::Text("Description")).await;
        fx.step(1, Input::Select("cat:sport")).await;
        let when = (fx.now + Duration::days(1)).format(SCHEDULE_FORMAT).to_string();
        fx.step(1, Input::Text(&when)).await;

        fx.step(1, Input::UnsupportedMedia).await;
        assert!(fx.presenter.last_text(1).contains("Only photos and videos"));

        for i in 0..3 {
            fx.step(1, Input::Media(fx.photo(&format!("f{i}")))).await;
        }
        // Third attachment advances to the contact step.
        assert!(fx.presenter.last_text(1).contains("reach you"));
    }

    #[tokio::test]
    async fn back_at_media_pops_attachments_before_leaving_the_step() {
        let fx = Fixture::new().await;
        fx.engine.start(1, fx.now).await.unwrap();
        fx.step(1, Input::Text("Title")).await;
        fx.step(1, Input::Text("Description")).await;
        fx.step(1, Input::Select("cat:other")).await;
        let when = (fx.now + Duration::days(1)).format(SCHEDULE_FORMAT).to_string();
        fx.step(1, Input::Text(&when)).await;
        fx.step(1, Input::Media(fx.photo("a"))).await;
        fx.step(1, Input::Media(fx.photo("b"))).await;

        fx.step(1, Input::Select("back")).await;
        assert!(fx.presenter.last_text(1).contains("1/3 kept"));
        fx.step(1, Input::Select("back")).await;
        assert!(fx.presenter.last_text(1).contains("0/3 kept"));
        fx.step(1, Input::Select("back")).await;
        assert!(fx.presenter.last_text(1).contains("DD.MM.YYYY"));
    }

    #[tokio::test]
    async fn paid_tier_creates_nothing_until_the_invoice_settles() {
        let fx = Fixture::new().await;
        fx.to_lifetime(1).await;
        fx.step(1, Input::Select("life:48h")).await;

        // Confirming before requesting a link is a no-op.
        fx.step(1, Input::Select("pay:check")).await;
        assert!(fx.presenter.last_text(1).contains("Request a payment link first"));

        fx.step(1, Input::Select("pay:link")).await;
        assert!(fx.presenter.last_text(1).contains("https://pay.example/inv-1"));

        fx.step(1, Input::Select("pay:check")).await;
        assert!(fx.presenter.last_text(1).contains("not received"));
        assert!(fx.events().await.is_empty());

        fx.gateway.settle();
        fx.step(1, Input::Select("pay:check")).await;
        let events = fx.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].expire_at, fx.now + Duration::hours(48));
        assert!(fx.presenter.last_text(1).contains("Give your listing a push?"));
    }

    #[tokio::test]
    async fn settled_invoice_is_consumed_even_when_confirmation_delivery_fails() {
        let fx = Fixture::new().await;
        fx.to_lifetime(1).await;
        fx.step(1, Input::Select("life:48h")).await;
        fx.step(1, Input::Select("pay:link")).await;
        fx.gateway.settle();

        // The grant lands but the confirmation bounces.
        *fx.presenter.fail_texts.lock().unwrap() = true;
        assert!(fx
            .engine
            .handle(1, Input::Select("pay:check"), fx.now)
            .await
            .is_err());
        assert_eq!(fx.events().await.len(), 1);

        // One settled invoice must yield exactly one listing.
        *fx.presenter.fail_texts.lock().unwrap() = false;
        fx.step(1, Input::Select("pay:check")).await;
        assert_eq!(fx.events().await.len(), 1);
        assert!(fx.presenter.last_text(1).contains("Request a payment link first"));
    }

    #[tokio::test]
    async fn back_from_payment_discards_the_pending_invoice() {
        let fx = Fixture::new().await;
        fx.to_lifetime(1).await;
        fx.step(1, Input::Select("life:7d")).await;
        fx.step(1, Input::Select("pay:link")).await;

        fx.step(1, Input::Select("back")).await;
        assert!(fx.presenter.last_text(1).contains("stay visible"));

        fx.step(1, Input::Select("life:7d")).await;
        fx.step(1, Input::Select("pay:check")).await;
        assert!(fx.presenter.last_text(1).contains("Request a payment link first"));
    }

    #[tokio::test]
    async fn gateway_outage_reports_retry_and_keeps_state() {
        let fx = Fixture::with_gateway(MockGateway::down(), RecordingPresenter::default()).await;
        fx.to_lifetime(1).await;
        fx.step(1, Input::Select("life:48h")).await;
        fx.step(1, Input::Select("pay:link")).await;
        assert!(fx.presenter.last_text(1).contains("unavailable"));
        fx.step(1, Input::Select("pay:check")).await;
        assert!(fx.presenter.last_text(1).contains("Request a payment link first"));
        assert!(fx.events().await.is_empty());
    }

    #[tokio::test]
    async fn top_upsell_sets_boost_for_seven_days() {
        let fx = Fixture::new().await;
        fx.to_lifetime(1).await;
        fx.step(1, Input::Select("life:free")).await;
        fx.step(1, Input::Select("up:top")).await;
        fx.step(1, Input::Select("pay:link")).await;
        fx.gateway.settle();
        fx.step(1, Input::Select("pay:check")).await;

        let events = fx.events().await;
        assert!(events[0].is_top);
        assert_eq!(events[0].top_expire_at, Some(fx.now + Duration::days(TOP_DAYS)));
        assert!(!fx.engine.is_active(1).await);
    }

    #[tokio::test]
    async fn push_upsell_broadcasts_tolerating_failed_recipients() {
        let mut presenter = RecordingPresenter::default();
        presenter.failing.insert(3);
        let fx = Fixture::with_gateway(MockGateway::working(), presenter).await;
        fx.store
            .update_users(|doc| {
                for id in [2, 3] {
                    doc.users.insert(
                        id,
                        UserSnapshot {
                            lat: Some(BERLIN.0),
                            lon: Some(BERLIN.1),
                            last_seen: fx.now,
                        },
                    );
                }
                // Too far away.
                doc.users.insert(
                    4,
                    UserSnapshot {
                        lat: Some(48.8566),
                        lon: Some(2.3522),
                        last_seen: fx.now,
                    },
                );
                // Too stale.
                doc.users.insert(
                    5,
                    UserSnapshot {
                        lat: Some(BERLIN.0),
                        lon: Some(BERLIN.1),
                        last_seen: fx.now - Duration::days(31),
                    },
                );
            })
            .await
            .unwrap();

        fx.to_lifetime(1).await;
        fx.step(1, Input::Select("life:free")).await;
        fx.step(1, Input::Select("up:push")).await;
        fx.step(1, Input::Select("pay:link")).await;
        fx.gateway.settle();
        fx.step(1, Input::Select("pay:check")).await;

        // User 2 delivered, user 3 failed but did not abort the batch,
        // the author is skipped.
        assert_eq!(fx.presenter.listing_targets(), vec![2]);
        assert!(fx.presenter.last_text(1).contains("Broadcast sent to 1"));
        assert!(!fx.engine.is_active(1).await);
    }

    #[tokio::test]
    async fn banner_cap_rejects_the_fourth_regional_banner() {
        let fx = Fixture::new().await;
        let banner = |i: u32| Banner {
            media: MediaItem {
                kind: MediaKind::Photo,
                file_ref: format!("banner-{i}"),
            },
            url: None,
            region: Region::At {
                lat: BERLIN.0,
                lon: BERLIN.1,
            },
            expire_at: fx.now + Duration::days(7),
        };
        for i in 0..3 {
            assert_eq!(
                fx.engine.place_banner(banner(i), fx.now).await.unwrap(),
                BannerPlacement::Placed
            );
        }
        assert_eq!(
            fx.engine.place_banner(banner(3), fx.now).await.unwrap(),
            BannerPlacement::RegionFull
        );

        // A global banner is not bound by the regional cap.
        let mut global = banner(4);
        global.region = Region::Global;
        assert_eq!(
            fx.engine.place_banner(global, fx.now).await.unwrap(),
            BannerPlacement::Placed
        );
        assert_eq!(fx.store.banners().await.banners.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_placements_cannot_exceed_the_region_cap() {
        let fx = Fixture::new().await;
        let banner = |name: &str| Banner {
            media: MediaItem {
                kind: MediaKind::Photo,
                file_ref: name.into(),
            },
            url: None,
            region: Region::At {
                lat: BERLIN.0,
                lon: BERLIN.1,
            },
            expire_at: fx.now + Duration::days(7),
        };
        fx.store
            .update_banners(|doc| {
                doc.banners.push(banner("seed-1"));
                doc.banners.push(banner("seed-2"));
            })
            .await
            .unwrap();

        // Both placements race for the one remaining slot.
        let (a, b) = tokio::join!(
            fx.engine.place_banner(banner("race-a"), fx.now),
            fx.engine.place_banner(banner("race-b"), fx.now)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert!(outcomes.contains(&BannerPlacement::Placed));
        assert!(outcomes.contains(&BannerPlacement::RegionFull));
        assert_eq!(fx.store.banners().await.banners.len(), 3);
    }

    #[tokio::test]
    async fn expired_banners_free_their_region_slots() {
        let fx = Fixture::new().await;
        fx.store
            .update_banners(|doc| {
                for i in 0..3 {
                    doc.banners.push(Banner {
                        media: MediaItem {
                            kind: MediaKind::Photo,
                            file_ref: format!("old-{i}"),
                        },
                        url: None,
                        region: Region::At {
                            lat: BERLIN.0,
                            lon: BERLIN.1,
                        },
                        expire_at: fx.now - Duration::days(1),
                    });
                }
            })
            .await
            .unwrap();
        let fresh = Banner {
            media: MediaItem {
                kind: MediaKind::Photo,
                file_ref: "new".into(),
            },
            url: None,
            region: Region::At {
                lat: BERLIN.0,
                lon: BERLIN.1,
            },
            expire_at: fx.now + Duration::days(7),
        };
        assert_eq!(
            fx.engine.place_banner(fresh, fx.now).await.unwrap(),
            BannerPlacement::Placed
        );
    }

    #[tokio::test]
    async fn stale_sessions_are_evicted() {
        let fx = Fixture::new().await;
        fx.engine.start(1, fx.now).await.unwrap();
        assert!(fx.engine.is_active(1).await);
        assert_eq!(fx.engine.evict_stale(fx.now + Duration::hours(1)).await, 0);
        assert_eq!(fx.engine.evict_stale(fx.now + Duration::hours(25)).await, 1);
        assert!(!fx.engine.is_active(1).await);
    }

    #[tokio::test]
    async fn renewal_extends_the_listing_after_payment() {
        let fx = Fixture::new().await;
        let expire_at = fx.now + Duration::hours(1);
        fx.store
            .update_events(|doc| {
                let mut ev = crate::model::tests::sample_event(doc.next_id, expire_at);
                ev.author = 1;
                doc.next_id += 1;
                doc.events.push(ev);
            })
            .await
            .unwrap();

        fx.engine
            .start_renewal(1, 1, LifetimeTier::Week, fx.now)
            .await
            .unwrap();
        fx.step(1, Input::Select("pay:link")).await;
        fx.gateway.settle();
        fx.step(1, Input::Select("pay:check")).await;

        let events = fx.events().await;
        assert_eq!(events[0].expire_at, expire_at + Duration::hours(7 * 24));
        assert!(!fx.engine.is_active(1).await);
    }

    #[tokio::test]
    async fn renewal_of_a_foreign_listing_is_refused() {
        let fx = Fixture::new().await;
        fx.store
            .update_events(|doc| {
                let mut ev = crate::model::tests::sample_event(doc.next_id, fx.now + Duration::hours(1));
                ev.author = 77;
                doc.next_id += 1;
                doc.events.push(ev);
            })
            .await
            .unwrap();
        fx.engine
            .start_renewal(1, 1, LifetimeTier::Week, fx.now)
            .await
            .unwrap();
        assert!(!fx.engine.is_active(1).await);
        assert!(fx.presenter.last_text(1).contains("no longer exists"));
    }
}
