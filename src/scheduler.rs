//! Background passes: boost demotion, renewal reminders, expiry sweeping.
//!
//! Each pass is a pure function over the store for a given instant, so the
//! temporal logic is testable without clocks; the loops wrap them with a
//! fixed wake interval and run until the process dies.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::model::LifetimeTier;
use crate::presenter::{Button, Presenter};
use crate::storage::Store;

/// Wake interval of the notifier / boost-demotion loop.
pub const NOTIFIER_INTERVAL: StdDuration = StdDuration::from_secs(5 * 60);

/// Wake interval of the expiry sweeper.
pub const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(10 * 60);

/// How far ahead of expiry the renewal reminder fires, in hours.
pub const RENEWAL_LEAD_HOURS: i64 = 2;

/// One notifier pass: demote lapsed boosts and send each owner at most one
/// renewal reminder once their listing enters the lead window. All event
/// mutations land in a single batched save.
pub async fn notifier_pass(
    store: &Store,
    presenter: &dyn Presenter,
    now: DateTime<Utc>,
) -> Result<()> {
    let reminders = store
        .update_events(|doc| {
            let mut reminders = Vec::new();
            for ev in &mut doc.events {
                if ev.is_top && ev.top_expire_at.map_or(true, |t| t <= now) {
                    ev.is_top = false;
                    ev.top_expire_at = None;
                }
                let remaining = ev.expire_at - now;
                if !ev.notified
                    && remaining > Duration::zero()
                    && remaining <= Duration::hours(RENEWAL_LEAD_HOURS)
                {
                    ev.notified = true;
                    reminders.push((ev.author, ev.id, ev.title.clone(), ev.expire_at));
                }
            }
            reminders
        })
        .await?;

    for (author, id, title, expire_at) in reminders {
        let keyboard = LifetimeTier::PAID
            .into_iter()
            .map(|t| vec![Button::new(t.label(), format!("renew:{id}:{}", t.token()))])
            .collect();
        let text = format!(
            "Your listing \"{title}\" goes offline at {}. Extend it?",
            expire_at.format("%d.%m.%Y %H:%M")
        );
        if let Err(e) = presenter.send_text(author, &text, Some(keyboard)).await {
            // The reminder stays consumed: at most one per listing, ever.
            warn!(author, event = id, error = %e, "renewal reminder failed");
        }
    }
    Ok(())
}

/// One sweep pass: drop expired listings (telling their owners) and
/// expired banners. Nothing is written when nothing expired.
pub async fn sweep_pass(store: &Store, presenter: &dyn Presenter, now: DateTime<Utc>) -> Result<()> {
    let removed = store
        .update_events(|doc| {
            let (gone, kept): (Vec<_>, Vec<_>) =
                doc.events.drain(..).partition(|ev| ev.expire_at <= now);
            doc.events = kept;
            gone
        })
        .await?;

    for ev in &removed {
        let text = format!("Your listing \"{}\" has expired and was removed.", ev.title);
        if let Err(e) = presenter.send_text(ev.author, &text, None).await {
            warn!(author = ev.author, event = ev.id, error = %e, "expiry notice failed");
        }
    }
    if !removed.is_empty() {
        info!(count = removed.len(), "swept expired listings");
    }

    let banners_dropped = store
        .update_banners(|doc| {
            let before = doc.banners.len();
            doc.banners.retain(|b| b.expire_at > now);
            before - doc.banners.len()
        })
        .await?;
    if banners_dropped > 0 {
        info!(count = banners_dropped, "swept expired banners");
    }
    Ok(())
}

/// Run the notifier pass forever on its interval.
pub async fn notifier_loop(store: Arc<Store>, presenter: Arc<dyn Presenter>) {
    loop {
        if let Err(e) = notifier_pass(&store, presenter.as_ref(), Utc::now()).await {
            error!(error = %e, "notifier pass failed");
        }
        sleep(NOTIFIER_INTERVAL).await;
    }
}

/// Run the sweep pass forever on its interval.
pub async fn sweep_loop(store: Arc<Store>, presenter: Arc<dyn Presenter>) {
    loop {
        if let Err(e) = sweep_pass(&store, presenter.as_ref(), Utc::now()).await {
            error!(error = %e, "sweep pass failed");
        }
        sleep(SWEEP_INTERVAL).await;
    }
}
