//! File-backed storage for the four persisted collections.
//!
//! Each collection lives in its own JSON document under the store root and
//! is replaced atomically on save (write to a temp file, then rename), so a
//! crash never exposes a partially written document. Every mutation runs
//! under a per-collection mutex held across the whole read-modify-write,
//! which serializes writers and rules out lost updates between concurrent
//! tasks.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::error;

use crate::model::{BannersDoc, EventsDoc, FavoritesDoc, UsersDoc};

const EVENTS_FILE: &str = "events.json";
const BANNERS_FILE: &str = "banners.json";
const USERS_FILE: &str = "users.json";
const FAVORITES_FILE: &str = "favorites.json";

/// Persistent store rooted at a directory, shared via [`Arc`].
pub struct Store {
    root: PathBuf,
    events: Mutex<EventsDoc>,
    banners: Mutex<BannersDoc>,
    users: Mutex<UsersDoc>,
    favorites: Mutex<FavoritesDoc>,
}

impl Store {
    /// Open the store, loading all four documents. A missing file yields the
    /// empty default; an unreadable one is quarantined with a `.corrupt`
    /// suffix and logged before falling back to the default.
    pub fn open(root: impl Into<PathBuf>) -> Result<Arc<Store>> {
        let root = root.into();
        fs::create_dir_all(&root).context("creating store root")?;
        Ok(Arc::new(Store {
            events: Mutex::new(load_doc(&root, EVENTS_FILE)),
            banners: Mutex::new(load_doc(&root, BANNERS_FILE)),
            users: Mutex::new(load_doc(&root, USERS_FILE)),
            favorites: Mutex::new(load_doc(&root, FAVORITES_FILE)),
            root,
        }))
    }

    /// Snapshot of the events document.
    pub async fn events(&self) -> EventsDoc {
        self.events.lock().await.clone()
    }

    pub async fn banners(&self) -> BannersDoc {
        self.banners.lock().await.clone()
    }

    pub async fn users(&self) -> UsersDoc {
        self.users.lock().await.clone()
    }

    pub async fn favorites(&self) -> FavoritesDoc {
        self.favorites.lock().await.clone()
    }

    /// Mutate the events document and persist it, all under its lock.
    /// The save is skipped when the closure leaves the document unchanged.
    pub async fn update_events<R>(&self, f: impl FnOnce(&mut EventsDoc) -> R) -> Result<R> {
        let mut doc = self.events.lock().await;
        let before = doc.clone();
        let out = f(&mut doc);
        if *doc != before {
            save_doc(&self.root, EVENTS_FILE, &*doc)?;
        }
        Ok(out)
    }

    pub async fn update_banners<R>(&self, f: impl FnOnce(&mut BannersDoc) -> R) -> Result<R> {
        let mut doc = self.banners.lock().await;
        let before = doc.clone();
        let out = f(&mut doc);
        if *doc != before {
            save_doc(&self.root, BANNERS_FILE, &*doc)?;
        }
        Ok(out)
    }

    pub async fn update_users<R>(&self, f: impl FnOnce(&mut UsersDoc) -> R) -> Result<R> {
        let mut doc = self.users.lock().await;
        let before = doc.clone();
        let out = f(&mut doc);
        if *doc != before {
            save_doc(&self.root, USERS_FILE, &*doc)?;
        }
        Ok(out)
    }

    pub async fn update_favorites<R>(&self, f: impl FnOnce(&mut FavoritesDoc) -> R) -> Result<R> {
        let mut doc = self.favorites.lock().await;
        let before = doc.clone();
        let out = f(&mut doc);
        if *doc != before {
            save_doc(&self.root, FAVORITES_FILE, &*doc)?;
        }
        Ok(out)
    }
}

/// Load a document, downgrading a missing file to the default and
/// quarantining a corrupt one.
fn load_doc<T: DeserializeOwned + Default>(root: &Path, name: &str) -> T {
    let path = root.join(name);
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(_) => return T::default(),
    };
    match serde_json::from_str(&data) {
        Ok(doc) => doc,
        Err(e) => {
            let quarantine = root.join(format!("{name}.corrupt"));
            if let Err(mv) = fs::rename(&path, &quarantine) {
                error!(file = name, error = %mv, "failed to quarantine corrupt document");
            }
            error!(
                file = name,
                error = %e,
                quarantine = %quarantine.display(),
                "corrupt document, starting from empty collection"
            );
            T::default()
        }
    }
}

/// Write a document atomically: serialize into a temp file in the store
/// root, then rename over the target.
fn save_doc<T: Serialize>(root: &Path, name: &str, doc: &T) -> Result<()> {
    let tmp = tempfile::NamedTempFile::new_in(root).context("creating temp file")?;
    serde_json::to_writer(&tmp, doc).context("serializing document")?;
    tmp.persist(root.join(name))
        .with_context(|| format!("replacing {name}"))?;
    Ok(())
}
