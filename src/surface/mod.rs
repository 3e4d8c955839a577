//! Generic capability surface engine.
//!
//! Every capability repeats the same `Uninitialised → Seeding → Live` shape:
//! issue a get-request, decode the reply, subscribe to the notify channel,
//! and keep a cache coherent with pushed updates. [seed] and [seed_once]
//! extract that shape once instead of twelve times.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::StreamExt;

use crate::{
    dispatcher::{Dispatcher, Key},
    error::Error,
};

pub mod kinds;

/// A live, continuously updated cached value for one capability.
///
/// Cloning is cheap; every clone observes the same underlying value.
#[derive(Clone)]
pub struct Cache<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> Cache<T> {
    pub(crate) fn from_receiver(rx: watch::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Returns the most recently observed value.
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Waits for the next change, returning the new value, or `None` once no
    /// further updates can ever arrive (the session has closed).
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow().clone())
    }
}

/// Seeds a capability that receives unsolicited notifications: issues
/// `get_key`'s request, decodes the reply, subscribes to `notify_key`, and
/// spawns a task that keeps the returned [Cache] coherent with pushed
/// updates.
///
/// Returns `Err` if the get-request or its decode fails; the caller must
/// treat that as the capability being silently absent.
pub async fn seed<T, F>(
    dispatcher: Arc<Dispatcher>, get_key: Key, notify_key: Key, get_request: Vec<u8>, decode: F,
) -> Result<Cache<T>, Error>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&[u8]) -> Result<T, Error> + Send + Sync + 'static,
{
    let reply = dispatcher.call(get_key, get_request).await?;
    let initial = decode(&reply)?;

    let (tx, rx) = watch::channel(initial);
    let mut notifications = dispatcher.subscribe(notify_key).await;

    tokio::spawn(async move {
        while let Some(body) = notifications.next().await {
            match decode(&body) {
                Ok(value) => {
                    if tx.send(value).is_err() {
                        break; // every Cache dropped; no one left to notify
                    }
                }
                Err(err) => log::warn!("dropping unparsable notification for {notify_key:?}: {err}"),
            }
        }
    });

    Ok(Cache::from_receiver(rx))
}

/// Seeds a capability with no notify channel (e.g. [kinds::Identity]):
/// issues `get_key`'s request once and decodes the reply into a [Cache] that
/// never changes again.
pub async fn seed_once<T, F>(
    dispatcher: Arc<Dispatcher>, get_key: Key, get_request: Vec<u8>, decode: F,
) -> Result<Cache<T>, Error>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&[u8]) -> Result<T, Error>,
{
    let reply = dispatcher.call(get_key, get_request).await?;
    let value = decode(&reply)?;
    let (_tx, rx) = watch::channel(value);
    Ok(Cache::from_receiver(rx))
}
