//! Push notifications and routing of notification clicks back to a page.

use std::sync::{Arc, Mutex, MutexGuard};

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::clients::{Client, Clients};

/// Incoming push message. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub tag: Option<String>,
  pub url: Option<String>,
}

impl PushPayload {
  /// Decode a push body. Anything that is not a JSON object is shown as
  /// plain text.
  pub fn parse(data: &[u8]) -> Self {
    match serde_json::from_slice::<PushPayload>(data) {
      Ok(payload) => payload,
      Err(_) => {
        let text = String::from_utf8_lossy(data).trim().to_string();
        Self {
          body: (!text.is_empty()).then_some(text),
          ..Self::default()
        }
      }
    }
  }
}

/// A notification currently on display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub id: u64,
  pub title: String,
  pub body: String,
  pub tag: Option<String>,
  pub target: Url,
}

/// What a click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// An open client already showed the target and was focused
  Focused(Client),
  /// A new client was opened at the target
  Opened(Client),
}

#[derive(Default)]
struct Shown {
  next_id: u64,
  notifications: Vec<Notification>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
  app_name: String,
  origin: Url,
  clients: Clients,
  shown: Arc<Mutex<Shown>>,
}

impl NotificationDispatcher {
  pub fn new(app_name: &str, origin: Url, clients: Clients) -> Self {
    Self {
      app_name: app_name.to_string(),
      origin,
      clients,
      shown: Arc::new(Mutex::new(Shown::default())),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Shown>> {
    self.shown.lock().map_err(|_| eyre!("Lock poisoned"))
  }

  /// Show a notification for a push message. A notification with the same
  /// tag as one already shown replaces it in place.
  pub fn push(&self, data: &[u8]) -> Result<Notification> {
    let payload = PushPayload::parse(data);
    let target = self.resolve(payload.url.as_deref().unwrap_or("/"));

    let mut shown = self.lock()?;
    shown.next_id += 1;
    let notification = Notification {
      id: shown.next_id,
      title: payload.title.unwrap_or_else(|| self.app_name.clone()),
      body: payload.body.unwrap_or_default(),
      tag: payload.tag,
      target,
    };

    let existing = notification.tag.as_ref().and_then(|tag| {
      shown
        .notifications
        .iter()
        .position(|n| n.tag.as_ref() == Some(tag))
    });
    match existing {
      Some(index) => {
        debug!(tag = ?notification.tag, "Replacing notification with same tag");
        shown.notifications[index] = notification.clone();
      }
      None => shown.notifications.push(notification.clone()),
    }

    info!(id = notification.id, title = %notification.title, "Showing notification");
    Ok(notification)
  }

  /// Notifications on display, in the order they were first shown.
  pub fn active(&self) -> Result<Vec<Notification>> {
    Ok(self.lock()?.notifications.clone())
  }

  /// Handle a click: close the notification, then focus a client already at
  /// its target or open a new one there. `None` if no such notification is
  /// shown.
  pub fn click(&self, id: u64) -> Result<Option<ClickOutcome>> {
    let notification = {
      let mut shown = self.lock()?;
      match shown.notifications.iter().position(|n| n.id == id) {
        Some(index) => shown.notifications.remove(index),
        None => return Ok(None),
      }
    };

    let existing = self
      .clients
      .match_all()?
      .into_iter()
      .find(|client| same_page(&client.url, &notification.target));

    if let Some(client) = existing {
      if let Some(client) = self.clients.focus(client.id)? {
        debug!(client_id = client.id, "Focusing existing client");
        return Ok(Some(ClickOutcome::Focused(client)));
      }
    }

    let client = self.clients.open_window(notification.target)?;
    debug!(client_id = client.id, url = %client.url, "Opened client for notification");
    Ok(Some(ClickOutcome::Opened(client)))
  }

  /// Resolve a payload URL against the origin; unparseable targets go to
  /// the root page.
  fn resolve(&self, target: &str) -> Url {
    self
      .origin
      .join(target)
      .unwrap_or_else(|_| self.origin.clone())
  }
}

fn same_page(a: &Url, b: &Url) -> bool {
  let (mut a, mut b) = (a.clone(), b.clone());
  a.set_fragment(None);
  b.set_fragment(None);
  a == b
}
