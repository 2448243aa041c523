//! Registry of open page instances ("clients") served by the agent.

use std::sync::{Arc, Mutex, MutexGuard};

use color_eyre::{eyre::eyre, Result};
use tracing::debug;
use url::Url;

use crate::cache::CacheGeneration;

/// One open page instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
  pub id: u64,
  pub url: Url,
  pub focused: bool,
  /// Generation currently intercepting this client's requests, if any
  pub controller: Option<CacheGeneration>,
}

#[derive(Default)]
struct ClientsInner {
  next_id: u64,
  clients: Vec<Client>,
}

/// Shared handle to the client registry. Clones see the same clients.
#[derive(Clone, Default)]
pub struct Clients {
  inner: Arc<Mutex<ClientsInner>>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, ClientsInner>> {
    self.inner.lock().map_err(|_| eyre!("Lock poisoned"))
  }

  /// Open a new page at `url`. The new page takes focus and starts out
  /// uncontrolled until a generation claims it.
  pub fn open_window(&self, url: Url) -> Result<Client> {
    let mut inner = self.lock()?;
    inner.next_id += 1;

    for client in &mut inner.clients {
      client.focused = false;
    }

    let client = Client {
      id: inner.next_id,
      url,
      focused: true,
      controller: None,
    };
    inner.clients.push(client.clone());
    debug!(client_id = client.id, url = %client.url, "Opened client");
    Ok(client)
  }

  pub fn close(&self, id: u64) -> Result<bool> {
    let mut inner = self.lock()?;
    let before = inner.clients.len();
    inner.clients.retain(|c| c.id != id);
    Ok(inner.clients.len() != before)
  }

  /// Give focus to one client. Returns `None` if it is no longer open.
  pub fn focus(&self, id: u64) -> Result<Option<Client>> {
    let mut inner = self.lock()?;
    if !inner.clients.iter().any(|c| c.id == id) {
      return Ok(None);
    }

    let mut focused = None;
    for client in &mut inner.clients {
      client.focused = client.id == id;
      if client.focused {
        focused = Some(client.clone());
      }
    }
    Ok(focused)
  }

  pub fn navigate(&self, id: u64, url: Url) -> Result<Option<Client>> {
    let mut inner = self.lock()?;
    Ok(inner.clients.iter_mut().find(|c| c.id == id).map(|client| {
      client.url = url;
      client.clone()
    }))
  }

  /// Snapshot of every open client, oldest first.
  pub fn match_all(&self) -> Result<Vec<Client>> {
    Ok(self.lock()?.clients.clone())
  }

  /// Put every open client under `generation`'s control. Returns how many
  /// changed controller.
  pub fn claim(&self, generation: &CacheGeneration) -> Result<usize> {
    let mut inner = self.lock()?;
    let mut claimed = 0;
    for client in &mut inner.clients {
      if client.controller.as_ref() != Some(generation) {
        client.controller = Some(generation.clone());
        claimed += 1;
      }
    }
    Ok(claimed)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.lock()?.clients.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(path: &str) -> Url {
    Url::parse(&format!("http://app.test{}", path)).unwrap()
  }

  #[test]
  fn test_open_focuses_newest() {
    let clients = Clients::new();
    let a = clients.open_window(url("/")).unwrap();
    let b = clients.open_window(url("/calculator")).unwrap();

    assert_ne!(a.id, b.id);
    let all = clients.match_all().unwrap();
    assert!(!all[0].focused);
    assert!(all[1].focused);
  }

  #[test]
  fn test_focus_and_close() {
    let clients = Clients::new();
    let a = clients.open_window(url("/")).unwrap();
    clients.open_window(url("/portfolio")).unwrap();

    assert!(clients.focus(a.id).unwrap().unwrap().focused);
    assert!(clients.close(a.id).unwrap());
    assert!(!clients.close(a.id).unwrap());
    assert!(clients.focus(a.id).unwrap().is_none());
    assert_eq!(clients.len().unwrap(), 1);
  }

  #[test]
  fn test_navigate_changes_url() {
    let clients = Clients::new();
    let a = clients.open_window(url("/")).unwrap();
    let moved = clients.navigate(a.id, url("/settings")).unwrap().unwrap();
    assert_eq!(moved.url.path(), "/settings");
  }

  #[test]
  fn test_claim_takes_over_every_client() {
    let clients = Clients::new();
    clients.open_window(url("/")).unwrap();
    clients.open_window(url("/calculator")).unwrap();

    let v2 = CacheGeneration::new("v2");
    assert_eq!(clients.claim(&v2).unwrap(), 2);
    assert_eq!(clients.claim(&v2).unwrap(), 0);
    assert!(clients
      .match_all()
      .unwrap()
      .iter()
      .all(|c| c.controller.as_ref() == Some(&v2)));
  }
}
