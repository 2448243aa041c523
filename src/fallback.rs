//! Synthesized responses for when neither cache nor network can answer.
//!
//! Nothing here touches the network or can fail.

use reqwest::StatusCode;

use crate::http::{AcceptKind, Request, Response};

/// Error envelope returned to callers expecting JSON.
pub const OFFLINE_JSON: &str = r#"{"error":"offline","offline":true}"#;

#[derive(Debug, Clone)]
pub struct FallbackProvider {
  app_name: String,
  api_prefix: String,
}

impl FallbackProvider {
  pub fn new(app_name: &str, api_prefix: &str) -> Self {
    Self {
      app_name: app_name.to_string(),
      api_prefix: api_prefix.to_string(),
    }
  }

  pub fn respond(&self, request: &Request) -> Response {
    match request.accepts(&self.api_prefix) {
      AcceptKind::Document => self.offline_page(),
      AcceptKind::Json => Response::json(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_JSON),
      AcceptKind::Other => Response::new(StatusCode::SERVICE_UNAVAILABLE, Vec::new()),
    }
  }

  fn offline_page(&self) -> Response {
    let name = escape_html(&self.app_name);
    let body = format!(
      r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{name} - Offline</title>
<style>
body {{ font-family: system-ui, sans-serif; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; background: #f5f7fa; color: #1f2933; }}
main {{ max-width: 28rem; padding: 2rem; text-align: center; }}
button {{ margin-top: 1rem; padding: 0.6rem 1.4rem; border: 0; border-radius: 6px; background: #2563eb; color: #fff; font-size: 1rem; cursor: pointer; }}
</style>
</head>
<body>
<main>
<h1>You're offline</h1>
<p>{name} can't reach the network right now. Pages you've already opened are still available, and any changes you make are saved and will be sent when you're back online.</p>
<button onclick="location.reload()">Try again</button>
</main>
</body>
</html>
"#
    );

    Response::new(StatusCode::SERVICE_UNAVAILABLE, body)
      .with_header("content-type", "text/html; charset=utf-8")
  }
}

fn escape_html(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    match c {
      '&' => out.push_str("&amp;"),
      '<' => out.push_str("&lt;"),
      '>' => out.push_str("&gt;"),
      '"' => out.push_str("&quot;"),
      '\'' => out.push_str("&#39;"),
      _ => out.push(c),
    }
  }
  out
}
