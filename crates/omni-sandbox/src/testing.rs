//! Local HTTP stand-ins for the services the network backends talk to.

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;

/// One request seen by a stub service.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub method: String,
    pub path: String,
    pub body: Value,
    pub api_key: Option<String>,
}

/// Requests a stub has served, in arrival order.
#[derive(Clone, Default)]
pub(crate) struct Recorder(Arc<Mutex<Vec<Recorded>>>);

impl Recorder {
    pub fn record(&self, method: &str, path: impl Into<String>, headers: &HeaderMap, body: Value) {
        let api_key = ["x-api-key", "x-session-api-key"]
            .iter()
            .find_map(|name| headers.get(*name))
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        self.0.lock().push(Recorded {
            method: method.to_owned(),
            path: path.into(),
            body,
            api_key,
        });
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.0.lock().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .map(|request| format!("{} {}", request.method, request.path))
            .collect()
    }
}

/// Binds an ephemeral port so handlers can learn their own base URL before
/// the router is built.
pub(crate) async fn bind() -> anyhow::Result<(TcpListener, String)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}", listener.local_addr()?);
    Ok((listener, url))
}

pub(crate) fn serve(listener: TcpListener, router: Router) {
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
}
