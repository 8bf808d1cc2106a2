//! Host ops behind the capability context
//!
//! Every function on a plugin's `ctx` bottoms out in one of these ops. The ops
//! read their host resources from the runtime's `OpState`, which the sandbox
//! seeds with [`HostServices`], a [`SettledQueue`] and [`CancelledCalls`].

use anyhow::anyhow;
use deno_core::{op2, Extension, Op, OpState};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::capability::HostServices;
use super::fetcher::read_capped_text;
use super::protocol::{ErrorKind, RequestId, RuntimeMessage};
use crate::core::error::{HostError, Result};

/// Request issued through `ctx.http`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    /// Final URL after redirects
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Element matched by `ctx.parseHtml(..).select(..)`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HtmlElement {
    pub tag: String,
    pub text: String,
    pub html: String,
    pub attrs: HashMap<String, String>,
}

/// Failure reported by the sandbox for one call
#[derive(Debug, Clone, Deserialize)]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

/// Final outcome of one sandboxed call
#[derive(Debug, Clone, Deserialize)]
pub struct Settlement {
    pub call: u64,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<Fault>,
}

impl Settlement {
    pub fn failed(call: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            call,
            success: false,
            result: Value::Null,
            error: Some(Fault {
                kind,
                message: message.into(),
                stack: None,
            }),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        if self.success {
            return Ok(self.result);
        }
        let fault = self.error.unwrap_or_else(|| Fault {
            kind: ErrorKind::Execution,
            message: "plugin call failed without an error".to_string(),
            stack: None,
        });
        Err(HostError::from_remote(fault.kind, fault.message, fault.stack))
    }

    pub fn into_message(self) -> RuntimeMessage {
        let id = RequestId(self.call);
        if self.success {
            return RuntimeMessage::success(id, self.result);
        }
        match self.error {
            Some(fault) => RuntimeMessage::failure(id, fault.kind, fault.message, fault.stack),
            None => RuntimeMessage::failure(
                id,
                ErrorKind::Execution,
                "plugin call failed without an error".to_string(),
                None,
            ),
        }
    }
}

/// Settlements reported by `op_settle`, drained by the engine
#[derive(Clone, Default)]
pub struct SettledQueue(pub Rc<RefCell<VecDeque<Settlement>>>);

/// Calls the host gave up on; `ctx.isCancelled()` reads this set
#[derive(Default)]
pub struct CancelledCalls(pub HashSet<u64>);

#[op2(async)]
#[serde]
pub async fn op_http_request(
    state: Rc<RefCell<OpState>>,
    #[string] plugin: String,
    #[serde] request: HttpRequest,
) -> std::result::Result<HttpResponse, anyhow::Error> {
    let services = state.borrow().borrow::<HostServices>().clone();

    if let Err(e) = services.policy.check(&request.url) {
        services.traffic.record_denied();
        warn!(plugin = %plugin, url = %request.url, "Plugin network request denied");
        return Err(anyhow!(e.to_string()));
    }
    services.traffic.record_request();

    let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
        .map_err(|_| anyhow!("Invalid HTTP method: {}", request.method))?;

    info!(plugin = %plugin, method = %method, url = %request.url, "Plugin network request");

    let mut builder = services.client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send().await.map_err(|e| {
        error!(plugin = %plugin, url = %request.url, error = %e, "Plugin network request failed");
        anyhow!("Request to {} failed: {}", request.url, e)
    })?;

    let status = response.status().as_u16();
    let url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect();
    let body = read_capped_text(response, services.max_body_bytes)
        .await
        .map_err(|e| {
            warn!(plugin = %plugin, url = %request.url, error = %e, "Plugin network response rejected");
            anyhow!(e.to_string())
        })?;

    debug!(plugin = %plugin, status, bytes = body.len(), "Plugin network response");

    Ok(HttpResponse {
        status,
        url,
        headers,
        body,
    })
}

#[op2]
#[serde]
pub fn op_html_select(
    #[string] html: String,
    #[string] selector: String,
) -> std::result::Result<Vec<HtmlElement>, anyhow::Error> {
    select_html(&html, &selector)
}

pub fn select_html(html: &str, selector: &str) -> std::result::Result<Vec<HtmlElement>, anyhow::Error> {
    let parsed =
        Selector::parse(selector).map_err(|e| anyhow!("Invalid selector '{}': {}", selector, e))?;
    let document = Html::parse_document(html);

    Ok(document
        .select(&parsed)
        .map(|element| HtmlElement {
            tag: element.value().name().to_string(),
            text: element.text().collect::<String>(),
            html: element.inner_html(),
            attrs: element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
        .collect())
}

#[op2]
#[string]
pub fn op_url_join(
    #[string] base: String,
    #[string] path: String,
) -> std::result::Result<String, anyhow::Error> {
    join_url(&base, &path)
}

/// Resolve `path` against `base`; an empty base only accepts absolute URLs
pub fn join_url(base: &str, path: &str) -> std::result::Result<String, anyhow::Error> {
    if base.is_empty() {
        return Url::parse(path)
            .map(String::from)
            .map_err(|e| anyhow!("Cannot resolve '{}' without a base URL: {}", path, e));
    }
    let base = Url::parse(base).map_err(|e| anyhow!("Invalid base URL '{}': {}", base, e))?;
    base.join(path)
        .map(String::from)
        .map_err(|e| anyhow!("Cannot resolve '{}': {}", path, e))
}

#[op2(fast)]
pub fn op_plugin_log(#[string] plugin: &str, #[string] level: &str, #[string] message: &str) {
    match level {
        "debug" => debug!(plugin = %plugin, "{}", message),
        "warn" => warn!(plugin = %plugin, "{}", message),
        "error" => error!(plugin = %plugin, "{}", message),
        _ => info!(plugin = %plugin, "{}", message),
    }
}

/// Session values cross the boundary as JSON text
#[op2]
#[string]
pub fn op_session_get(
    state: &mut OpState,
    #[string] plugin: String,
    #[string] key: String,
) -> Option<String> {
    state
        .borrow::<HostServices>()
        .sessions
        .get(&plugin, &key)
        .map(|value| value.to_string())
}

#[op2(fast)]
pub fn op_session_set(
    state: &mut OpState,
    #[string] plugin: &str,
    #[string] key: &str,
    #[string] value: &str,
) {
    match serde_json::from_str::<Value>(value) {
        Ok(value) => state.borrow::<HostServices>().sessions.set(plugin, key, value),
        Err(e) => warn!(plugin = %plugin, key = %key, error = %e, "Ignoring unserializable session value"),
    }
}

#[op2(fast)]
pub fn op_session_delete(state: &mut OpState, #[string] plugin: &str, #[string] key: &str) -> bool {
    state.borrow::<HostServices>().sessions.delete(plugin, key)
}

#[op2(fast)]
pub fn op_call_cancelled(state: &mut OpState, #[string] call: &str) -> bool {
    call.parse::<u64>()
        .map(|call| state.borrow::<CancelledCalls>().0.contains(&call))
        .unwrap_or(false)
}

#[op2(fast)]
pub fn op_settle(state: &mut OpState, #[string] settlement: &str) {
    match serde_json::from_str::<Settlement>(settlement) {
        Ok(settlement) => state
            .borrow::<SettledQueue>()
            .0
            .borrow_mut()
            .push_back(settlement),
        Err(e) => error!(error = %e, "Malformed settlement from sandbox"),
    }
}

/// Extension carrying every host op
pub fn host_extension() -> Extension {
    Extension {
        name: "extension_host",
        ops: std::borrow::Cow::Borrowed(&[
            op_http_request::DECL,
            op_html_select::DECL,
            op_url_join::DECL,
            op_plugin_log::DECL,
            op_session_get::DECL,
            op_session_set::DECL,
            op_session_delete::DECL,
            op_call_cancelled::DECL,
            op_settle::DECL,
        ]),
        ..Default::default()
    }
}
