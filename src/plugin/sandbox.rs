//! Sandboxed plugin execution
//!
//! [`SandboxEngine`] owns one V8 isolate. A bootstrap script captures the host
//! ops in a closure, removes every host global from `globalThis`, and hands
//! back a dispatcher. Each call then:
//!
//! 1. evaluates the plugin source in a fresh function scope whose `module`,
//!    `exports`, `console` and global aliases are call-local,
//! 2. resolves the factory by name (exports first, then the top-level binding,
//!    then a callable `module.exports`),
//! 3. invokes it with the capability context, awaiting an async factory and
//!    constructing a class,
//! 4. checks the instance against the category's required methods and their
//!    arity,
//! 5. invokes the requested method and reports the settled outcome through
//!    `op_settle`.
//!
//! Calls never share instances, so a failing call cannot poison the next. All
//! plugins share one realm, so the bootstrap freezes `globalThis` and every
//! intrinsic reachable from it before the first call; plugin code can read the
//! built-ins but never redefine them for a later call.

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use futures::future::poll_fn;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use tracing::{debug, warn};

use super::bindings::{self, CancelledCalls, SettledQueue, Settlement};
use super::capability::HostServices;
use super::manifest::PluginCategory;
use super::protocol::{ErrorKind, ExecutePayload, MethodContract};
use crate::core::error::{HostError, Result};

/// Call keys used by [`SandboxEngine::execute`] start here so they never collide
/// with request ids minted by the bridge.
const LOCAL_CALL_BASE: u64 = 1 << 50;

pub const STALLED_MESSAGE: &str =
    "Plugin call never settled: the event loop went idle while its promise was still pending";

const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield", "arguments",
    "eval", "undefined",
];

/// Whether `name` can be referenced as a top-level binding from generated code
pub fn is_bindable_identifier(name: &str) -> bool {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    let pattern = IDENTIFIER.get_or_init(|| {
        Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier pattern is valid")
    });
    pattern.is_match(name) && !RESERVED_WORDS.contains(&name)
}

const BOOTSTRAP: &str = r#"
(() => {
  "use strict";
  const {
    op_http_request, op_html_select, op_url_join, op_plugin_log,
    op_session_get, op_session_set, op_session_delete, op_call_cancelled, op_settle,
  } = globalThis.Deno.core.ops;
  Reflect.deleteProperty(globalThis, "Deno");
  Reflect.deleteProperty(globalThis, "__bootstrap");

  const { freeze, getPrototypeOf, getOwnPropertyDescriptor, defineProperty } = Object;
  const { ownKeys } = Reflect;
  const fnToString = Function.prototype.toString;
  const isClass = (fn) => /^class[\s{]/.test(fnToString.call(fn));

  class ContractError extends Error {
    constructor(kind, message) {
      super(message);
      this.kind = kind;
    }
  }

  const describe = (value) => {
    try { return String(value); } catch (_) { return "unprintable value"; }
  };

  const format = (part) => {
    if (typeof part === "string") return part;
    if (part instanceof Error) return part.stack || describe(part);
    try { return JSON.stringify(part) ?? describe(part); } catch (_) { return describe(part); }
  };

  function makeLogger(pluginId) {
    const emit = (level) => (...parts) => op_plugin_log(pluginId, level, parts.map(format).join(" "));
    return freeze({ debug: emit("debug"), info: emit("info"), warn: emit("warn"), error: emit("error") });
  }

  function makeConsole(log) {
    return freeze({ log: log.info, info: log.info, debug: log.debug, warn: log.warn, error: log.error });
  }

  function makeResponse(raw) {
    const headers = freeze({ ...raw.headers });
    return freeze({
      ok: raw.status >= 200 && raw.status < 300,
      status: raw.status,
      url: raw.url,
      body: raw.body,
      headers: freeze({
        get: (name) => headers[String(name).toLowerCase()] ?? null,
        entries: () => Object.entries(headers),
      }),
      text: async () => raw.body,
      json: async () => JSON.parse(raw.body),
    });
  }

  function makeHttp(pluginId, userAgent) {
    const request = async (options) => {
      const headers = Object.create(null);
      headers["user-agent"] = userAgent;
      for (const [name, value] of Object.entries(options.headers || {})) {
        headers[String(name).toLowerCase()] = String(value);
      }
      let body = null;
      if (options.body != null) {
        body = typeof options.body === "string" ? options.body : JSON.stringify(options.body);
      }
      const raw = await op_http_request(pluginId, {
        url: String(options.url),
        method: String(options.method || "GET").toUpperCase(),
        headers,
        body,
      });
      return makeResponse(raw);
    };
    return freeze({
      request,
      get: (url, options = {}) => request({ ...options, url, method: "GET" }),
      post: (url, body, options = {}) => request({ ...options, url, body, method: "POST" }),
    });
  }

  function parseHtml(html) {
    const source = String(html);
    return freeze({
      html: source,
      select: (selector) => op_html_select(source, String(selector)),
      selectFirst: (selector) => op_html_select(source, String(selector))[0] ?? null,
    });
  }

  function makeSession(pluginId) {
    return freeze({
      get: (key) => {
        const raw = op_session_get(pluginId, String(key));
        return raw == null ? undefined : JSON.parse(raw);
      },
      set: (key, value) => {
        op_session_set(pluginId, String(key), JSON.stringify(value === undefined ? null : value));
      },
      delete: (key) => op_session_delete(pluginId, String(key)),
    });
  }

  function buildContext(call, descriptor, extractorContract) {
    const pluginId = descriptor.pluginId;
    const grants = descriptor.grants || {};
    const baseUrl = descriptor.baseUrl ?? null;
    const log = makeLogger(pluginId);
    const ctx = {
      pluginId,
      userAgent: descriptor.userAgent,
      baseUrl,
      config: freeze(descriptor.config ?? {}),
      log,
      url: (path) => op_url_join(baseUrl ?? "", String(path)),
      isCancelled: () => op_call_cancelled(String(call)),
    };
    if (grants.network) {
      const http = makeHttp(pluginId, descriptor.userAgent);
      ctx.http = http;
      ctx.fetch = (url, options = {}) => http.request({ ...options, url });
    }
    if (grants.html) ctx.parseHtml = parseHtml;
    if (grants.session) ctx.session = makeSession(pluginId);
    if (extractorContract) ctx.extractors = makeExtractorTable(call, descriptor, extractorContract);
    return freeze(ctx);
  }

  function makeExtractorTable(call, descriptor, contract) {
    const table = Object.create(null);
    for (const nested of descriptor.extractors || []) {
      let instance = null;
      const load = async () => {
        if (instance === null) {
          const child = buildContext(call, {
            ...descriptor,
            pluginId: `${descriptor.pluginId}/${nested.name}`,
            baseUrl: null,
            extractors: [],
          }, null);
          instance = await instantiate(nested.sourceText, nested.factoryName, nested.bindFactory, child, contract);
        }
        return instance;
      };
      table[nested.name] = freeze({
        name: nested.name,
        version: nested.version,
        load,
        extract: async (...args) => invoke(await load(), "extract", args),
      });
    }
    return freeze(table);
  }

  async function instantiate(sourceText, factoryName, bindFactory, ctx, requiredMethods) {
    const module = { exports: {} };
    const scope = Object.create(null);
    const lookup = bindFactory
      ? `\n;return typeof ${factoryName} === "undefined" ? undefined : ${factoryName};`
      : "\n;return undefined;";
    const evaluate = new Function(
      "module", "exports", "console", "globalThis", "self", "window", "global", "Deno",
      `"use strict";\n${sourceText}${lookup}`,
    );
    const binding = evaluate.call(undefined, module, module.exports, makeConsole(ctx.log), scope, scope, scope, scope, undefined);

    const exported = module.exports;
    let factory = exported != null ? exported[factoryName] : undefined;
    if (factory === undefined) factory = binding;
    if (factory === undefined && typeof exported === "function") factory = exported;
    if (typeof factory !== "function") {
      throw new ContractError("exportContract", `Export '${factoryName}' is missing or not callable`);
    }

    const instance = await (isClass(factory) ? new factory(ctx) : factory(ctx));
    if (instance === null || (typeof instance !== "object" && typeof instance !== "function")) {
      throw new ContractError("exportContract", `Factory '${factoryName}' did not return a plugin instance`);
    }
    const broken = [];
    for (const { name, maxArity } of requiredMethods) {
      const method = instance[name];
      if (typeof method !== "function") {
        broken.push(`${name} is missing`);
      } else if (method.length > maxArity) {
        broken.push(`${name} declares ${method.length} parameters but receives at most ${maxArity}`);
      }
    }
    if (broken.length > 0) {
      throw new ContractError("exportContract", `Plugin instance breaks its category contract: ${broken.join("; ")}`);
    }
    return instance;
  }

  async function invoke(instance, methodName, args) {
    const method = instance[methodName];
    if (typeof method !== "function") {
      throw new ContractError("methodNotFound", `Method '${methodName}' not found on plugin instance`);
    }
    return await method.apply(instance, args);
  }

  function fault(error) {
    if (error instanceof ContractError) return { kind: error.kind, message: error.message };
    if (error instanceof Error) {
      return { kind: "execution", message: error.message || describe(error), stack: error.stack ?? null };
    }
    return { kind: "execution", message: describe(error) };
  }

  function settle(call, outcome) {
    let encoded;
    try {
      encoded = JSON.stringify(outcome);
    } catch (error) {
      encoded = JSON.stringify({
        call,
        success: false,
        error: { kind: "execution", message: `Plugin result is not serializable: ${describe(error)}` },
      });
    }
    op_settle(encoded);
  }

  // Shared prototypes are frozen below. Assigning one of these names on an
  // instance would then throw, so they become accessors that define an own
  // property on the receiver instead.
  function tameOverride(proto, name) {
    const desc = getOwnPropertyDescriptor(proto, name);
    if (desc === undefined || !("value" in desc) || !desc.configurable) return;
    const value = desc.value;
    defineProperty(proto, name, {
      get() { return value; },
      set(next) {
        if (this === proto) throw new TypeError(`Cannot assign to '${name}' of a shared prototype`);
        defineProperty(this, name, { value: next, writable: true, enumerable: true, configurable: true });
      },
      enumerable: desc.enumerable,
      configurable: false,
    });
  }

  function harden(roots) {
    const seen = new Set();
    const pending = [...roots];
    while (pending.length > 0) {
      const value = pending.pop();
      if (value === null || (typeof value !== "object" && typeof value !== "function") || seen.has(value)) continue;
      seen.add(value);
      freeze(value);
      pending.push(getPrototypeOf(value));
      for (const key of ownKeys(value)) {
        const desc = getOwnPropertyDescriptor(value, key);
        if (desc === undefined) continue;
        if ("value" in desc) pending.push(desc.value);
        else pending.push(desc.get, desc.set);
      }
    }
  }

  // Every plugin runs in this one realm: nothing reachable from it may stay mutable.
  function lockdown() {
    for (const key of ["$1", "$2", "$3", "$4", "$5", "$6", "$7", "$8", "$9", "input", "$_",
      "lastMatch", "$&", "lastParen", "$+", "leftContext", "$`", "rightContext", "$'"]) {
      Reflect.deleteProperty(RegExp, key);
    }

    const errors = [Error, EvalError, RangeError, ReferenceError, SyntaxError, TypeError, URIError, AggregateError];
    for (const name of ["constructor", "toString", "toLocaleString", "valueOf", "hasOwnProperty"]) {
      tameOverride(Object.prototype, name);
    }
    for (const error of errors) {
      for (const name of ["constructor", "name", "message", "toString"]) tameOverride(error.prototype, name);
    }

    harden([
      globalThis,
      getPrototypeOf(function* () {}),
      getPrototypeOf(async function () {}),
      getPrototypeOf(async function* () {}),
      getPrototypeOf([][Symbol.iterator]()),
      getPrototypeOf(""[Symbol.iterator]()),
      getPrototypeOf(new Map()[Symbol.iterator]()),
      getPrototypeOf(new Set()[Symbol.iterator]()),
      getPrototypeOf("".matchAll(/x/g)),
      getPrototypeOf(Int8Array),
      ContractError,
      parseHtml,
    ]);
  }

  function failure(error) {
    try {
      return fault(error);
    } catch (_) {
      return { kind: "execution", message: "Plugin threw a value that could not be inspected" };
    }
  }

  lockdown();

  return async function dispatch(call, plan) {
    try {
      const ctx = buildContext(call, plan.context, plan.extractorContract || []);
      const instance = await instantiate(plan.sourceText, plan.factoryName, plan.bindFactory, ctx, plan.requiredMethods || []);
      const result = await invoke(instance, plan.methodName, plan.args || []);
      settle(call, { call, success: true, result: result === undefined ? null : result });
    } catch (error) {
      settle(call, { call, success: false, error: failure(error) });
    }
  };
})()
"#;

/// One V8 isolate running plugin calls
///
/// The engine is `!Send`; the bridge keeps it on a dedicated thread.
pub struct SandboxEngine {
    runtime: JsRuntime,
    dispatch: v8::Global<v8::Function>,
    settled: SettledQueue,
    inflight: HashSet<u64>,
    next_local: u64,
}

impl SandboxEngine {
    pub fn new(services: HostServices) -> Result<Self> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![bindings::host_extension()],
            ..Default::default()
        });

        let settled = SettledQueue::default();
        {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            op_state.put(services);
            op_state.put(settled.clone());
            op_state.put(CancelledCalls::default());
        }

        let value = runtime
            .execute_script("<extension_host_bootstrap>", BOOTSTRAP.to_string().into())
            .map_err(|e| HostError::InitializationError(format!("Failed to bootstrap sandbox: {}", e)))?;

        let dispatch = {
            let scope = &mut runtime.handle_scope();
            let local = v8::Local::new(scope, value);
            let function = v8::Local::<v8::Function>::try_from(local).map_err(|_| {
                HostError::InitializationError("Sandbox bootstrap did not return a dispatcher".to_string())
            })?;
            v8::Global::new(scope, function)
        };

        debug!("Sandbox engine initialized");

        Ok(Self {
            runtime,
            dispatch,
            settled,
            inflight: HashSet::new(),
            next_local: 0,
        })
    }

    /// Start a call; its outcome later shows up in [`take_settled`](Self::take_settled)
    pub fn begin(&mut self, call: u64, payload: &ExecutePayload) -> Result<()> {
        let plan = execution_plan(payload)?;

        {
            let scope = &mut self.runtime.handle_scope();
            let dispatch = v8::Local::new(scope, &self.dispatch);
            let call_value = v8::Number::new(scope, call as f64);
            let plan_text = v8::String::new(scope, &plan)
                .ok_or_else(|| HostError::SerializationError("Execution plan is too large".to_string()))?;
            let plan_value = v8::json::parse(scope, plan_text).ok_or_else(|| {
                HostError::SerializationError("Failed to parse execution plan in V8".to_string())
            })?;

            let recv = v8::undefined(scope).into();
            if dispatch
                .call(scope, recv, &[call_value.into(), plan_value])
                .is_none()
            {
                return Err(HostError::ExecutionError {
                    message: "Failed to invoke the sandbox dispatcher".to_string(),
                    stack: None,
                });
            }
        }

        self.inflight.insert(call);
        Ok(())
    }

    /// Drive pending ops and microtasks
    ///
    /// `Ready(Ok)` means the event loop has nothing left to do.
    pub fn poll_event_loop(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.runtime
            .poll_event_loop(cx, PollEventLoopOptions::default())
            .map_err(|e| HostError::ExecutionError {
                message: e.to_string(),
                stack: None,
            })
    }

    pub fn has_settled(&self) -> bool {
        !self.settled.0.borrow().is_empty()
    }

    pub fn has_inflight(&self) -> bool {
        !self.inflight.is_empty()
    }

    /// Drain every settled call, dropping those that were cancelled
    pub fn take_settled(&mut self) -> Vec<Settlement> {
        let drained: Vec<Settlement> = self.settled.0.borrow_mut().drain(..).collect();
        drained
            .into_iter()
            .filter(|settlement| self.retire(settlement.call))
            .collect()
    }

    /// Fail every call still in flight, e.g. once the event loop went idle
    pub fn fail_inflight(&mut self, message: &str) -> Vec<Settlement> {
        let stalled: Vec<u64> = self.inflight.iter().copied().collect();
        stalled
            .into_iter()
            .filter(|call| self.retire(*call))
            .map(|call| {
                warn!(call, reason = message, "Failing unsettled plugin call");
                Settlement::failed(call, ErrorKind::Execution, message)
            })
            .collect()
    }

    /// Mark a call as abandoned; `ctx.isCancelled()` turns true and its outcome is discarded
    pub fn cancel(&mut self, call: u64) {
        if !self.inflight.contains(&call) {
            return;
        }
        let op_state = self.runtime.op_state();
        op_state.borrow_mut().borrow_mut::<CancelledCalls>().0.insert(call);
        debug!(call, "Plugin call cancelled");
    }

    /// Run one call to completion on this engine
    pub async fn execute(&mut self, payload: &ExecutePayload) -> Result<Value> {
        self.next_local += 1;
        let call = LOCAL_CALL_BASE + self.next_local;
        self.begin(call, payload)?;

        loop {
            let step = poll_fn(|cx| match self.poll_event_loop(cx) {
                Poll::Ready(outcome) => Poll::Ready(Some(outcome)),
                Poll::Pending if self.is_settled(call) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            })
            .await;

            if let Some(settlement) = self.take_settlement(call) {
                return settlement.into_result();
            }

            match step {
                None => continue,
                Some(Ok(())) => {
                    self.retire(call);
                    return Err(HostError::ExecutionError {
                        message: STALLED_MESSAGE.to_string(),
                        stack: None,
                    });
                }
                Some(Err(e)) => {
                    self.retire(call);
                    return Err(e);
                }
            }
        }
    }

    fn is_settled(&self, call: u64) -> bool {
        self.settled.0.borrow().iter().any(|s| s.call == call)
    }

    fn take_settlement(&mut self, call: u64) -> Option<Settlement> {
        let settlement = {
            let mut queue = self.settled.0.borrow_mut();
            let index = queue.iter().position(|s| s.call == call)?;
            queue.remove(index)
        };
        self.retire(call);
        settlement
    }

    /// Forget a call; false when the host had already cancelled it
    fn retire(&mut self, call: u64) -> bool {
        self.inflight.remove(&call);
        let op_state = self.runtime.op_state();
        let cancelled = op_state
            .borrow_mut()
            .borrow_mut::<CancelledCalls>()
            .0
            .remove(&call);
        if cancelled {
            debug!(call, "Discarding outcome of cancelled call");
        }
        !cancelled
    }
}

/// Payload as the dispatcher sees it, with factory bindability precomputed
fn execution_plan(payload: &ExecutePayload) -> Result<String> {
    if payload.factory_name.is_empty() {
        return Err(HostError::ExportContractError("Factory name is empty".to_string()));
    }
    if payload.method_name.is_empty() {
        return Err(HostError::MethodNotFoundError("Method name is empty".to_string()));
    }

    let extractor_contract: Vec<MethodContract> = PluginCategory::Extractor
        .required_methods()
        .iter()
        .map(|(name, arity)| MethodContract::new(*name, *arity))
        .collect();

    let mut plan = serde_json::to_value(payload)?;
    plan["bindFactory"] = json!(is_bindable_identifier(&payload.factory_name));
    plan["extractorContract"] = serde_json::to_value(extractor_contract)?;

    if let Some(extractors) = plan["context"]["extractors"].as_array_mut() {
        for extractor in extractors {
            let bindable = extractor["factoryName"]
                .as_str()
                .map(is_bindable_identifier)
                .unwrap_or(false);
            extractor["bindFactory"] = json!(bindable);
        }
    }

    Ok(plan.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::capability::{
        Capabilities, CapabilityContext, NestedPlugin, NetworkPolicy, SessionStore,
    };
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ECHO: &str = r#"
        function createEcho(ctx) {
            return {
                identity: (value) => value,
                add: async (a, b) => a + b,
                agent: () => ctx.userAgent,
            };
        }
    "#;

    fn services_with(policy: NetworkPolicy, sessions: SessionStore) -> HostServices {
        HostServices::new("sandbox-test/1.0", Duration::from_secs(5), policy, sessions).unwrap()
    }

    fn engine() -> SandboxEngine {
        SandboxEngine::new(services_with(NetworkPolicy::allow_all(), SessionStore::default())).unwrap()
    }

    fn payload(source: &str, factory: &str, method: &str, args: Vec<Value>) -> ExecutePayload {
        payload_for("test-plugin", source, factory, method, args)
    }

    fn payload_for(
        plugin_id: &str,
        source: &str,
        factory: &str,
        method: &str,
        args: Vec<Value>,
    ) -> ExecutePayload {
        ExecutePayload {
            source_text: source.to_string(),
            factory_name: factory.to_string(),
            method_name: method.to_string(),
            args,
            context: CapabilityContext::new(plugin_id, "sandbox-test/1.0"),
            required_methods: Vec::new(),
        }
    }

    #[test]
    fn test_bindable_identifiers() {
        assert!(is_bindable_identifier("createDemo"));
        assert!(is_bindable_identifier("$factory_2"));
        assert!(!is_bindable_identifier("2fast"));
        assert!(!is_bindable_identifier("default"));
        assert!(!is_bindable_identifier("create-demo"));
        assert!(!is_bindable_identifier("a;b"));
    }

    #[tokio::test]
    async fn test_marshalling_round_trips_json_values() {
        let mut engine = engine();
        let values = vec![
            json!("plain string"),
            json!(42),
            json!(-3.5),
            json!(true),
            json!(null),
            json!([1, "two", {"three": 3}]),
            json!({"title": "Demo", "tags": ["a", "b"], "nested": {"depth": 2, "ok": false}}),
        ];

        for value in values {
            let result = engine
                .execute(&payload(ECHO, "createEcho", "identity", vec![value.clone()]))
                .await
                .unwrap();
            assert_eq!(result, value);
        }
    }

    #[tokio::test]
    async fn test_async_method_and_context() {
        let mut engine = engine();

        let sum = engine
            .execute(&payload(ECHO, "createEcho", "add", vec![json!(2), json!(3)]))
            .await
            .unwrap();
        assert_eq!(sum, json!(5));

        let agent = engine
            .execute(&payload(ECHO, "createEcho", "agent", vec![]))
            .await
            .unwrap();
        assert_eq!(agent, json!("sandbox-test/1.0"));
    }

    #[tokio::test]
    async fn test_undefined_result_is_null() {
        let source = "function f() { return { nothing() {} }; }";
        let result = engine().execute(&payload(source, "f", "nothing", vec![])).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_factory_resolution_styles() {
        let mut engine = engine();

        let exported = "module.exports = { make: () => ({ hi: () => 'exports' }) };";
        assert_eq!(
            engine.execute(&payload(exported, "make", "hi", vec![])).await.unwrap(),
            json!("exports")
        );

        let whole = "module.exports = function () { return { hi: () => 'callable exports' }; };";
        assert_eq!(
            engine.execute(&payload(whole, "make", "hi", vec![])).await.unwrap(),
            json!("callable exports")
        );

        let class_based = r#"
            class Provider {
                constructor(ctx) { this.agent = ctx.userAgent; }
                async hi() { return `class ${this.agent}`; }
            }
        "#;
        assert_eq!(
            engine.execute(&payload(class_based, "Provider", "hi", vec![])).await.unwrap(),
            json!("class sandbox-test/1.0")
        );

        let async_factory = "async function build() { return { hi: () => 'awaited' }; }";
        assert_eq!(
            engine.execute(&payload(async_factory, "build", "hi", vec![])).await.unwrap(),
            json!("awaited")
        );
    }

    #[tokio::test]
    async fn test_missing_factory_is_export_contract_error() {
        let mut engine = engine();

        let err = engine
            .execute(&payload("const unrelated = 1;", "createDemo", "search", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::ExportContractError(_)));

        let err = engine
            .execute(&payload("module.exports = { createDemo: 42 };", "createDemo", "search", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::ExportContractError(_)));

        let err = engine
            .execute(&payload("function createDemo() { return null; }", "createDemo", "search", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::ExportContractError(_)));
    }

    #[tokio::test]
    async fn test_required_methods_are_checked() {
        let mut request = payload(
            "function createDemo() { return { search: () => [] }; }",
            "createDemo",
            "search",
            vec![],
        );
        request.required_methods = vec![
            MethodContract::new("search", 2),
            MethodContract::new("fetchInfo", 1),
            MethodContract::new("fetchSources", 1),
        ];

        match engine().execute(&request).await.unwrap_err() {
            HostError::ExportContractError(message) => {
                assert!(message.contains("fetchInfo is missing"));
                assert!(message.contains("fetchSources is missing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_required_method_arity_is_checked() {
        let mut engine = engine();
        let contract = vec![MethodContract::new("extract", 1)];

        let mut too_many = payload(
            "function createExtractor() { return { extract: (url, quality, referer) => url }; }",
            "createExtractor",
            "extract",
            vec![json!("https://vid.example/1")],
        );
        too_many.required_methods = contract.clone();
        match engine.execute(&too_many).await.unwrap_err() {
            HostError::ExportContractError(message) => {
                assert!(message.contains("extract declares 3 parameters but receives at most 1"))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Defaulted and rest parameters don't count towards `length`
        let mut lenient = payload(
            "function createExtractor() { return { extract: (url, quality = 'hd', ...rest) => [url, quality] }; }",
            "createExtractor",
            "extract",
            vec![json!("https://vid.example/1")],
        );
        lenient.required_methods = contract;
        assert_eq!(
            engine.execute(&lenient).await.unwrap(),
            json!(["https://vid.example/1", "hd"])
        );
    }

    #[tokio::test]
    async fn test_unknown_method_runs_no_plugin_method() {
        let sessions = SessionStore::default();
        let mut engine = SandboxEngine::new(services_with(NetworkPolicy::allow_all(), sessions.clone())).unwrap();
        let source = r#"
            function createDemo(ctx) {
                return {
                    search() { ctx.session.set("touched", true); return []; },
                };
            }
        "#;

        let err = engine
            .execute(&payload(source, "createDemo", "nope", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::MethodNotFoundError(_)));
        assert_eq!(sessions.get("test-plugin", "touched"), None);
    }

    #[tokio::test]
    async fn test_faults_are_isolated_per_call() {
        let mut engine = engine();
        let source = r#"
            function createDemo() {
                return {
                    explode() { throw new Error("boom"); },
                    reject: async () => { throw new TypeError("async boom"); },
                    bare() { throw "just a string"; },
                    fine: () => "still working",
                };
            }
        "#;

        match engine.execute(&payload(source, "createDemo", "explode", vec![])).await {
            Err(HostError::ExecutionError { message, stack }) => {
                assert_eq!(message, "boom");
                assert!(stack.unwrap_or_default().contains("boom"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        match engine.execute(&payload(source, "createDemo", "reject", vec![])).await {
            Err(HostError::ExecutionError { message, .. }) => assert_eq!(message, "async boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        match engine.execute(&payload(source, "createDemo", "bare", vec![])).await {
            Err(HostError::ExecutionError { message, stack }) => {
                assert_eq!(message, "just a string");
                assert!(stack.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let result = engine
            .execute(&payload(source, "createDemo", "fine", vec![]))
            .await
            .unwrap();
        assert_eq!(result, json!("still working"));
    }

    #[tokio::test]
    async fn test_syntax_error_is_execution_error() {
        let err = engine()
            .execute(&payload("function createDemo( {", "createDemo", "search", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::ExecutionError { .. }));
    }

    #[tokio::test]
    async fn test_host_globals_are_unreachable() {
        let source = r#"
            function inspectGlobals() {
                return {
                    globals: () => ({
                        deno: typeof Deno,
                        bootstrap: typeof __bootstrap,
                        realDeno: typeof Function("return typeof Deno")(),
                    }),
                };
            }
        "#;
        let result = engine().execute(&payload(source, "inspectGlobals", "globals", vec![])).await.unwrap();
        assert_eq!(
            result,
            json!({"deno": "undefined", "bootstrap": "undefined", "realDeno": "undefined"})
        );
    }

    #[tokio::test]
    async fn test_calls_do_not_share_state() {
        let mut engine = engine();
        let source = r#"
            var counter = 0;
            globalThis.shared = (globalThis.shared || 0) + 1;
            function createDemo() {
                return { bump: () => { counter += 1; return [counter, globalThis.shared]; } };
            }
        "#;

        for _ in 0..3 {
            let result = engine
                .execute(&payload(source, "createDemo", "bump", vec![]))
                .await
                .unwrap();
            assert_eq!(result, json!([1, 1]));
        }
    }

    #[tokio::test]
    async fn test_realm_tampering_does_not_reach_other_plugins() {
        let mut engine = engine();
        let tamperer = r#"
            function createTamperer() {
                return {
                    tamper() {
                        const attempts = {
                            global: () => { Function("return this")().leaked = "from tamperer"; },
                            evalGlobal: () => (0, eval)("var viaEval = 1"),
                            json: () => { JSON.stringify = () => '{"call":0,"success":true,"result":"forged"}'; },
                            then: () => { Promise.prototype.then = function () {}; },
                            objectProto: () => { Object.prototype.polluted = true; },
                            arrayProto: () => { Array.prototype.map = () => ["forged"]; },
                            asyncProto: () => { Object.getPrototypeOf(async function () {}).leaked = true; },
                        };
                        const blocked = [];
                        for (const [name, attempt] of Object.entries(attempts)) {
                            try { attempt(); } catch (e) { if (e instanceof TypeError) blocked.push(name); }
                        }
                        return blocked;
                    },
                };
            }
        "#;
        let blocked = engine
            .execute(&payload_for("tamperer", tamperer, "createTamperer", "tamper", vec![]))
            .await
            .unwrap();
        assert_eq!(
            blocked,
            json!(["global", "evalGlobal", "json", "then", "objectProto", "arrayProto", "asyncProto"])
        );

        let honest = r#"
            function createHonest() {
                return {
                    observe: async () => ({
                        leaked: typeof Function("return this")().leaked,
                        viaEval: typeof Function("return typeof viaEval")(),
                        polluted: typeof ({}).polluted,
                        mapped: [1, 2].map((n) => n * 2),
                        value: await Promise.resolve("real result"),
                    }),
                };
            }
        "#;
        let observed = engine
            .execute(&payload_for("honest", honest, "createHonest", "observe", vec![]))
            .await
            .unwrap();
        assert_eq!(
            observed,
            json!({
                "leaked": "undefined",
                "viaEval": "undefined",
                "polluted": "undefined",
                "mapped": [2, 4],
                "value": "real result"
            })
        );
    }

    #[tokio::test]
    async fn test_instances_can_still_override_builtin_names() {
        let source = r#"
            class NotFound extends Error {
                constructor(message) {
                    super(message);
                    this.name = "NotFound";
                }
            }
            function createDemo() {
                return {
                    names() {
                        const item = {};
                        item.toString = () => "custom";
                        return [String(item), new NotFound("x").name, String(new NotFound("gone"))];
                    },
                    fail() { throw new NotFound("no such show"); },
                };
            }
        "#;
        let mut engine = engine();

        assert_eq!(
            engine.execute(&payload(source, "createDemo", "names", vec![])).await.unwrap(),
            json!(["custom", "NotFound", "NotFound: gone"])
        );
        match engine.execute(&payload(source, "createDemo", "fail", vec![])).await {
            Err(HostError::ExecutionError { message, stack }) => {
                assert_eq!(message, "no such show");
                assert!(stack.unwrap_or_default().contains("no such show"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_uninspectable_throw_still_settles() {
        let source = r#"
            function createDemo() {
                return {
                    hostile() {
                        throw new Proxy({}, { getPrototypeOf() { throw new Error("trap"); } });
                    },
                    fine: () => "ok",
                };
            }
        "#;
        let mut engine = engine();

        assert!(matches!(
            engine.execute(&payload(source, "createDemo", "hostile", vec![])).await,
            Err(HostError::ExecutionError { .. })
        ));
        assert_eq!(
            engine.execute(&payload(source, "createDemo", "fine", vec![])).await.unwrap(),
            json!("ok")
        );
    }

    #[tokio::test]
    async fn test_never_settling_call_fails() {
        let source = "function f() { return { hang: () => new Promise(() => {}) }; }";
        let err = engine().execute(&payload(source, "f", "hang", vec![])).await.unwrap_err();
        match err {
            HostError::ExecutionError { message, .. } => assert!(message.contains("never settled")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unserializable_result_is_execution_error() {
        let source = "function f() { return { cyclic: () => { const a = {}; a.self = a; return a; } }; }";
        let err = engine().execute(&payload(source, "f", "cyclic", vec![])).await.unwrap_err();
        assert!(matches!(err, HostError::ExecutionError { .. }));
    }

    #[tokio::test]
    async fn test_capability_grants_shape_context() {
        let source = r#"
            function f(ctx) {
                return {
                    shape: () => ({
                        http: typeof ctx.http,
                        fetch: typeof ctx.fetch,
                        html: typeof ctx.parseHtml,
                        session: typeof ctx.session,
                        log: typeof ctx.log.info,
                        frozen: Object.isFrozen(ctx),
                    }),
                };
            }
        "#;
        let mut request = payload(source, "f", "shape", vec![]);
        request.context = request.context.with_grants(Capabilities::none());

        let result = engine().execute(&request).await.unwrap();
        assert_eq!(
            result,
            json!({
                "http": "undefined",
                "fetch": "undefined",
                "html": "undefined",
                "session": "undefined",
                "log": "function",
                "frozen": true
            })
        );
    }

    #[tokio::test]
    async fn test_html_and_url_helpers() {
        let source = r#"
            function f(ctx) {
                return {
                    links(html) {
                        return ctx.parseHtml(html).select("a.item").map((a) => ({
                            title: a.text,
                            href: ctx.url(a.attrs.href),
                        }));
                    },
                };
            }
        "#;
        let mut request = payload(
            source,
            "f",
            "links",
            vec![json!(r#"<div><a class="item" href="/show/1">One</a><a href="/x">skip</a></div>"#)],
        );
        request.context = request
            .context
            .with_base_url(Some("https://demo.example/".to_string()));

        let result = engine().execute(&request).await.unwrap();
        assert_eq!(
            result,
            json!([{"title": "One", "href": "https://demo.example/show/1"}])
        );
    }

    #[tokio::test]
    async fn test_session_persists_across_calls() {
        let sessions = SessionStore::default();
        let mut engine = SandboxEngine::new(services_with(NetworkPolicy::allow_all(), sessions.clone())).unwrap();
        let source = r#"
            function f(ctx) {
                return {
                    login: () => { ctx.session.set("token", { value: "abc" }); },
                    token: () => ctx.session.get("token") ?? null,
                };
            }
        "#;

        assert_eq!(engine.execute(&payload(source, "f", "token", vec![])).await.unwrap(), Value::Null);
        engine.execute(&payload(source, "f", "login", vec![])).await.unwrap();
        assert_eq!(
            engine.execute(&payload(source, "f", "token", vec![])).await.unwrap(),
            json!({"value": "abc"})
        );
        assert_eq!(sessions.get("test-plugin", "token"), Some(json!({"value": "abc"})));
    }

    #[tokio::test]
    async fn test_http_through_host_client() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"hits":["a","b"]}"#))
            .mount(&server)
            .await;

        let services = services_with(NetworkPolicy::allow_all(), SessionStore::default());
        let traffic = services.traffic.clone();
        let mut engine = SandboxEngine::new(services).unwrap();

        let source = r#"
            function f(ctx) {
                return {
                    search: async () => {
                        const response = await ctx.http.get(ctx.url("/api/search"));
                        const body = await response.json();
                        return { status: response.status, ok: response.ok, hits: body.hits };
                    },
                };
            }
        "#;
        let mut request = payload(source, "f", "search", vec![]);
        request.context = request.context.with_base_url(Some(server.uri()));

        let result = engine.execute(&request).await.unwrap();
        assert_eq!(result, json!({"status": 200, "ok": true, "hits": ["a", "b"]}));
        assert_eq!(traffic.requests(), 1);
    }

    #[tokio::test]
    async fn test_http_response_over_limit_rejects_in_plugin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dump"))
            .respond_with(ResponseTemplate::new(200).set_body_string("y".repeat(2048)))
            .mount(&server)
            .await;

        let services = services_with(NetworkPolicy::allow_all(), SessionStore::default())
            .with_max_body_bytes(512);
        let mut engine = SandboxEngine::new(services).unwrap();

        let source = r#"
            function f(ctx) {
                return {
                    grab: async () => {
                        try {
                            await ctx.http.get(ctx.url("/dump"));
                            return "read";
                        } catch (e) {
                            return String(e.message);
                        }
                    },
                };
            }
        "#;
        let mut request = payload(source, "f", "grab", vec![]);
        request.context = request.context.with_base_url(Some(server.uri()));

        let result = engine.execute(&request).await.unwrap();
        let message = result.as_str().unwrap();
        assert!(message.contains("exceeds 512 bytes"), "{message}");

        // The runtime keeps serving after the rejected read
        let next = engine
            .execute(&payload(ECHO, "createEcho", "identity", vec![json!("ok")]))
            .await
            .unwrap();
        assert_eq!(next, json!("ok"));
    }

    #[tokio::test]
    async fn test_http_outside_allowlist_is_denied() {
        let services = services_with(
            NetworkPolicy::new(vec!["*.allowed.example".to_string()]),
            SessionStore::default(),
        );
        let traffic = services.traffic.clone();
        let mut engine = SandboxEngine::new(services).unwrap();

        let source = r#"
            function f(ctx) {
                return { grab: async () => (await ctx.fetch("https://evil.example/")).body };
            }
        "#;
        match engine.execute(&payload(source, "f", "grab", vec![])).await {
            Err(HostError::ExecutionError { message, .. }) => {
                assert!(message.contains("Network access denied"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(traffic.denied(), 1);
        assert_eq!(traffic.requests(), 0);
    }

    #[tokio::test]
    async fn test_nested_extractor_lookup() {
        let extractor = r#"
            function createExtractor(ctx) {
                return { extract: async (url) => ({ stream: url + "/master.m3u8", by: ctx.pluginId }) };
            }
        "#;
        let provider = r#"
            function createDemo(ctx) {
                return {
                    fetchSources: async (id) => {
                        const table = ctx.extractors;
                        return [await table.vidhost.extract("https://vid.example/" + id), table.vidhost.version];
                    },
                };
            }
        "#;
        let mut request = payload(provider, "createDemo", "fetchSources", vec![json!("ep1")]);
        request.context = request.context.with_extractor(NestedPlugin {
            name: "vidhost".to_string(),
            version: "2.0.0".to_string(),
            factory_name: "createExtractor".to_string(),
            source_text: extractor.to_string(),
        });

        let result = engine().execute(&request).await.unwrap();
        assert_eq!(
            result,
            json!([
                {"stream": "https://vid.example/ep1/master.m3u8", "by": "test-plugin/vidhost"},
                "2.0.0"
            ])
        );
    }

    #[tokio::test]
    async fn test_empty_names_rejected_before_dispatch() {
        let mut engine = engine();
        assert!(matches!(
            engine.execute(&payload(ECHO, "", "identity", vec![])).await,
            Err(HostError::ExportContractError(_))
        ));
        assert!(matches!(
            engine.execute(&payload(ECHO, "createEcho", "", vec![])).await,
            Err(HostError::MethodNotFoundError(_))
        ));
    }
}
