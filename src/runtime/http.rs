//! # Cliente HTTP Rastreado (`ctx.http()`)
//!
//! Este é o executor mais importante do runtime. Toda requisição emitida
//! por um teste passa por quatro ganchos transversais, nesta ordem:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ 1. Validação pré-request (schema.query / schema.request)   │
//! │ 2. Envio via reqwest + contagem de bytes (budget)          │
//! │ 3. Auto-trace: um evento `trace` por requisição            │
//! │ 4. Auto-métrica: `http_duration_ms` com tags {method,path} │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! E um quinto, adiado: com `schema.response` configurado, o parse do corpo
//! (`json_value()`/`json()`) valida a resposta antes de devolvê-la ao
//! código do usuário.
//!
//! ## Normalização de URL
//!
//! - Path relativo tem a `/` inicial removida antes do join com a base URL
//!   (evita `https://api//users`).
//! - Query vazia nunca vira um `?` pendurado.
//! - A opção `schema` jamais é encaminhada ao transporte; ela vive só na
//!   pipeline de validação.
//!
//! ## Política de rede
//!
//! O host de cada requisição é checado contra o [`NetworkAccess`] do
//! sandbox e o scheme contra o allowlist `http`/`https`. Requisições
//! recusadas pela política falham **antes** de serem emitidas: não geram
//! trace nem métrica. Uma URL que não parseia é diferente: a tentativa é
//! observável, então o trace e a métrica saem mesmo assim (a métrica sem
//! a tag `path`, que não existe sem URL parseada).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::errors::{coded, ErrorCode};
use crate::policy::{self, NetworkAccess};
use crate::protocol::TraceData;

use super::budget::NetworkBudget;
use super::Ctx;

/// Header que propaga o nome de operação para o campo `name` do trace.
pub const OPERATION_HEADER: &str = "x-glubean-operation";

/// Corpos de trace são truncados neste tamanho (10 KB).
pub const TRACE_BODY_CAP: usize = 10 * 1024;

// ============================================================================
// CONFIGURAÇÃO
// ============================================================================

/// Configuração do cliente HTTP do sandbox (montada pelo harness).
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Base URL para paths relativos.
    pub base_url: Option<String>,
    /// Política de rede resolvida dos flags do sandbox.
    pub network: NetworkAccess,
    /// Orçamento cumulativo de bytes de resposta.
    pub budget_bytes: Option<u64>,
    /// Timeout padrão por requisição.
    pub timeout_ms: Option<u64>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            network: NetworkAccess::Denied,
            budget_bytes: None,
            timeout_ms: None,
        }
    }
}

/// Estado HTTP compartilhado pelo contexto (cliente com connection pool).
pub(crate) struct HttpShared {
    client: Client,
    settings: HttpSettings,
    budget: Option<NetworkBudget>,
}

impl HttpShared {
    pub(crate) fn new(settings: HttpSettings) -> Self {
        Self {
            client: Client::new(),
            budget: settings.budget_bytes.map(NetworkBudget::new),
            settings,
        }
    }
}

/// Schemas opcionais de uma requisição: query, corpo enviado e resposta.
#[derive(Debug, Clone, Default)]
pub struct SchemaSpec {
    pub query: Option<Value>,
    pub request: Option<Value>,
    pub response: Option<Value>,
}

// ============================================================================
// API FLUENTE
// ============================================================================

/// Ponto de entrada fluente devolvido por `ctx.http()`.
pub struct Http {
    ctx: Ctx,
}

impl Http {
    pub(crate) fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    pub fn get(&self, path: impl Into<String>) -> HttpRequest {
        HttpRequest::new(self.ctx.clone(), Method::GET, path.into())
    }

    pub fn post(&self, path: impl Into<String>) -> HttpRequest {
        HttpRequest::new(self.ctx.clone(), Method::POST, path.into())
    }

    pub fn put(&self, path: impl Into<String>) -> HttpRequest {
        HttpRequest::new(self.ctx.clone(), Method::PUT, path.into())
    }

    pub fn patch(&self, path: impl Into<String>) -> HttpRequest {
        HttpRequest::new(self.ctx.clone(), Method::PATCH, path.into())
    }

    pub fn delete(&self, path: impl Into<String>) -> HttpRequest {
        HttpRequest::new(self.ctx.clone(), Method::DELETE, path.into())
    }

    pub fn head(&self, path: impl Into<String>) -> HttpRequest {
        HttpRequest::new(self.ctx.clone(), Method::HEAD, path.into())
    }
}

/// Uma requisição em construção.
pub struct HttpRequest {
    ctx: Ctx,
    method: Method,
    path: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Option<Value>,
    schema: SchemaSpec,
    name: Option<String>,
    timeout_ms: Option<u64>,
}

impl HttpRequest {
    fn new(ctx: Ctx, method: Method, path: String) -> Self {
        Self {
            ctx,
            method,
            path,
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            schema: SchemaSpec::default(),
            name: None,
            timeout_ms: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Corpo JSON da requisição.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Schemas de validação; nunca chegam ao transporte.
    pub fn schema(mut self, schema: SchemaSpec) -> Self {
        self.schema = schema;
        self
    }

    /// Nome de operação para o trace (equivale ao header
    /// `x-glubean-operation`).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Emite a requisição, aplicando os ganchos transversais.
    pub async fn send(self) -> Result<HttpResponse> {
        let ctx = self.ctx.clone();

        // Gancho 1: validação pré-request.
        if let Some(schema) = &self.schema.query {
            let query_object: Map<String, Value> = self
                .query
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            ctx.validate(
                &Value::Object(query_object),
                schema,
                &format!("{} {} query", self.method, self.path),
            );
        }
        if let (Some(schema), Some(body)) = (&self.schema.request, &self.body) {
            ctx.validate(
                body,
                schema,
                &format!("{} {} request body", self.method, self.path),
            );
        }

        // Normalização de URL + política de rede. Recusas de POLÍTICA
        // falham antes de emitir qualquer byte (sem trace nem métrica);
        // uma URL que não parseia ainda conta como requisição observável:
        // um trace e uma métrica (sem a tag `path`) por tentativa.
        let settings = ctx.http_shared().settings.clone();
        let url = build_url(settings.base_url.as_deref(), &self.path, &self.query)?;
        let start = Instant::now();
        let parsed = match reqwest::Url::parse(&url) {
            Ok(parsed) => parsed,
            Err(e) => {
                ctx.with_counters(|c| {
                    c.http_request_total += 1;
                    c.http_error_total += 1;
                });
                let duration = start.elapsed().as_millis() as u64;
                self.emit_trace(&url, None, duration, None, None, None);
                self.emit_metric(None, duration);
                return Err(anyhow::Error::new(e)
                    .context(format!("invalid request URL '{}'", url)));
            }
        };
        if let Some(violation) = policy::classify_scheme(parsed.scheme()) {
            return Err(coded(
                ErrorCode::NETWORK_DENIED,
                format!(
                    "Scheme '{}' rejected by sandbox policy ({})",
                    parsed.scheme(),
                    violation.as_str()
                ),
            ));
        }
        let host = parsed.host_str().unwrap_or_default().to_string();
        if !settings.network.allows(&host) {
            return Err(coded(
                ErrorCode::NETWORK_DENIED,
                format!("Network access to '{}' denied by sandbox policy", host),
            ));
        }

        ctx.with_counters(|c| c.http_request_total += 1);

        let mut builder = ctx
            .http_shared()
            .client
            .request(self.method.clone(), parsed.clone());
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &self.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = self.timeout_ms.or(settings.timeout_ms) {
            builder = builder.timeout(Duration::from_millis(timeout));
        }

        match builder.send().await {
            Err(e) => {
                ctx.with_counters(|c| c.http_error_total += 1);
                let duration = start.elapsed().as_millis() as u64;
                self.emit_trace(&url, None, duration, None, None, None);
                self.emit_metric(Some(&parsed), duration);
                Err(anyhow::Error::new(e)
                    .context(format!("{} {} failed", self.method, url)))
            }
            Ok(response) => {
                let status = response.status().as_u16();
                if status >= 400 {
                    ctx.with_counters(|c| c.http_error_total += 1);
                }
                let response_headers: HashMap<String, String> = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                let content_type = response_headers
                    .get("content-type")
                    .cloned()
                    .unwrap_or_default();

                // Gancho 2: leitura do corpo sob orçamento de bytes.
                let body_result = read_body(&ctx, response).await;
                let duration = start.elapsed().as_millis() as u64;

                // Ganchos 3 e 4: trace e métrica, exatamente um de cada
                // por requisição emitida (inclusive quando o budget aborta).
                self.emit_trace(
                    &url,
                    Some(status),
                    duration,
                    Some(&response_headers),
                    body_result.as_deref().ok(),
                    Some(&content_type),
                );
                self.emit_metric(Some(&parsed), duration);

                let body = body_result?;
                let label = format!("{} {} response", self.method, self.path);
                Ok(HttpResponse {
                    ctx,
                    status,
                    headers: response_headers,
                    body,
                    response_schema: self.schema.response.clone(),
                    label,
                })
            }
        }
    }

    /// Nome de operação: opção `.name(...)` ou header `x-glubean-operation`.
    fn operation_name(&self) -> Option<String> {
        self.name.clone().or_else(|| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(OPERATION_HEADER))
                .map(|(_, v)| v.clone())
        })
    }

    fn emit_trace(
        &self,
        url: &str,
        status: Option<u16>,
        duration: u64,
        response_headers: Option<&HashMap<String, String>>,
        response_body: Option<&[u8]>,
        content_type: Option<&str>,
    ) {
        let (headers, body) = if self.ctx.emit_full_trace() {
            let request_headers: Map<String, Value> = self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            let response_header_map: Map<String, Value> = response_headers
                .map(|h| {
                    h.iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect()
                })
                .unwrap_or_default();

            let request_body = self.body.as_ref().map(|b| match serde_json::to_string(b) {
                Ok(rendered) => Value::String(truncate_marked(&rendered, TRACE_BODY_CAP)),
                Err(_) => Value::String("(non-serializable)".to_string()),
            });
            let response_body = response_body.and_then(|bytes| {
                render_traceable_body(bytes, content_type.unwrap_or_default())
            });

            let mut bodies = Map::new();
            if let Some(b) = request_body {
                bodies.insert("request".to_string(), b);
            }
            if let Some(b) = response_body {
                bodies.insert("response".to_string(), b);
            }

            (
                Some(Value::Object(Map::from_iter([
                    ("request".to_string(), Value::Object(request_headers)),
                    ("response".to_string(), Value::Object(response_header_map)),
                ]))),
                if bodies.is_empty() {
                    None
                } else {
                    Some(Value::Object(bodies))
                },
            )
        } else {
            (None, None)
        };

        self.ctx.trace(TraceData {
            method: self.method.to_string(),
            url: url.to_string(),
            status,
            duration: Some(duration),
            name: self.operation_name(),
            headers,
            body,
        });
    }

    /// Métrica `http_duration_ms`; sem URL parseada, a tag `path` é omitida.
    fn emit_metric(&self, parsed: Option<&reqwest::Url>, duration: u64) {
        let mut tags = HashMap::from([("method".to_string(), self.method.to_string())]);
        if let Some(parsed) = parsed {
            tags.insert("path".to_string(), parsed.path().to_string());
        }
        self.ctx.metric_with(
            "http_duration_ms",
            duration as f64,
            Some("ms".to_string()),
            Some(tags),
        );
    }
}

// ============================================================================
// RESPOSTA
// ============================================================================

/// Resposta HTTP com o corpo já lido (e contado pelo budget).
pub struct HttpResponse {
    ctx: Ctx,
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    response_schema: Option<Value>,
    label: String,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("response_schema", &self.response_schema)
            .field("label", &self.label)
            .finish()
    }
}

impl HttpResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.clone()).context("response body is not valid UTF-8")
    }

    /// Parse JSON do corpo. Com `schema.response` configurado, o valor é
    /// validado (severidade `error`) antes de ser devolvido.
    pub fn json_value(&self) -> Result<Value> {
        let value: Value =
            serde_json::from_slice(&self.body).context("response body is not valid JSON")?;
        if let Some(schema) = &self.response_schema {
            self.ctx.validate(&value, schema, &self.label);
        }
        Ok(value)
    }

    /// Parse JSON tipado, passando pela mesma validação de resposta.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.json_value()?;
        serde_json::from_value(value).context("response body does not match expected type")
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Monta a URL final: join com a base (sem `//`), query sem `?` vazio.
fn build_url(base: Option<&str>, path: &str, query: &[(String, String)]) -> Result<String> {
    let mut url = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        let base = base.ok_or_else(|| {
            anyhow!("relative path '{}' requires a configured base URL", path)
        })?;
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };

    let pairs: Vec<String> = query
        .iter()
        .map(|(k, v)| {
            format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
        })
        .collect();
    if !pairs.is_empty() {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&pairs.join("&"));
    }
    Ok(url)
}

/// Lê o corpo inteiro, contando bytes contra o orçamento quando houver um.
async fn read_body(ctx: &Ctx, mut response: reqwest::Response) -> Result<Vec<u8>> {
    match &ctx.http_shared().budget {
        None => Ok(response.bytes().await?.to_vec()),
        Some(budget) => {
            budget.precheck(ctx, response.content_length())?;
            let mut buffer = Vec::new();
            while let Some(chunk) = response.chunk().await? {
                budget.consume(ctx, chunk.len() as u64)?;
                buffer.extend_from_slice(&chunk);
            }
            Ok(buffer)
        }
    }
}

/// Trunca em boundary de char, marcando o corte.
pub(crate) fn truncate_marked(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut cut = cap;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... (truncated)", &text[..cut])
}

/// Renderiza um corpo de resposta para o trace: só JSON/texto/XML entram;
/// outros content-types são omitidos.
fn render_traceable_body(bytes: &[u8], content_type: &str) -> Option<Value> {
    let content_type = content_type.to_ascii_lowercase();
    let textual = content_type.contains("json")
        || content_type.contains("text")
        || content_type.contains("xml");
    if !textual {
        return None;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(Value::String(truncate_marked(text, TRACE_BODY_CAP))),
        Err(_) => Some(Value::String("(non-serializable)".to_string())),
    }
}

// ============================================================================
// TESTES
// ============================================================================
