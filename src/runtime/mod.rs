//! # Módulo de Runtime - O Contexto de Teste (`Ctx`)
//!
//! Este é o coração do lado sandbox. Todo corpo de teste recebe um [`Ctx`]
//! como primeiro argumento, e **toda** operação observável dele emite um
//! evento NDJSON no stdout (uma linha JSON + flush).
//!
//! ## O que o `Ctx` oferece?
//!
//! ```text
//! ctx.vars() / ctx.secrets()   lookup em três camadas (mapa -> ambiente)
//! ctx.log(...)                 log estruturado
//! ctx.assert(...) / expect()   assertions SOFT (contam, não interrompem)
//! ctx.warn(...)                checagem que nunca falha o teste
//! ctx.validate(...)            JSON Schema com severidade error/warn/fatal
//! ctx.http()                   cliente HTTP com trace + métrica automáticos
//! ctx.trace(...) / metric(...) telemetria manual
//! ctx.skip(...) / fail(...)    sentinelas que terminam o teste
//! ctx.poll_until(...)          polling com deadline
//! ctx.set_timeout(...)         pede ao engine para rearmar o deadline
//! ```
//!
//! ## Para todos entenderem: assertion "soft"
//!
//! `ctx.assert(false, "...")` NÃO interrompe o teste. Ela registra a falha
//! num contador e emite um evento; o veredito final é derivado dos
//! contadores no fim. As únicas coisas que interrompem o corpo são
//! `ctx.fail(...)`, schema com severidade `fatal`, timeout de step e erros
//! propagados com `?`.
//!
//! ## Modelo de concorrência
//!
//! O runtime é cooperativo e mono-tarefa dentro do subprocess: toda
//! suspensão acontece em I/O aguardado. Os contadores usam `Mutex` apenas
//! porque fixtures de ciclo de vida rodam como tasks próprias; não há
//! paralelismo dentro de um teste.

pub mod budget;
pub mod expect;
pub mod http;
pub mod validate;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::errors::{coded, ErrorCode, TestAbort};
use crate::protocol::{Severity, SummaryData, TimelineEvent, TraceData};

use self::expect::Expectation;
use self::http::{Http, HttpSettings};

/// Lock que sobrevive a poisoning: um pânico em outra task não pode
/// derrubar a emissão de eventos do teste inteiro.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// SINK DE EVENTOS
// ============================================================================

/// Destino dos eventos emitidos pelo runtime.
///
/// Em produção é sempre [`StdoutSink`]; [`MemorySink`] existe para rodar
/// testes de usuário in-process (e para os testes deste crate).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TimelineEvent);
}

/// Escreve cada evento como uma linha NDJSON no stdout, com flush imediato.
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: &TimelineEvent) {
        use std::io::Write;
        if let Ok(line) = serde_json::to_string(event) {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{}", line);
            let _ = out.flush();
        }
    }
}

/// Acumula eventos em memória, na ordem de emissão.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<TimelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TimelineEvent> {
        lock(&self.events).clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &TimelineEvent) {
        lock(&self.events).push(event.clone());
    }
}

// ============================================================================
// CONTADORES
// ============================================================================

/// Contadores mutáveis por subprocess, descarregados uma única vez no
/// `summary`. Os campos `attempt_*` são zerados a cada tentativa de step.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub http_request_total: u64,
    pub http_error_total: u64,
    pub assertion_total: u64,
    pub assertion_failed: u64,
    pub warning_total: u64,
    pub warning_triggered: u64,
    pub schema_validation_total: u64,
    pub schema_validation_failed: u64,
    pub schema_validation_warnings: u64,
    pub step_total: u64,
    pub step_passed: u64,
    pub step_failed: u64,
    pub step_skipped: u64,
    pub attempt_assertions: u64,
    pub attempt_failed_assertions: u64,
}

impl Counters {
    fn summary(&self) -> SummaryData {
        SummaryData {
            http_request_total: self.http_request_total,
            http_error_total: self.http_error_total,
            http_error_rate: if self.http_request_total > 0 {
                self.http_error_total as f64 / self.http_request_total as f64
            } else {
                0.0
            },
            assertion_total: self.assertion_total,
            assertion_failed: self.assertion_failed,
            warning_total: self.warning_total,
            warning_triggered: self.warning_triggered,
            schema_validation_total: self.schema_validation_total,
            schema_validation_failed: self.schema_validation_failed,
            schema_validation_warnings: self.schema_validation_warnings,
            step_total: self.step_total,
            step_passed: self.step_passed,
            step_failed: self.step_failed,
            step_skipped: self.step_skipped,
        }
    }
}

// ============================================================================
// VARIÁVEIS E SEGREDOS
// ============================================================================

/// Resultado de um validador passado a [`VarStore::require_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// Inválido, mensagem genérica.
    Invalid,
    /// Inválido, com mensagem específica.
    InvalidWith(String),
}

/// Loja de variáveis com lookup em camadas: mapa explícito, depois o
/// ambiente do processo (quando o sandbox tem permissão de env).
///
/// Valores ausentes, nulos ou vazios são tratados como "não definido".
#[derive(Debug, Clone)]
pub struct VarStore {
    kind: &'static str,
    values: HashMap<String, String>,
    env_fallback: bool,
}

impl VarStore {
    pub(crate) fn new(
        kind: &'static str,
        values: HashMap<String, String>,
        env_fallback: bool,
    ) -> Self {
        Self {
            kind,
            values,
            env_fallback,
        }
    }

    /// Lookup em camadas; string vazia conta como ausente.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.values.get(key) {
            if !value.is_empty() {
                return Some(value.clone());
            }
        }
        if self.env_fallback {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Como `get`, mas a ausência é um erro terminal (E3001).
    pub fn require(&self, key: &str) -> Result<String> {
        self.get(key).ok_or_else(|| {
            coded(
                ErrorCode::MISSING_REQUIRED,
                format!("Missing required {} '{}'", self.kind, key),
            )
        })
    }

    /// `require` com validador. O validador devolve [`Validation`]:
    /// `Valid` aceita, `Invalid` rejeita com mensagem genérica,
    /// `InvalidWith` rejeita com a mensagem fornecida (ambas E3002).
    pub fn require_with<F>(&self, key: &str, validate: F) -> Result<String>
    where
        F: Fn(&str) -> Validation,
    {
        let value = self.require(key)?;
        match validate(&value) {
            Validation::Valid => Ok(value),
            Validation::Invalid => Err(coded(
                ErrorCode::VALIDATION_FAILED,
                format!("Validation failed for {} '{}'", self.kind, key),
            )),
            Validation::InvalidWith(message) => Err(coded(
                ErrorCode::VALIDATION_FAILED,
                format!(
                    "Validation failed for {} '{}': {}",
                    self.kind, key, message
                ),
            )),
        }
    }

    /// Snapshot raso do mapa explícito (sem o ambiente).
    pub fn all(&self) -> HashMap<String, String> {
        self.values.clone()
    }
}

// ============================================================================
// ESTATÍSTICAS DE MEMÓRIA
// ============================================================================

/// Uso de memória do processo sandbox (RSS corrente e pico).
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub rss_bytes: u64,
    pub peak_rss_bytes: u64,
}

/// Uso de memória corrente, se a plataforma expuser (`/proc/self/status`).
pub fn memory_usage() -> Option<MemoryStats> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_proc_status(&status)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Extrai VmRSS/VmHWM (em kB) do conteúdo de `/proc/self/status`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_status(status: &str) -> Option<MemoryStats> {
    let mut rss_kb: Option<u64> = None;
    let mut peak_kb: Option<u64> = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss_kb = rest.trim().trim_end_matches("kB").trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("VmHWM:") {
            peak_kb = rest.trim().trim_end_matches("kB").trim().parse().ok();
        }
    }
    let rss = rss_kb?;
    Some(MemoryStats {
        rss_bytes: rss * 1024,
        peak_rss_bytes: peak_kb.unwrap_or(rss) * 1024,
    })
}

// ============================================================================
// OPÇÕES DE POLLING
// ============================================================================

/// Opções de [`Ctx::poll_until`]. `interval_ms` padrão: 1000.
pub struct PollUntilOptions {
    pub timeout_ms: u64,
    pub interval_ms: u64,
    /// Se presente, é chamado no estouro do deadline com o último erro visto
    /// e o polling retorna `Ok(None)` em vez de falhar.
    pub on_timeout: Option<Box<dyn FnOnce(Option<&anyhow::Error>) + Send>>,
}

impl PollUntilOptions {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            interval_ms: 1000,
            on_timeout: None,
        }
    }

    pub fn interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn on_timeout<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Option<&anyhow::Error>) + Send + 'static,
    {
        self.on_timeout = Some(Box::new(f));
        self
    }
}

// ============================================================================
// RESULTADO DE ASSERTION (FORMA DE REGISTRO)
// ============================================================================

/// Forma alternativa de chamada de `assert`: um registro pronto com
/// `passed`/`actual`/`expected` (tipicamente vindo de um helper do usuário).
#[derive(Debug, Clone)]
pub struct AssertionOutcome {
    pub passed: bool,
    pub actual: Option<Value>,
    pub expected: Option<Value>,
}

// ============================================================================
// CONSTRUÇÃO DO CONTEXTO
// ============================================================================

/// Opções de construção do [`Ctx`] (montadas pelo harness).
pub struct CtxOptions {
    pub vars: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub retry_count: u32,
    /// Permissão de env do sandbox: habilita o fallback de ambiente.
    pub allow_env: bool,
    pub emit_full_trace: bool,
    pub http: HttpSettings,
}

impl Default for CtxOptions {
    fn default() -> Self {
        Self {
            vars: HashMap::new(),
            secrets: HashMap::new(),
            retry_count: 0,
            allow_env: false,
            emit_full_trace: false,
            http: HttpSettings::default(),
        }
    }
}

pub(crate) struct CtxInner {
    vars: VarStore,
    secrets: VarStore,
    retry_count: u32,
    emit_full_trace: bool,
    sink: Arc<dyn EventSink>,
    counters: Mutex<Counters>,
    step_index: Mutex<Option<usize>>,
    fixtures: Mutex<HashMap<String, Value>>,
    http: http::HttpShared,
}

/// O contexto de execução entregue a todo corpo de teste.
///
/// Clonar é barato (Arc); todas as clones compartilham os mesmos
/// contadores e o mesmo sink.
#[derive(Clone)]
pub struct Ctx {
    inner: Arc<CtxInner>,
}

impl Ctx {
    pub fn new(options: CtxOptions, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(CtxInner {
                vars: VarStore::new("var", options.vars, options.allow_env),
                secrets: VarStore::new("secret", options.secrets, options.allow_env),
                retry_count: options.retry_count,
                emit_full_trace: options.emit_full_trace,
                sink,
                counters: Mutex::new(Counters::default()),
                step_index: Mutex::new(None),
                fixtures: Mutex::new(HashMap::new()),
                http: http::HttpShared::new(options.http),
            }),
        }
    }

    // ========================================================================
    // VARIÁVEIS / SEGREDOS / METADADOS
    // ========================================================================

    pub fn vars(&self) -> &VarStore {
        &self.inner.vars
    }

    pub fn secrets(&self) -> &VarStore {
        &self.inner.secrets
    }

    /// Índice de retry fornecido pelo engine (0 na primeira execução).
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count
    }

    /// Valor de uma fixture instalada (testes multi-step).
    pub fn fixture(&self, name: &str) -> Option<Value> {
        lock(&self.inner.fixtures).get(name).cloned()
    }

    /// Uso de memória corrente, quando o runtime expõe.
    pub fn memory_usage(&self) -> Option<MemoryStats> {
        memory_usage()
    }

    // ========================================================================
    // EMISSÃO DE EVENTOS (interno)
    // ========================================================================

    pub(crate) fn emit(&self, event: TimelineEvent) {
        self.inner.sink.emit(&event);
    }

    pub(crate) fn current_step(&self) -> Option<usize> {
        *lock(&self.inner.step_index)
    }

    pub(crate) fn set_step_index(&self, index: Option<usize>) {
        *lock(&self.inner.step_index) = index;
    }

    pub(crate) fn with_counters<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> R {
        f(&mut lock(&self.inner.counters))
    }

    pub(crate) fn reset_attempt_counters(&self) {
        self.with_counters(|c| {
            c.attempt_assertions = 0;
            c.attempt_failed_assertions = 0;
        });
    }

    pub(crate) fn attempt_assertions(&self) -> u64 {
        self.with_counters(|c| c.attempt_assertions)
    }

    pub(crate) fn attempt_failed_assertions(&self) -> u64 {
        self.with_counters(|c| c.attempt_failed_assertions)
    }

    pub(crate) fn install_fixture(&self, name: &str, value: Value) {
        lock(&self.inner.fixtures).insert(name.to_string(), value);
    }

    pub(crate) fn emit_full_trace(&self) -> bool {
        self.inner.emit_full_trace
    }

    pub(crate) fn http_shared(&self) -> &http::HttpShared {
        &self.inner.http
    }

    // ========================================================================
    // LOG
    // ========================================================================

    pub fn log(&self, message: impl Into<String>) {
        self.emit(TimelineEvent::Log {
            message: message.into(),
            data: None,
            step_index: self.current_step(),
        });
    }

    /// Log com payload estruturado.
    pub fn log_with(&self, message: impl Into<String>, data: Value) {
        self.emit(TimelineEvent::Log {
            message: message.into(),
            data: Some(data),
            step_index: self.current_step(),
        });
    }

    // ========================================================================
    // ASSERTIONS (SOFT)
    // ========================================================================

    pub(crate) fn record_assertion(
        &self,
        passed: bool,
        message: Option<String>,
        actual: Option<Value>,
        expected: Option<Value>,
    ) {
        self.with_counters(|c| {
            c.assertion_total += 1;
            c.attempt_assertions += 1;
            if !passed {
                c.assertion_failed += 1;
                c.attempt_failed_assertions += 1;
            }
        });
        self.emit(TimelineEvent::Assertion {
            passed,
            message,
            actual,
            expected,
            step_index: self.current_step(),
        });
    }

    /// Assertion soft sobre uma condição booleana.
    pub fn assert(&self, condition: bool, message: impl Into<String>) {
        self.record_assertion(condition, Some(message.into()), None, None);
    }

    /// Assertion soft com `actual`/`expected` anexados ao evento.
    pub fn assert_with(
        &self,
        condition: bool,
        message: impl Into<String>,
        actual: impl Into<Value>,
        expected: impl Into<Value>,
    ) {
        self.record_assertion(
            condition,
            Some(message.into()),
            Some(actual.into()),
            Some(expected.into()),
        );
    }

    /// Assertion a partir de um registro pronto (segunda forma de chamada).
    pub fn assert_outcome(&self, outcome: AssertionOutcome, message: Option<&str>) {
        self.record_assertion(
            outcome.passed,
            message.map(String::from),
            outcome.actual,
            outcome.expected,
        );
    }

    /// Builder fluente de expectativas; cada matcher passa pela mesma
    /// pipeline de assertion (mesmos contadores, mesmo formato de evento).
    pub fn expect(&self, actual: impl Into<Value>) -> Expectation {
        Expectation::new(self.clone(), actual.into())
    }

    /// Falha explícita: emite a assertion falhada e devolve o erro-sentinela
    /// que termina o corpo do teste (`return Err(ctx.fail("...")),` ou `?`).
    #[must_use = "fail() returns the sentinel error; propagate it to end the test"]
    pub fn fail(&self, message: impl Into<String>) -> anyhow::Error {
        let message = message.into();
        self.record_assertion(false, Some(message.clone()), None, None);
        anyhow::Error::new(TestAbort::Failed { message })
    }

    /// Pulo explícito: o harness converte no status final `skipped`.
    #[must_use = "skip() returns the sentinel error; propagate it to end the test"]
    pub fn skip(&self, reason: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(TestAbort::Skipped {
            reason: Some(reason.into()),
        })
    }

    // ========================================================================
    // WARNINGS
    // ========================================================================

    /// Checagem soft: `condition == false` conta como warning disparado.
    /// Nunca afeta o veredito do teste.
    pub fn warn(&self, condition: bool, message: impl Into<String>) {
        self.with_counters(|c| {
            c.warning_total += 1;
            if !condition {
                c.warning_triggered += 1;
            }
        });
        self.emit(TimelineEvent::Warning {
            condition,
            message: message.into(),
            step_index: self.current_step(),
        });
    }

    // ========================================================================
    // MÉTRICAS E TRACES MANUAIS
    // ========================================================================

    pub fn metric(&self, name: impl Into<String>, value: f64) {
        self.metric_with(name, value, None, None);
    }

    pub fn metric_with(
        &self,
        name: impl Into<String>,
        value: f64,
        unit: Option<String>,
        tags: Option<HashMap<String, String>>,
    ) {
        self.emit(TimelineEvent::Metric {
            name: name.into(),
            value,
            unit,
            tags,
            step_index: self.current_step(),
        });
    }

    /// Trace iniciado pelo usuário; carrega só os campos fornecidos.
    pub fn trace(&self, data: TraceData) {
        self.emit(TimelineEvent::Trace {
            data,
            step_index: self.current_step(),
        });
    }

    // ========================================================================
    // VALIDAÇÃO DE SCHEMA
    // ========================================================================

    /// Valida `data` contra um JSON Schema (severidade `error`): falha conta
    /// como assertion falhada, mas o teste continua. Retorna o dado validado
    /// em caso de sucesso.
    pub fn validate(&self, data: &Value, schema: &Value, label: &str) -> Option<Value> {
        validate::run(self, data, schema, label, Severity::Error)
            .unwrap_or_default()
    }

    /// Severidade `warn`: nunca falha o teste.
    pub fn validate_warn(&self, data: &Value, schema: &Value, label: &str) -> Option<Value> {
        validate::run(self, data, schema, label, Severity::Warn).unwrap_or_default()
    }

    /// Severidade `fatal`: assertion falhada + aborta o teste (propague o
    /// erro com `?`).
    pub fn validate_fatal(&self, data: &Value, schema: &Value, label: &str) -> Result<Value> {
        match validate::run(self, data, schema, label, Severity::Fatal)? {
            Some(value) => Ok(value),
            // run() com Fatal só retorna Ok(Some) ou Err.
            None => Err(anyhow!("schema validation produced no value")),
        }
    }

    // ========================================================================
    // HTTP
    // ========================================================================

    /// Cliente HTTP rastreado: todo request emite um `trace` e uma métrica
    /// `http_duration_ms`, e pode validar query/body/resposta via schema.
    pub fn http(&self) -> Http {
        Http::new(self.clone())
    }

    // ========================================================================
    // CONTROLE DE FLUXO
    // ========================================================================

    /// Pede ao engine para rearmar o deadline de wall-clock. Zero é ignorado.
    pub fn set_timeout(&self, timeout_ms: u64) {
        if timeout_ms == 0 {
            return;
        }
        self.emit(TimelineEvent::TimeoutUpdate {
            timeout: timeout_ms,
        });
    }

    /// Avalia `f` repetidamente até retornar `Some`, com deadline.
    ///
    /// Erros de `f` são lembrados e o polling continua. No estouro do
    /// deadline: com `on_timeout` configurado, o callback recebe o último
    /// erro e o retorno é `Ok(None)`; sem ele, o erro é
    /// `pollUntil timed out after {N}ms` (com o último erro anexado).
    /// O sleep final nunca ultrapassa o deadline.
    pub async fn poll_until<T, F, Fut>(
        &self,
        options: PollUntilOptions,
        mut f: F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let PollUntilOptions {
            timeout_ms,
            interval_ms,
            on_timeout,
        } = options;
        // Relógio do tokio (não o do sistema): o deadline acompanha o
        // tempo virtual em testes com clock pausado.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let interval = Duration::from_millis(interval_ms.max(1));
        let mut last_error: Option<anyhow::Error> = None;

        loop {
            match f().await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => {
                    // Sentinelas (fail/skip) atravessam o polling.
                    if e.downcast_ref::<TestAbort>().is_some() {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                if let Some(on_timeout) = on_timeout {
                    on_timeout(last_error.as_ref());
                    return Ok(None);
                }
                return Err(coded(
                    ErrorCode::POLL_TIMEOUT,
                    match last_error {
                        Some(e) => format!(
                            "pollUntil timed out after {}ms: last error: {}",
                            timeout_ms, e
                        ),
                        None => format!("pollUntil timed out after {}ms", timeout_ms),
                    },
                ));
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    // ========================================================================
    // SUMMARY
    // ========================================================================

    /// Snapshot dos contadores agregados.
    pub fn summary_data(&self) -> SummaryData {
        self.with_counters(|c| c.summary())
    }

    /// Emite o evento `summary` (chamado exatamente uma vez, pelo harness).
    pub fn emit_summary(&self) {
        self.emit(TimelineEvent::Summary {
            data: self.summary_data(),
        });
    }
}

// ============================================================================
// HELPERS DE TESTE (crate-interno)
// ============================================================================

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Ctx ligado a um MemorySink, para inspecionar eventos emitidos.
    pub(crate) fn ctx_with_sink() -> (Ctx, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let ctx = Ctx::new(CtxOptions::default(), sink.clone());
        (ctx, sink)
    }

    pub(crate) fn ctx_with_options(options: CtxOptions) -> (Ctx, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let ctx = Ctx::new(options, sink.clone());
        (ctx, sink)
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use serde_json::json;

    // ========================================================================
    // Testes: vars e secrets
    // ========================================================================

    #[test]
    fn test_vars_get_empty_counts_as_absent() {
        let store = VarStore::new(
            "var",
            HashMap::from([
                ("SET".to_string(), "value".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]),
            false,
        );
        assert_eq!(store.get("SET").as_deref(), Some("value"));
        assert_eq!(store.get("EMPTY"), None);
        assert_eq!(store.get("MISSING"), None);
    }

    #[test]
    fn test_vars_env_fallback_requires_permission() {
        std::env::set_var("GLUBEAN_TEST_FALLBACK_VAR", "from-env");
        let without_env = VarStore::new("var", HashMap::new(), false);
        assert_eq!(without_env.get("GLUBEAN_TEST_FALLBACK_VAR"), None);

        let with_env = VarStore::new("var", HashMap::new(), true);
        assert_eq!(
            with_env.get("GLUBEAN_TEST_FALLBACK_VAR").as_deref(),
            Some("from-env")
        );
        std::env::remove_var("GLUBEAN_TEST_FALLBACK_VAR");
    }

    #[test]
    fn test_explicit_var_wins_over_env() {
        std::env::set_var("GLUBEAN_TEST_LAYER_VAR", "env-value");
        let store = VarStore::new(
            "var",
            HashMap::from([("GLUBEAN_TEST_LAYER_VAR".to_string(), "explicit".to_string())]),
            true,
        );
        assert_eq!(store.get("GLUBEAN_TEST_LAYER_VAR").as_deref(), Some("explicit"));
        std::env::remove_var("GLUBEAN_TEST_LAYER_VAR");
    }

    #[test]
    fn test_require_missing() {
        let store = VarStore::new("secret", HashMap::new(), false);
        let err = store.require("API_KEY").unwrap_err();
        assert_eq!(err.to_string(), "Missing required secret 'API_KEY'");
        let carried = err
            .downcast_ref::<crate::errors::CodedError>()
            .expect("missing_required carries a code");
        assert_eq!(carried.code, ErrorCode::MISSING_REQUIRED);
    }

    #[test]
    fn test_require_with_validator() {
        let store = VarStore::new(
            "var",
            HashMap::from([("URL".to_string(), "ftp://nope".to_string())]),
            false,
        );

        let err = store
            .require_with("URL", |v| {
                if v.starts_with("http") {
                    Validation::Valid
                } else {
                    Validation::InvalidWith("must start with http".to_string())
                }
            })
            .unwrap_err();
        assert!(err.to_string().contains("must start with http"));

        let err = store.require_with("URL", |_| Validation::Invalid).unwrap_err();
        assert_eq!(err.to_string(), "Validation failed for var 'URL'");
        assert_eq!(
            err.downcast_ref::<crate::errors::CodedError>().unwrap().code,
            ErrorCode::VALIDATION_FAILED
        );
    }

    #[test]
    fn test_all_returns_explicit_snapshot() {
        std::env::set_var("GLUBEAN_TEST_SNAPSHOT_VAR", "env");
        let store = VarStore::new(
            "var",
            HashMap::from([("A".to_string(), "1".to_string())]),
            true,
        );
        let all = store.all();
        assert_eq!(all.len(), 1);
        assert!(!all.contains_key("GLUBEAN_TEST_SNAPSHOT_VAR"));
        std::env::remove_var("GLUBEAN_TEST_SNAPSHOT_VAR");
    }

    // ========================================================================
    // Testes: assertions soft e contadores
    // ========================================================================

    #[test]
    fn test_assert_does_not_interrupt_and_counts() {
        let (ctx, sink) = ctx_with_sink();
        ctx.assert(false, "nope");
        ctx.log("after");

        let events = sink.events();
        assert_eq!(events.len(), 2, "failed assert must not stop execution");
        assert!(matches!(
            events[0],
            TimelineEvent::Assertion { passed: false, .. }
        ));

        let summary = ctx.summary_data();
        assert_eq!(summary.assertion_total, 1);
        assert_eq!(summary.assertion_failed, 1);
    }

    #[test]
    fn test_assert_outcome_record_shape() {
        let (ctx, sink) = ctx_with_sink();
        ctx.assert_outcome(
            AssertionOutcome {
                passed: true,
                actual: Some(json!(200)),
                expected: Some(json!(200)),
            },
            Some("status matches"),
        );
        match &sink.events()[0] {
            TimelineEvent::Assertion {
                passed,
                message,
                actual,
                expected,
                ..
            } => {
                assert!(*passed);
                assert_eq!(message.as_deref(), Some("status matches"));
                assert_eq!(actual, &Some(json!(200)));
                assert_eq!(expected, &Some(json!(200)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_fail_emits_assertion_and_sentinel() {
        let (ctx, sink) = ctx_with_sink();
        let err = ctx.fail("boom");
        assert!(matches!(
            err.downcast_ref::<TestAbort>(),
            Some(TestAbort::Failed { .. })
        ));
        assert!(matches!(
            sink.events()[0],
            TimelineEvent::Assertion { passed: false, .. }
        ));
        assert_eq!(ctx.summary_data().assertion_failed, 1);
    }

    #[test]
    fn test_skip_sentinel_carries_reason() {
        let (ctx, _sink) = ctx_with_sink();
        let err = ctx.skip("not ready");
        match err.downcast_ref::<TestAbort>() {
            Some(TestAbort::Skipped { reason }) => {
                assert_eq!(reason.as_deref(), Some("not ready"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    // ========================================================================
    // Testes: warnings
    // ========================================================================

    #[test]
    fn test_warn_counters() {
        let (ctx, sink) = ctx_with_sink();
        ctx.warn(true, "latency under 2s");
        ctx.warn(false, "deprecated field present");

        let summary = ctx.summary_data();
        assert_eq!(summary.warning_total, 2);
        assert_eq!(summary.warning_triggered, 1);
        // Warnings nunca contaminam os contadores de assertion.
        assert_eq!(summary.assertion_total, 0);
        assert_eq!(sink.events().len(), 2);
    }

    // ========================================================================
    // Testes: step index tagging
    // ========================================================================

    #[test]
    fn test_events_carry_current_step_index() {
        let (ctx, sink) = ctx_with_sink();
        ctx.set_step_index(Some(2));
        ctx.log("inside step");
        ctx.assert(true, "ok");
        ctx.set_step_index(None);
        ctx.log("outside");

        let events = sink.events();
        assert_eq!(events[0].step_index(), Some(2));
        assert_eq!(events[1].step_index(), Some(2));
        assert_eq!(events[2].step_index(), None);
    }

    // ========================================================================
    // Testes: set_timeout
    // ========================================================================

    #[test]
    fn test_set_timeout_emits_update_and_ignores_zero() {
        let (ctx, sink) = ctx_with_sink();
        ctx.set_timeout(0);
        ctx.set_timeout(5000);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], TimelineEvent::TimeoutUpdate { timeout: 5000 });
    }

    // ========================================================================
    // Testes: poll_until
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_on_truthy() {
        let (ctx, _sink) = ctx_with_sink();
        let mut calls = 0u32;
        let result = ctx
            .poll_until(PollUntilOptions::new(10_000).interval_ms(100), || {
                calls += 1;
                let done = calls >= 3;
                async move { Ok(if done { Some("ready") } else { None }) }
            })
            .await
            .unwrap();
        assert_eq!(result, Some("ready"));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_timeout_message_includes_last_error() {
        let (ctx, _sink) = ctx_with_sink();
        let err = ctx
            .poll_until::<(), _, _>(PollUntilOptions::new(300).interval_ms(100), || async {
                Err(anyhow!("connection refused"))
            })
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("pollUntil timed out after 300ms"));
        assert!(message.contains("connection refused"));
        assert_eq!(
            err.downcast_ref::<crate::errors::CodedError>().unwrap().code,
            ErrorCode::POLL_TIMEOUT
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_on_timeout_recovers() {
        let (ctx, _sink) = ctx_with_sink();
        let result = ctx
            .poll_until::<(), _, _>(
                PollUntilOptions::new(250)
                    .interval_ms(100)
                    .on_timeout(|last| assert!(last.is_none())),
                || async { Ok(None) },
            )
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_call_count_bounds() {
        // T=1000, I=300: pelo menos 3 chamadas, no máximo 5, sem dormir
        // além do deadline.
        let (ctx, _sink) = ctx_with_sink();
        let mut calls = 0u32;
        let _ = ctx
            .poll_until::<(), _, _>(
                PollUntilOptions::new(1000)
                    .interval_ms(300)
                    .on_timeout(|_| {}),
                || {
                    calls += 1;
                    async { Ok(None) }
                },
            )
            .await;
        assert!(calls >= 3, "expected at least floor(T/I) calls, got {calls}");
        assert!(calls <= 5, "expected at most ceil(T/I)+1 calls, got {calls}");
    }

    // ========================================================================
    // Testes: summary
    // ========================================================================

    #[test]
    fn test_summary_error_rate() {
        let (ctx, _sink) = ctx_with_sink();
        ctx.with_counters(|c| {
            c.http_request_total = 4;
            c.http_error_total = 1;
        });
        let summary = ctx.summary_data();
        assert!((summary.http_error_rate - 0.25).abs() < f64::EPSILON);

        let (empty_ctx, _sink) = ctx_with_sink();
        assert_eq!(empty_ctx.summary_data().http_error_rate, 0.0);
    }

    #[test]
    fn test_emit_summary_event() {
        let (ctx, sink) = ctx_with_sink();
        ctx.assert(true, "ok");
        ctx.emit_summary();
        let events = sink.events();
        match events.last().unwrap() {
            TimelineEvent::Summary { data } => {
                assert_eq!(data.assertion_total, 1);
                assert_eq!(data.assertion_failed, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ========================================================================
    // Testes: parse de /proc/self/status
    // ========================================================================

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\tglubean\nVmPeak:\t  10000 kB\nVmHWM:\t    2048 kB\nVmRSS:\t    1024 kB\n";
        let stats = parse_proc_status(status).unwrap();
        assert_eq!(stats.rss_bytes, 1024 * 1024);
        assert_eq!(stats.peak_rss_bytes, 2048 * 1024);
    }

    #[test]
    fn test_parse_proc_status_missing_rss() {
        assert!(parse_proc_status("Name:\tglubean\n").is_none());
    }
}
