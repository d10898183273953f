//! # Módulo de Protocolo - Eventos de Timeline e Resultados
//!
//! Este módulo define todas as **estruturas de dados** trocadas entre o
//! sandbox (processo filho que roda o teste) e o engine (processo pai que
//! orquestra a execução).
//!
//! ## Como funciona o protocolo?
//!
//! O sandbox escreve no stdout **um evento JSON por linha** (NDJSON).
//! O engine lê linha a linha e reconstrói a timeline do teste:
//!
//! ```text
//! {"type":"start","id":"login-flow","name":"Login flow"}
//! {"type":"assertion","passed":true,"message":"status is 200"}
//! {"type":"summary","data":{"assertionTotal":1,"assertionFailed":0,...}}
//! {"type":"status","status":"completed","id":"login-flow"}
//! ```
//!
//! ## Regras de ordenação (invariantes):
//!
//! - Exatamente um `start`; no máximo um `summary`; exatamente um `status`
//!   como último evento emitido pelo sandbox.
//! - Cada `step_start` tem exatamente um `step_end` com o mesmo `index`.
//! - Eventos emitidos dentro de um step carregam o `stepIndex` dele.
//!
//! ## Hierarquia de Tipos:
//!
//! ```text
//! TimelineEvent (wire, NDJSON)
//! ExecutionContext (stdin do sandbox: vars, secrets, retryCount)
//! RecordedEvent (engine: evento + timestamp relativo + testId)
//! ExecutionResult (engine: um subprocess)
//! BatchResult / BatchReport (engine: um lote)
//! ```
//!
//! Linhas que não são JSON válido nunca são descartadas: viram eventos
//! `log` sintetizados (prints soltos de código de usuário são preservados).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ============================================================================
// DISCRIMINADORES
// ============================================================================

/// Severidade de uma validação de schema.
///
/// - `error`: falha conta como assertion falhada (padrão)
/// - `warn`: apenas registra, nunca falha o teste
/// - `fatal`: assertion falhada + aborta o teste imediatamente
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warn,
    Fatal,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Error
    }
}

/// Desfecho de um step individual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// Status final de um teste, reportado no último evento do sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Completed,
    Failed,
    Skipped,
}

// ============================================================================
// PAYLOADS AUXILIARES
// ============================================================================

/// Dados de um evento `trace` (requisição HTTP observada).
///
/// Com `emitFullTrace` habilitado, `headers` e `body` carregam um objeto
/// `{"request": ..., "response": ...}`; caso contrário ficam ausentes.
/// Bodies maiores que 10 KB chegam truncados com o sufixo `... (truncated)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceData {
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Contadores agregados de um teste, emitidos uma única vez no `summary`.
///
/// Os totais são a soma elemento a elemento dos contadores por step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SummaryData {
    pub http_request_total: u64,
    pub http_error_total: u64,
    pub http_error_rate: f64,
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
}

// ============================================================================
// EVENTO DE TIMELINE (WIRE)
// ============================================================================

/// Um evento NDJSON emitido pelo sandbox (ou injetado pelo engine).
///
/// O discriminador `type` é fixo para compatibilidade com o tooling
/// existente; campos desconhecidos são ignorados na leitura.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    /// Primeiro evento de todo teste.
    #[serde(rename_all = "camelCase")]
    Start {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_count: Option<u32>,
    },

    /// Log estruturado do usuário (ou linha não-JSON sintetizada).
    #[serde(rename_all = "camelCase")]
    Log {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_index: Option<usize>,
    },

    /// Assertion soft: registra pass/fail sem interromper o teste.
    #[serde(rename_all = "camelCase")]
    Assertion {
        passed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        actual: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_index: Option<usize>,
    },

    /// Checagem soft que nunca falha o teste.
    #[serde(rename_all = "camelCase")]
    Warning {
        condition: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_index: Option<usize>,
    },

    /// Resultado de uma validação de JSON Schema.
    #[serde(rename_all = "camelCase")]
    SchemaValidation {
        label: String,
        success: bool,
        severity: Severity,
        #[serde(skip_serializing_if = "Option::is_none")]
        issues: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_index: Option<usize>,
    },

    /// Requisição HTTP observada (automática ou iniciada pelo usuário).
    #[serde(rename_all = "camelCase")]
    Trace {
        data: TraceData,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_index: Option<usize>,
    },

    /// Métrica pontual (ex.: `http_duration_ms`).
    #[serde(rename_all = "camelCase")]
    Metric {
        name: String,
        value: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tags: Option<HashMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_index: Option<usize>,
    },

    /// Início de um step (testes multi-step).
    #[serde(rename_all = "camelCase")]
    StepStart { index: usize, name: String, total: usize },

    /// Fim de um step, com contadores da última tentativa.
    #[serde(rename_all = "camelCase")]
    StepEnd {
        index: usize,
        name: String,
        status: StepStatus,
        duration_ms: u64,
        assertions: u64,
        failed_assertions: u64,
        attempts: u32,
        retries_used: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        return_state: Option<Value>,
    },

    /// O runtime pede ao engine para rearmar o deadline de wall-clock.
    #[serde(rename_all = "camelCase")]
    TimeoutUpdate { timeout: u64 },

    /// Contadores agregados; emitido no máximo uma vez, antes do `status`.
    Summary { data: SummaryData },

    /// Status final do teste. Último evento emitido pelo sandbox.
    #[serde(rename_all = "camelCase")]
    Status {
        status: FinalStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        peak_memory_bytes: Option<u64>,
        #[serde(rename = "peakMemoryMB", skip_serializing_if = "Option::is_none")]
        peak_memory_mb: Option<f64>,
    },

    /// Falha de nível de processo injetada pelo engine (timeout, OOM, etc).
    Error { message: String },
}

impl TimelineEvent {
    /// Linha não-JSON sintetizada como log (nunca descartamos stdout).
    pub fn synthesized_log(raw: impl Into<String>) -> Self {
        TimelineEvent::Log {
            message: raw.into(),
            data: None,
            step_index: None,
        }
    }

    /// Retorna o `stepIndex` carregado pelo evento, se houver.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            TimelineEvent::Log { step_index, .. }
            | TimelineEvent::Assertion { step_index, .. }
            | TimelineEvent::Warning { step_index, .. }
            | TimelineEvent::SchemaValidation { step_index, .. }
            | TimelineEvent::Trace { step_index, .. }
            | TimelineEvent::Metric { step_index, .. } => *step_index,
            _ => None,
        }
    }
}

/// Parseia uma linha do stdout do sandbox.
///
/// Uma linha malformada (print solto, JSON truncado por um kill no meio da
/// emissão) nunca aborta o parsing: vira um evento `log` com a linha crua.
pub fn parse_event_line(line: &str) -> TimelineEvent {
    let trimmed = line.trim();
    match serde_json::from_str::<TimelineEvent>(trimmed) {
        Ok(event) => event,
        Err(_) => TimelineEvent::synthesized_log(trimmed),
    }
}

// ============================================================================
// CONTEXTO DE EXECUÇÃO (STDIN DO SANDBOX)
// ============================================================================

/// O objeto JSON que o engine escreve no stdin do sandbox.
///
/// Segredos viajam por stdin (nunca por argv) para não vazarem em listagens
/// de processo; o stream é fechado logo após a escrita.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub retry_count: u32,
}

// ============================================================================
// RESULTADOS (LADO DO ENGINE)
// ============================================================================

/// Um evento da timeline com timestamp relativo ao início do subprocess.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    pub at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(flatten)]
    pub event: TimelineEvent,
}

/// Resultado de um subprocess (um teste).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub test_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    pub events: Vec<RecordedEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub duration_ms: u64,
    pub retry_count: u32,
    pub assertion_count: u64,
    pub failed_assertion_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
}

impl ExecutionResult {
    /// Monta o resultado percorrendo a stream de eventos uma única vez.
    ///
    /// `success` exige as três condições: status final `completed` (ou
    /// `skipped`), zero assertions falhadas e nenhum evento `error`.
    pub fn from_events(
        test_id: &str,
        events: Vec<RecordedEvent>,
        duration_ms: u64,
        retry_count: u32,
    ) -> Self {
        let mut test_name = None;
        let mut assertion_count = 0u64;
        let mut failed_assertion_count = 0u64;
        let mut final_status: Option<FinalStatus> = None;
        let mut error: Option<String> = None;
        let mut stack: Option<String> = None;
        let mut peak_memory_bytes: Option<u64> = None;
        let mut engine_error = false;

        for recorded in &events {
            match &recorded.event {
                TimelineEvent::Start { name, .. } => {
                    if test_name.is_none() {
                        test_name = name.clone();
                    }
                }
                TimelineEvent::Assertion { passed, .. } => {
                    assertion_count += 1;
                    if !passed {
                        failed_assertion_count += 1;
                    }
                }
                TimelineEvent::Status {
                    status,
                    error: status_error,
                    stack: status_stack,
                    peak_memory_bytes: peak,
                    ..
                } => {
                    final_status = Some(*status);
                    if error.is_none() {
                        error = status_error.clone();
                    }
                    if stack.is_none() {
                        stack = status_stack.clone();
                    }
                    if peak.is_some() {
                        peak_memory_bytes = *peak;
                    }
                }
                TimelineEvent::Error { message } => {
                    engine_error = true;
                    if error.is_none() {
                        error = Some(message.clone());
                    }
                }
                _ => {}
            }
        }

        let completed = matches!(
            final_status,
            Some(FinalStatus::Completed) | Some(FinalStatus::Skipped)
        );
        let success = completed && failed_assertion_count == 0 && !engine_error;

        Self {
            success,
            test_id: test_id.to_string(),
            test_name,
            events,
            error,
            stack,
            duration_ms,
            retry_count,
            assertion_count,
            failed_assertion_count,
            peak_memory_bytes,
        }
    }
}

/// Resultado agregado de um lote de testes.
///
/// `results` preserva a ordem de entrada, omitindo os slots pulados pelo
/// fail-fast; `skipped_count` é exatamente `len(entrada) - len(results)`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub results: Vec<ExecutionResult>,
    pub success: bool,
    pub failed_count: u32,
    pub skipped_count: usize,
    pub duration_ms: u64,
}

/// Relatório serializável de uma execução em lote (saída do CLI).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub execution_id: String,
    pub suite: String,
    pub status: String,
    pub start_time: String,
    pub end_time: String,
    pub total: usize,
    pub failed: u32,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<ExecutionResult>,
}

// ============================================================================
// TESTES
// ============================================================================
