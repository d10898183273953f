//! # Executor de Subprocess
//!
//! Um teste = um subprocess, sem reuso. O executor monta a invocação do
//! harness a partir da configuração resolvida, alimenta o contexto via
//! stdin e consome o stdout linha a linha como eventos de timeline.
//!
//! ## Ciclo de vida do processo
//!
//! ```text
//! spawn (flags de sandbox + --testId)      stdin <- contexto JSON, fecha
//!   |                                       stdout -> eventos NDJSON
//!   v                                       stderr -> buffer (debug: herda)
//! leitura com deadline de wall-clock  <--- `timeout_update` rearma
//!   |
//!   v
//! exit -> classificação:
//!   0                      conclusão normal
//!   timeout disparado      "Test execution timed out after Nms"
//!   SIGKILL / exit 137     OOM (com dica de remediação)
//!   SIGTERM / exit 143     terminado (stderr quando houver)
//!   outro não-zero         stderr, senão "Process exited with code N"
//! ```
//!
//! Um exit não-zero de um teste que JÁ emitiu seu `status` terminal não é
//! reclassificado: o evento injetado de engine existe para falhas de nível
//! de processo, onde a timeline ficou sem desfecho. Depois de injetar um
//! `error`, o engine não acrescenta `summary` nem `status`.
//!
//! Linhas que não parseiam viram eventos `log` sintetizados; o kill no
//! cleanup é sempre tentado, mesmo após saída normal.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::ErrorCode;
use crate::protocol::{
    parse_event_line, ExecutionContext, ExecutionResult, RecordedEvent, TimelineEvent,
};

use super::config::{RunConfig, DEFAULT_PER_TEST_TIMEOUT_MS};

/// Callback de encaminhamento de eventos (modo batch).
pub type EventCallback = Arc<dyn Fn(&RecordedEvent) + Send + Sync>;

/// Seam de execução: o scheduler não conhece subprocess, só este trait.
/// Permite plugar um runner in-process isolado mantendo o protocolo de
/// timeline como contrato estável.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_test(&self, test_id: &str) -> ExecutionResult;
}

// ============================================================================
// OPÇÕES
// ============================================================================

/// Opções de uma execução de subprocess.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Deadline de wall-clock em milissegundos.
    pub timeout_ms: u64,
    /// Fallback de resolução por nome de export.
    pub export_name: Option<String>,
    pub emit_full_trace: bool,
    /// Flags de sandbox já resolvidos (ver `RunConfig::sandbox_flags`).
    pub sandbox_flags: Vec<String>,
    /// Teto de memória repassado ao harness.
    pub max_memory_mb: Option<u64>,
    /// Herda o stderr do engine (debug) em vez de capturá-lo.
    pub inherit_stderr: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_PER_TEST_TIMEOUT_MS,
            export_name: None,
            emit_full_trace: false,
            sandbox_flags: vec!["--allow-read".to_string()],
            max_memory_mb: None,
            inherit_stderr: false,
        }
    }
}

impl RunOptions {
    /// Deriva as opções do executor de uma configuração compartilhada.
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            timeout_ms: config.per_test_timeout_ms,
            emit_full_trace: config.emit_full_trace,
            sandbox_flags: config.sandbox_flags(),
            ..Self::default()
        }
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Executa testes de um binário de suite, um subprocess por teste.
pub struct SubprocessExecutor {
    suite_bin: PathBuf,
    context: ExecutionContext,
    options: RunOptions,
    on_event: Option<EventCallback>,
}

impl SubprocessExecutor {
    pub fn new(
        suite_bin: impl Into<PathBuf>,
        context: ExecutionContext,
        options: RunOptions,
    ) -> Self {
        Self {
            suite_bin: suite_bin.into(),
            context,
            options,
            on_event: None,
        }
    }

    /// Encaminha cada evento (com `testId`) assim que é lido.
    pub fn with_on_event(mut self, on_event: EventCallback) -> Self {
        self.on_event = Some(on_event);
        self
    }

    fn record(
        &self,
        events: &mut Vec<RecordedEvent>,
        test_id: &str,
        started: Instant,
        event: TimelineEvent,
    ) {
        let recorded = RecordedEvent {
            at_ms: started.elapsed().as_millis() as u64,
            test_id: Some(test_id.to_string()),
            event,
        };
        if let Some(on_event) = &self.on_event {
            on_event(&recorded);
        }
        events.push(recorded);
    }

    /// Roda um teste até o fim e monta o `ExecutionResult`.
    ///
    /// Nunca retorna `Err`: falhas de spawn e de processo viram eventos
    /// `error` no resultado, para que o scheduler trate tudo igual.
    pub async fn run(&self, test_id: &str) -> ExecutionResult {
        let started = Instant::now();
        let mut events: Vec<RecordedEvent> = Vec::new();

        let mut command = Command::new(&self.suite_bin);
        command.args(&self.options.sandbox_flags);
        if let Some(cap) = self.options.max_memory_mb {
            command.arg(format!("--max-memory-mb={}", cap));
        }
        command.arg(format!("--testId={}", test_id));
        if let Some(export_name) = &self.options.export_name {
            command.arg(format!("--exportName={}", export_name));
        }
        if self.options.emit_full_trace {
            command.arg("--emitFullTrace");
        }
        // Override de configuração de dev: repassado como --config.
        if let Ok(dev_config) = std::env::var("GLUBEAN_DEV_CONFIG") {
            if !dev_config.is_empty() {
                command.arg(format!("--config={}", dev_config));
            }
        }

        // O ambiente só atravessa quando o preset de permissões incluiu
        // acesso a env.
        let env_allowed = self
            .options
            .sandbox_flags
            .iter()
            .any(|flag| flag == "--allow-env");
        if !env_allowed {
            command.env_clear();
        }

        let debug_mode = self.options.inherit_stderr
            || std::env::var("GLUBEAN_DEBUG").map(|v| !v.is_empty()).unwrap_or(false);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if debug_mode {
                Stdio::inherit()
            } else {
                Stdio::piped()
            })
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(test_id, code = %ErrorCode::SPAWN_FAILED, error = %e, "Failed to spawn test process");
                self.record(
                    &mut events,
                    test_id,
                    started,
                    TimelineEvent::Error {
                        message: format!(
                            "Failed to spawn test process '{}': {}",
                            self.suite_bin.display(),
                            e
                        ),
                    },
                );
                return ExecutionResult::from_events(
                    test_id,
                    events,
                    started.elapsed().as_millis() as u64,
                    self.context.retry_count,
                );
            }
        };

        // Contexto via stdin, fechado logo em seguida (o harness lê o
        // stream inteiro).
        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&self.context).unwrap_or_else(|_| b"{}".to_vec());
            if let Err(e) = stdin.write_all(&payload).await {
                warn!(error = %e, "Failed to write execution context to sandbox stdin");
            }
            drop(stdin);
        }

        // stderr em paralelo, para não travar o filho com o pipe cheio.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let _ = stderr.read_to_end(&mut buffer).await;
                String::from_utf8_lossy(&buffer).into_owned()
            })
        });

        let mut timed_out = false;
        let mut effective_timeout_ms = self.options.timeout_ms;
        let mut deadline =
            tokio::time::Instant::now() + Duration::from_millis(effective_timeout_ms);

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let event = parse_event_line(&line);
                            // O runtime pode pedir mais (ou menos) tempo.
                            if let TimelineEvent::TimeoutUpdate { timeout } = &event {
                                effective_timeout_ms = *timeout;
                                deadline = tokio::time::Instant::now()
                                    + Duration::from_millis(*timeout);
                                debug!(timeout_ms = timeout, "Deadline re-armed by sandbox");
                            }
                            self.record(&mut events, test_id, started, event);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Failed reading sandbox stdout");
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        timed_out = true;
                        let _ = child.start_kill();
                        break;
                    }
                }
            }
        }

        let status = child.wait().await.ok();
        let stderr_output = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let exited_cleanly = status.map(|s| s.success()).unwrap_or(false);
        if !exited_cleanly {
            let saw_status = events
                .iter()
                .any(|e| matches!(e.event, TimelineEvent::Status { .. }));
            if let Some((code, message)) = classify_failure(
                timed_out,
                effective_timeout_ms,
                status,
                &stderr_output,
                saw_status,
            ) {
                warn!(
                    test_id,
                    code = %code,
                    category = code.category().as_str(),
                    "Subprocess failure: {}",
                    message
                );
                self.record(&mut events, test_id, started, TimelineEvent::Error { message });
            }
        }

        // Kill de limpeza: inócuo após a saída, necessário nos caminhos de
        // timeout para não vazar processos.
        let _ = child.start_kill();

        ExecutionResult::from_events(
            test_id,
            events,
            started.elapsed().as_millis() as u64,
            self.context.retry_count,
        )
    }
}

#[async_trait]
impl TestRunner for SubprocessExecutor {
    async fn run_test(&self, test_id: &str) -> ExecutionResult {
        self.run(test_id).await
    }
}

// ============================================================================
// CLASSIFICAÇÃO DE SAÍDA
// ============================================================================

/// Classifica uma saída não-zero em um código estruturado + mensagem.
///
/// Retorna `None` quando a timeline já carrega um `status` terminal (um
/// teste falhado sai com 1 depois de reportar tudo; nada a injetar).
fn classify_failure(
    timed_out: bool,
    timeout_ms: u64,
    status: Option<std::process::ExitStatus>,
    stderr: &str,
    saw_status: bool,
) -> Option<(ErrorCode, String)> {
    if timed_out {
        return Some((
            ErrorCode::PROCESS_TIMEOUT,
            format!("Test execution timed out after {}ms", timeout_ms),
        ));
    }

    let code = status.and_then(|s| s.code());
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.and_then(|s| s.signal())
    };
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    // SIGKILL / 137: o processo morreu sem chance de reportar nada.
    if code == Some(137) || signal == Some(9) {
        return Some((
            ErrorCode::PROCESS_OOM,
            "Out of memory: the test process was killed (SIGKILL). Raise the memory cap with --max-memory-mb or reduce per-test memory usage."
                .to_string(),
        ));
    }
    if code == Some(143) || signal == Some(15) {
        let stderr = stderr.trim();
        return Some((
            ErrorCode::PROCESS_TERMINATED,
            if stderr.is_empty() {
                "Test process terminated (SIGTERM) before completion".to_string()
            } else {
                format!("Test process terminated (SIGTERM): {}", stderr)
            },
        ));
    }

    if saw_status {
        // Saída não-zero de uma timeline completa = teste falhado normal.
        return None;
    }

    let stderr = stderr.trim();
    Some((
        ErrorCode::PROCESS_EXIT,
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            format!("Process exited with code {}", code.unwrap_or(-1))
        },
    ))
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    static SCRIPT_COUNTER: AtomicU32 = AtomicU32::new(0);

    /// Escreve um shell script executável que faz o papel de um binário de
    /// suite (ignora os flags que o executor passa).
    fn script_runner(body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = std::env::temp_dir().join(format!(
            "glubean-executor-test-{}-{}.sh",
            std::process::id(),
            SCRIPT_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn executor_for(script: &PathBuf, timeout_ms: u64) -> SubprocessExecutor {
        SubprocessExecutor::new(
            script.clone(),
            ExecutionContext::default(),
            RunOptions {
                timeout_ms,
                ..RunOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn test_happy_path_parses_events_and_synthesizes_logs() {
        let script = script_runner(concat!(
            "cat > /dev/null\n",
            "echo '{\"type\":\"start\",\"id\":\"t1\",\"name\":\"first\"}'\n",
            "echo 'stray print from user code'\n",
            "echo '{\"type\":\"assertion\",\"passed\":true,\"message\":\"ok\"}'\n",
            "echo '{\"type\":\"summary\",\"data\":{\"assertionTotal\":1}}'\n",
            "echo '{\"type\":\"status\",\"status\":\"completed\",\"id\":\"t1\"}'\n",
        ));
        let result = executor_for(&script, 5_000).run("t1").await;
        let _ = std::fs::remove_file(&script);

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.test_name.as_deref(), Some("first"));
        assert_eq!(result.assertion_count, 1);
        assert_eq!(result.failed_assertion_count, 0);
        assert_eq!(result.events.len(), 5);
        // Linha solta preservada como log sintetizado.
        assert!(result.events.iter().any(|e| matches!(
            &e.event,
            TimelineEvent::Log { message, .. } if message == "stray print from user code"
        )));
        // Todos os eventos carregam o testId do lote.
        assert!(result.events.iter().all(|e| e.test_id.as_deref() == Some("t1")));
    }

    #[tokio::test]
    async fn test_wall_clock_timeout_injects_error() {
        let script = script_runner(concat!(
            "cat > /dev/null\n",
            "echo '{\"type\":\"start\",\"id\":\"slow\"}'\n",
            "sleep 10\n",
        ));
        let started = Instant::now();
        let result = executor_for(&script, 200).run("slow").await;
        let _ = std::fs::remove_file(&script);

        assert!(started.elapsed() < Duration::from_secs(5), "must not wait the sleep out");
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Test execution timed out after 200ms")
        );
        // Depois do erro injetado, nenhum summary/status sintético aparece.
        assert!(!result
            .events
            .iter()
            .any(|e| matches!(e.event, TimelineEvent::Status { .. })));
    }

    #[tokio::test]
    async fn test_timeout_update_rearms_deadline() {
        let script = script_runner(concat!(
            "cat > /dev/null\n",
            "echo '{\"type\":\"start\",\"id\":\"needs-time\"}'\n",
            "echo '{\"type\":\"timeout_update\",\"timeout\":10000}'\n",
            "sleep 1\n",
            "echo '{\"type\":\"status\",\"status\":\"completed\",\"id\":\"needs-time\"}'\n",
        ));
        // Deadline inicial de 400ms; o update para 10s deixa o sleep de 1s
        // terminar.
        let result = executor_for(&script, 400).run("needs-time").await;
        let _ = std::fs::remove_file(&script);

        assert!(result.success, "error: {:?}", result.error);
    }

    #[tokio::test]
    async fn test_exit_code_without_status_is_classified() {
        let script = script_runner("cat > /dev/null\nexit 7\n");
        let result = executor_for(&script, 5_000).run("t").await;
        let _ = std::fs::remove_file(&script);

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Process exited with code 7"));
    }

    #[tokio::test]
    async fn test_stderr_surfaces_on_nonzero_exit() {
        let script = script_runner(concat!(
            "cat > /dev/null\n",
            "echo 'module panicked at start' >&2\n",
            "exit 3\n",
        ));
        let result = executor_for(&script, 5_000).run("t").await;
        let _ = std::fs::remove_file(&script);

        assert_eq!(result.error.as_deref(), Some("module panicked at start"));
    }

    #[tokio::test]
    async fn test_sigkill_is_classified_as_oom() {
        let script = script_runner("cat > /dev/null\nkill -9 $$\n");
        let result = executor_for(&script, 5_000).run("t").await;
        let _ = std::fs::remove_file(&script);

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("Out of memory"), "got: {error}");
        assert!(error.contains("--max-memory-mb"), "remediation hint: {error}");
    }

    #[tokio::test]
    async fn test_sigterm_is_classified_as_terminated() {
        let script = script_runner("cat > /dev/null\nkill -TERM $$\n");
        let result = executor_for(&script, 5_000).run("t").await;
        let _ = std::fs::remove_file(&script);

        assert!(result
            .error
            .unwrap()
            .contains("terminated (SIGTERM)"));
    }

    #[tokio::test]
    async fn test_failed_test_with_terminal_status_gets_no_injected_error() {
        let script = script_runner(concat!(
            "cat > /dev/null\n",
            "echo '{\"type\":\"start\",\"id\":\"t\"}'\n",
            "echo '{\"type\":\"assertion\",\"passed\":false,\"message\":\"nope\"}'\n",
            "echo '{\"type\":\"summary\",\"data\":{\"assertionTotal\":1,\"assertionFailed\":1}}'\n",
            "echo '{\"type\":\"status\",\"status\":\"failed\",\"id\":\"t\",\"error\":\"1 assertion failed\"}'\n",
            "exit 1\n",
        ));
        let result = executor_for(&script, 5_000).run("t").await;
        let _ = std::fs::remove_file(&script);

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("1 assertion failed"));
        assert!(
            !result
                .events
                .iter()
                .any(|e| matches!(e.event, TimelineEvent::Error { .. })),
            "clean failed timeline must not gain an engine error"
        );
    }

    #[tokio::test]
    async fn test_context_json_reaches_stdin() {
        // O script ecoa o stdin; o contexto volta como log sintetizado.
        let script = script_runner("cat\n");
        let mut vars = HashMap::new();
        vars.insert("API_URL".to_string(), "https://x.example.com".to_string());
        let executor = SubprocessExecutor::new(
            script.clone(),
            ExecutionContext {
                vars,
                secrets: HashMap::new(),
                retry_count: 2,
            },
            RunOptions {
                timeout_ms: 5_000,
                ..RunOptions::default()
            },
        );
        let result = executor.run("t").await;
        let _ = std::fs::remove_file(&script);

        assert_eq!(result.retry_count, 2);
        assert!(result.events.iter().any(|e| matches!(
            &e.event,
            TimelineEvent::Log { message, .. }
                if message.contains("API_URL") && message.contains("retryCount")
        )));
    }

    #[tokio::test]
    async fn test_spawn_failure_becomes_error_event() {
        let executor = SubprocessExecutor::new(
            PathBuf::from("/nonexistent/glubean-suite"),
            ExecutionContext::default(),
            RunOptions::default(),
        );
        let result = executor.run("t").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Failed to spawn"));
    }

    #[test]
    fn test_classify_failure_codes() {
        use std::os::unix::process::ExitStatusExt;
        // Status de wait crus: exit(n) é n << 8, sinal k é k.
        let exit = |code: i32| Some(std::process::ExitStatus::from_raw(code << 8));
        let signal = |sig: i32| Some(std::process::ExitStatus::from_raw(sig));

        let (code, message) = classify_failure(true, 250, exit(1), "", false).unwrap();
        assert_eq!(code, ErrorCode::PROCESS_TIMEOUT);
        assert!(message.contains("250ms"));

        let (code, _) = classify_failure(false, 0, exit(137), "", false).unwrap();
        assert_eq!(code, ErrorCode::PROCESS_OOM);
        let (code, _) = classify_failure(false, 0, signal(9), "", false).unwrap();
        assert_eq!(code, ErrorCode::PROCESS_OOM);

        let (code, message) =
            classify_failure(false, 0, signal(15), "shutting down", false).unwrap();
        assert_eq!(code, ErrorCode::PROCESS_TERMINATED);
        assert!(message.contains("shutting down"));

        let (code, message) = classify_failure(false, 0, exit(4), "", false).unwrap();
        assert_eq!(code, ErrorCode::PROCESS_EXIT);
        assert_eq!(message, "Process exited with code 4");

        // Timeline com status terminal: nada a injetar.
        assert!(classify_failure(false, 0, exit(1), "", true).is_none());
    }

    #[tokio::test]
    async fn test_on_event_forwards_with_test_id() {
        let script = script_runner(concat!(
            "cat > /dev/null\n",
            "echo '{\"type\":\"start\",\"id\":\"fwd\"}'\n",
            "echo '{\"type\":\"status\",\"status\":\"completed\",\"id\":\"fwd\"}'\n",
        ));
        let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_callback = seen.clone();
        let executor = SubprocessExecutor::new(
            script.clone(),
            ExecutionContext::default(),
            RunOptions {
                timeout_ms: 5_000,
                ..RunOptions::default()
            },
        )
        .with_on_event(Arc::new(move |event| {
            seen_in_callback.lock().unwrap().push(event.test_id.clone());
        }));

        let result = executor.run("fwd").await;
        let _ = std::fs::remove_file(&script);

        assert!(result.success);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|id| id.as_deref() == Some("fwd")));
    }
}
