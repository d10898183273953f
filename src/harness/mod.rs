//! # Módulo de Harness - Ponto de Entrada do Sandbox
//!
//! O harness é o `main` de todo binário de testes do usuário: ele liga o
//! runtime ao teste resolvido e emite a timeline no stdout. As fases, em
//! ordem:
//!
//! 1. Instala o hook global de pânico (status `failed` + exit 1).
//! 2. Parseia os argumentos (`--testId`, `--exportName`, flags de sandbox).
//! 3. Lê o contexto de execução do stdin (JSON inteiro; segredos nunca
//!    passam por argv).
//! 4. Monta o [`Ctx`] e resolve o teste (id primeiro, export como
//!    fallback).
//! 5. Executa o corpo (simples ou steps) com o monitor de memória ativo.
//! 6. Emite exatamente um `summary` seguido de exatamente um `status`.
//!
//! ## Códigos de saída
//!
//! | Código | Significado |
//! |--------|-------------|
//! | 0      | `completed` ou `skipped` |
//! | 1      | `failed` ou erro interno |
//! | 137    | auto-kill por estouro do teto de memória (classificado como OOM pelo engine) |
//!
//! ## Exemplo de uso (binário de testes do usuário):
//!
//! ```ignore
//! fn main() -> ! {
//!     let module = Module::new().test(/* ... */);
//!     glubean::harness::main(module);
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

use crate::errors::{ErrorCode, TestAbort};
use crate::policy::NetworkAccess;
use crate::protocol::{ExecutionContext, FinalStatus, TimelineEvent};
use crate::resolver;
use crate::runtime::http::HttpSettings;
use crate::runtime::{self, Ctx, CtxOptions, EventSink, StdoutSink};
use crate::steps;
use crate::suite::{Module, TestBody, TestCase};

/// Intervalo de amostragem do monitor de memória.
const MEMORY_SAMPLE_INTERVAL_MS: u64 = 100;

// ============================================================================
// ARGUMENTOS
// ============================================================================

/// Argumentos do harness, montados pelo executor do engine.
#[derive(Parser, Debug)]
#[command(name = "glubean-harness", about = "Glubean in-sandbox test harness")]
pub struct HarnessArgs {
    /// Id estável do teste a executar.
    #[arg(long = "testId")]
    pub test_id: Option<String>,

    /// Nome do export; fallback para testes cujo id descoberto pode não
    /// bater com o id de execução.
    #[arg(long = "exportName")]
    pub export_name: Option<String>,

    /// Inclui headers e bodies truncados nos traces HTTP.
    #[arg(long = "emitFullTrace")]
    pub emit_full_trace: bool,

    /// Acesso de leitura; aceito por paridade com o conjunto de flags do
    /// engine (leitura é sempre permitida no harness).
    #[arg(long = "allow-read")]
    pub allow_read: bool,

    /// Habilita o fallback de variáveis de ambiente no lookup de vars.
    #[arg(long = "allow-env")]
    pub allow_env: bool,

    /// Política de rede: flag ausente = sem rede; sem valor ou `*` =
    /// irrestrito; lista separada por vírgula = allowlist.
    #[arg(long = "allow-net", num_args = 0..=1, default_missing_value = "*")]
    pub allow_net: Option<String>,

    /// Auto-kill (exit 137) quando o RSS passar deste teto, para que o OOM
    /// chegue ao engine como um sinal classificável.
    #[arg(long = "max-memory-mb")]
    pub max_memory_mb: Option<u64>,

    /// Arquivo JSON de configuração do runtime (override de dev).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Base URL do cliente HTTP do contexto.
    #[arg(long = "base-url")]
    pub base_url: Option<String>,

    /// Emite os testes descobríveis como uma linha JSON e sai.
    #[arg(long = "list")]
    pub list: bool,
}

/// Configuração opcional carregada de `--config` (ex.: apontada por
/// `GLUBEAN_DEV_CONFIG` no lado do engine).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarnessConfig {
    pub base_url: Option<String>,
    pub response_budget_bytes: Option<u64>,
    pub timeout_ms: Option<u64>,
}

// ============================================================================
// ENTRADA
// ============================================================================

/// Ponto de entrada do binário de testes. Nunca retorna.
pub fn main(module: Module) -> ! {
    let args = HarnessArgs::parse();
    install_panic_hook();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            StdoutSink.emit(&TimelineEvent::Error {
                message: format!(
                    "Error {}: Failed to start async runtime: {}",
                    ErrorCode::INTERNAL_ERROR.formatted(),
                    e
                ),
            });
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run(module, args));
    std::process::exit(code);
}

/// Hook global: qualquer pânico vira `status: failed` + exit 1, para que o
/// engine nunca fique sem o evento terminal por um caminho de erro não
/// tratado.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        StdoutSink.emit(&TimelineEvent::Status {
            status: FinalStatus::Failed,
            id: None,
            error: Some(format!("panic: {}", message)),
            stack: info.location().map(|l| l.to_string()),
            reason: None,
            peak_memory_bytes: None,
            peak_memory_mb: None,
        });
        std::process::exit(1);
    }));
}

// ============================================================================
// EXECUÇÃO
// ============================================================================

/// Corpo assíncrono do harness; devolve o código de saída.
pub async fn run(module: Module, args: HarnessArgs) -> i32 {
    let sink: Arc<dyn EventSink> = Arc::new(StdoutSink);

    // Modo discovery: uma linha JSON com o enumerate e nada mais.
    if args.list {
        return match serde_json::to_string(&resolver::enumerate(&module)) {
            Ok(line) => {
                println!("{}", line);
                0
            }
            Err(e) => {
                sink.emit(&TimelineEvent::Error {
                    message: format!(
                        "Error {}: Failed to serialize test list: {}",
                        ErrorCode::EVENT_SERIALIZATION.formatted(),
                        e
                    ),
                });
                1
            }
        };
    }

    let test_id = match &args.test_id {
        Some(id) => id.clone(),
        None => {
            sink.emit(&TimelineEvent::Error {
                message: "missing required --testId argument".to_string(),
            });
            return 1;
        }
    };

    // Contexto via stdin: o stream inteiro, fechado pelo engine após a
    // escrita. Entrada vazia é um contexto vazio (execução manual).
    let context = match read_context().await {
        Ok(context) => context,
        Err(message) => {
            sink.emit(&TimelineEvent::synthesized_log(format!(
                "Failed to parse execution context from stdin ({}); using an empty context",
                message
            )));
            ExecutionContext::default()
        }
    };

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(message) => {
            sink.emit(&TimelineEvent::synthesized_log(format!(
                "Error {}: {}",
                ErrorCode::DEV_CONFIG_INVALID.formatted(),
                message
            )));
            HarnessConfig::default()
        }
    };

    // Resolução: id primeiro, export como fallback.
    let test = resolver::find_by_id(&module, &test_id).or_else(|| {
        args.export_name
            .as_deref()
            .and_then(|name| resolver::find_by_export(&module, name))
    });
    let test = match test {
        Some(test) => test,
        None => {
            let code = ErrorCode::TEST_NOT_FOUND.formatted();
            sink.emit(&TimelineEvent::Error {
                message: match &args.export_name {
                    Some(export) => format!(
                        "Error {}: Test '{}' not found (searched by id and by export '{}')",
                        code, test_id, export
                    ),
                    None => format!(
                        "Error {}: Test '{}' not found (searched by id)",
                        code, test_id
                    ),
                },
            });
            return 1;
        }
    };

    let retry_count = context.retry_count;
    let ctx = Ctx::new(
        CtxOptions {
            vars: context.vars,
            secrets: context.secrets,
            retry_count,
            allow_env: args.allow_env,
            emit_full_trace: args.emit_full_trace,
            http: HttpSettings {
                base_url: args.base_url.clone().or(config.base_url),
                network: NetworkAccess::from_flag_value(args.allow_net.as_deref()),
                budget_bytes: config.response_budget_bytes,
                timeout_ms: config.timeout_ms,
            },
        },
        sink.clone(),
    );

    let peak = Arc::new(AtomicU64::new(0));
    let watcher = spawn_memory_watcher(
        peak.clone(),
        args.max_memory_mb,
        sink.clone(),
        test.meta.id.clone(),
    );

    ctx.emit(TimelineEvent::Start {
        id: test.meta.id.clone(),
        name: test.meta.name.clone(),
        tags: if test.meta.tags.is_empty() {
            None
        } else {
            Some(test.meta.tags.clone())
        },
        retry_count: Some(retry_count),
    });

    // Override de timeout do teste: o engine rearma o deadline ao receber.
    if let Some(timeout_ms) = test.meta.timeout_ms {
        ctx.set_timeout(timeout_ms);
    }

    let outcome = if test.meta.skip {
        Outcome::Skipped {
            reason: Some("test marked as skip".to_string()),
        }
    } else {
        classify_result(execute_body(&ctx, &test).await)
    };

    watcher.abort();

    // Exatamente um summary, seguido do status terminal.
    ctx.emit_summary();

    let peak_bytes = final_peak_bytes(&peak);
    let (status, error, stack, reason) = match outcome {
        Outcome::Completed => (FinalStatus::Completed, None, None, None),
        Outcome::Failed { error, stack } => (FinalStatus::Failed, Some(error), stack, None),
        Outcome::Skipped { reason } => (FinalStatus::Skipped, None, None, reason),
    };
    ctx.emit(TimelineEvent::Status {
        status,
        id: Some(test.meta.id.clone()),
        error,
        stack,
        reason,
        peak_memory_bytes: peak_bytes,
        peak_memory_mb: peak_bytes.map(to_mb),
    });

    match status {
        FinalStatus::Completed | FinalStatus::Skipped => 0,
        FinalStatus::Failed => 1,
    }
}

async fn execute_body(ctx: &Ctx, test: &TestCase) -> Result<()> {
    match &test.body {
        TestBody::Simple(body) => body(ctx.clone()).await,
        TestBody::Steps(body) => steps::run_steps(ctx, &test.meta, body).await,
    }
}

// ============================================================================
// CLASSIFICAÇÃO DO DESFECHO
// ============================================================================

#[derive(Debug)]
enum Outcome {
    Completed,
    Failed {
        error: String,
        stack: Option<String>,
    },
    Skipped {
        reason: Option<String>,
    },
}

/// Mapeia o resultado do corpo para o status final: sentinelas de skip e
/// fail têm tratamento próprio; qualquer outro erro vira `failed` com a
/// cadeia de causas no campo `stack`.
fn classify_result(result: Result<()>) -> Outcome {
    match result {
        Ok(()) => Outcome::Completed,
        Err(e) => match e.downcast_ref::<TestAbort>() {
            Some(TestAbort::Skipped { reason }) => Outcome::Skipped {
                reason: reason.clone(),
            },
            Some(TestAbort::Failed { message }) => Outcome::Failed {
                error: message.clone(),
                stack: None,
            },
            None => Outcome::Failed {
                error: e.to_string(),
                stack: Some(format!("{:?}", e)),
            },
        },
    }
}

// ============================================================================
// MONITOR DE MEMÓRIA
// ============================================================================

/// Amostra o RSS a cada ~100 ms, guardando o pico. Com teto configurado,
/// o estouro emite o status terminal e sai com 137 (o código que o engine
/// classifica como OOM).
fn spawn_memory_watcher(
    peak: Arc<AtomicU64>,
    cap_mb: Option<u64>,
    sink: Arc<dyn EventSink>,
    test_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(MEMORY_SAMPLE_INTERVAL_MS));
        loop {
            interval.tick().await;
            if let Some(stats) = runtime::memory_usage() {
                peak.fetch_max(stats.rss_bytes, Ordering::SeqCst);
                if let Some(cap) = cap_mb {
                    if stats.rss_bytes > cap.saturating_mul(1024 * 1024) {
                        sink.emit(&TimelineEvent::Status {
                            status: FinalStatus::Failed,
                            id: Some(test_id.clone()),
                            error: Some(format!("Memory cap of {}MB exceeded", cap)),
                            stack: None,
                            reason: None,
                            peak_memory_bytes: Some(stats.rss_bytes),
                            peak_memory_mb: Some(to_mb(stats.rss_bytes)),
                        });
                        std::process::exit(137);
                    }
                }
            }
        }
    })
}

fn final_peak_bytes(peak: &AtomicU64) -> Option<u64> {
    let sampled = peak.load(Ordering::SeqCst);
    let current = runtime::memory_usage().map(|s| s.rss_bytes).unwrap_or(0);
    let max = sampled.max(current);
    if max > 0 {
        Some(max)
    } else {
        None
    }
}

fn to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

// ============================================================================
// ENTRADAS EXTERNAS
// ============================================================================

async fn read_context() -> Result<ExecutionContext, String> {
    use tokio::io::AsyncReadExt;
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .map_err(|e| e.to_string())?;
    if input.trim().is_empty() {
        return Ok(ExecutionContext::default());
    }
    serde_json::from_str(&input).map_err(|e| e.to_string())
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig, String> {
    let Some(path) = path else {
        return Ok(HarnessConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config '{}': {}", path.display(), e))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse config '{}': {}", path.display(), e))
}

// ============================================================================
// TESTES
// ============================================================================
