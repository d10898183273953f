//! # Glubean CLI - Orquestração de Lotes
//!
//! Front-end fino sobre o engine: o comando `execute` roda um lote de
//! testes de um binário de suite através do scheduler, e `list` expõe a
//! descoberta (`--list` do harness) para tooling externo.
//!
//! ## Exemplo de uso:
//!
//! ```bash
//! # Roda a suite inteira com 4 workers e para na segunda falha
//! glubean execute --bin ./target/release/minha-suite \
//!     --concurrency 4 --fail-after 2 --output resultado.json
//!
//! # Roda testes específicos com rede restrita
//! glubean execute --bin ./minha-suite --test login --test checkout \
//!     --allow-net api.staging.example.com
//!
//! # Lista os testes descobríveis
//! glubean list --bin ./minha-suite
//! ```
//!
//! ## Fluxo do `execute`
//!
//! 1. Resolve a configuração compartilhada (permissões, rede, timeouts).
//! 2. Descobre os ids quando nenhum `--test` foi passado (respeitando
//!    `only`).
//! 3. Valida os limites de execução (fail-fast de configuração).
//! 4. Dispara o scheduler sobre o executor de subprocess.
//! 5. Serializa o `BatchReport` (arquivo ou stdout) e sai com código 1 se
//!    o lote falhou.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use uuid::Uuid;

use glubean::engine::{run_many, BatchOptions, RunConfig, RunOptions, SubprocessExecutor};
use glubean::errors::ErrorCode;
use glubean::limits::{self, ExecutionLimits};
use glubean::protocol::{BatchReport, ExecutionContext};
use glubean::resolver::DiscoveredTest;
use glubean::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "glubean")]
#[command(about = "Glubean test execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Executa um lote de testes de um binário de suite.
    Execute {
        /// Binário de suite (compilado com o harness do glubean).
        #[arg(short, long)]
        bin: PathBuf,

        /// Ids de teste a executar; sem nenhum, roda todos os descobertos.
        #[arg(long = "test")]
        tests: Vec<String>,

        /// Variáveis do contexto, em pares `CHAVE=valor`.
        #[arg(long = "var")]
        vars: Vec<String>,

        /// Segredos do contexto, em pares `CHAVE=valor` (vão por stdin,
        /// nunca por argv do sandbox).
        #[arg(long = "secret")]
        secrets: Vec<String>,

        /// Arquivo de saída do relatório (JSON); sem ele, imprime.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Subprocesses simultâneos.
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Para na primeira falha.
        #[arg(long, default_value_t = false)]
        fail_fast: bool,

        /// Para depois de N falhas (precedência sobre --fail-fast).
        #[arg(long)]
        fail_after: Option<u32>,

        /// Timeout de wall-clock por teste, em milissegundos.
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,

        /// Política de rede: `*`, vazio (sem rede) ou lista de hosts.
        #[arg(long, default_value = "*")]
        allow_net: String,

        /// Repassa o ambiente do engine ao sandbox.
        #[arg(long, default_value_t = false)]
        allow_env: bool,

        /// Teto de memória por teste, em MB.
        #[arg(long)]
        max_memory_mb: Option<u64>,

        /// Traces HTTP completos (headers + bodies truncados).
        #[arg(long, default_value_t = false)]
        emit_full_trace: bool,

        /// Só erros críticos no stderr (CI).
        #[arg(long, short = 's', default_value_t = false)]
        silent: bool,

        /// Logs de debug detalhados.
        #[arg(long, short = 'v', default_value_t = false)]
        verbose: bool,

        /// Exporta spans para um collector OTEL.
        #[arg(long, default_value_t = false)]
        otel: bool,

        /// Endpoint do collector OTEL.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Id de execução customizado (UUID v4 por padrão).
        #[arg(long)]
        execution_id: Option<String>,
    },

    /// Lista os testes descobríveis de um binário de suite.
    List {
        #[arg(short, long)]
        bin: PathBuf,
    },
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Execute {
            bin,
            tests,
            vars,
            secrets,
            output,
            concurrency,
            fail_fast,
            fail_after,
            timeout_ms,
            allow_net,
            allow_env,
            max_memory_mb,
            emit_full_trace,
            silent,
            verbose,
            otel,
            otel_endpoint,
            execution_id,
        } => {
            let exec_id = execution_id.unwrap_or_else(|| Uuid::new_v4().to_string());

            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if silent {
                Level::ERROR
            } else if verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };
            if otel {
                if let Some(endpoint) = otel_endpoint {
                    telemetry_config.otlp_endpoint = Some(endpoint);
                } else if telemetry_config.otlp_endpoint.is_none() {
                    telemetry_config.otlp_endpoint =
                        Some("http://localhost:4317".to_string());
                }
            } else {
                telemetry_config.otlp_endpoint = None;
            }
            if let Err(e) = init_telemetry(telemetry_config) {
                if !silent {
                    eprintln!("Warning: failed to initialize telemetry: {}", e);
                }
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            let mut config = if allow_env {
                RunConfig::local_dev()
            } else {
                RunConfig::minimal()
            };
            config.fail_fast = fail_fast;
            config.fail_after = fail_after;
            config.per_test_timeout_ms = timeout_ms;
            config.concurrency = concurrency;
            config.allow_net = allow_net;
            config.emit_full_trace = emit_full_trace;

            let code = execute_batch(
                &bin,
                tests,
                parse_pairs(&vars),
                parse_pairs(&secrets),
                config,
                max_memory_mb,
                output,
                &exec_id,
                silent,
            )
            .await;

            shutdown_telemetry();
            std::process::exit(code);
        }

        Commands::List { bin } => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
            match discover_tests(&bin).await {
                Ok(discovered) => {
                    match serde_json::to_string_pretty(&discovered) {
                        Ok(rendered) => println!("{}", rendered),
                        Err(e) => {
                            eprintln!("Failed to render test list: {}", e);
                            std::process::exit(1);
                        }
                    }
                }
                Err(e) => {
                    eprintln!("Failed to list tests: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

// ============================================================================
// EXECUÇÃO DO LOTE
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn execute_batch(
    bin: &PathBuf,
    tests: Vec<String>,
    vars: HashMap<String, String>,
    secrets: HashMap<String, String>,
    config: RunConfig,
    max_memory_mb: Option<u64>,
    output: Option<PathBuf>,
    execution_id: &str,
    silent: bool,
) -> i32 {
    let start_time = Utc::now();
    if !silent {
        info!(execution_id = %execution_id, suite = %bin.display(), "Engine initializing");
    }

    // 1. Descoberta quando nenhum id foi pedido.
    let test_ids = if tests.is_empty() {
        match discover_tests(bin).await {
            Ok(discovered) => select_test_ids(&discovered),
            Err(e) => {
                error!(error = %e, "Test discovery failed");
                return 1;
            }
        }
    } else {
        tests
    };
    if test_ids.is_empty() {
        error!(code = %ErrorCode::EMPTY_MODULE, "No tests to run");
        return 1;
    }
    if !silent {
        info!(count = test_ids.len(), "Tests selected");
    }

    // 2. Guard rails antes de qualquer subprocess.
    let execution_limits = ExecutionLimits::from_env();
    let limit_check = limits::validate_limits(
        test_ids.len(),
        config.concurrency,
        config.per_test_timeout_ms,
        &execution_limits,
    );
    if !limit_check.passed {
        error!("Batch exceeds execution limits:");
        for violation in &limit_check.violations {
            error!(code = %violation.code, "  - {}", violation.message);
        }
        return 1;
    }

    // 3. Executor + scheduler.
    let context = ExecutionContext {
        vars,
        secrets,
        retry_count: 0,
    };
    let mut options = RunOptions::from_config(&config);
    options.max_memory_mb = max_memory_mb;
    let executor = Arc::new(SubprocessExecutor::new(bin.clone(), context, options));
    let batch_options = BatchOptions {
        concurrency: config.concurrency,
        fail_fast: config.fail_fast,
        fail_after: config.fail_after,
    };
    let batch = run_many(executor, &test_ids, &batch_options).await;

    // 4. Relatório.
    let end_time = Utc::now();
    let report = BatchReport {
        execution_id: execution_id.to_string(),
        suite: bin.display().to_string(),
        status: if batch.success {
            "passed".to_string()
        } else {
            "failed".to_string()
        },
        start_time: start_time.to_rfc3339(),
        end_time: end_time.to_rfc3339(),
        total: test_ids.len(),
        failed: batch.failed_count,
        skipped: batch.skipped_count,
        duration_ms: batch.duration_ms,
        results: batch.results,
    };

    match serde_json::to_string_pretty(&report) {
        Ok(rendered) => {
            if let Some(path) = output {
                if let Err(e) = fs::write(&path, rendered) {
                    error!(error = %e, path = %path.display(), "Failed to write report");
                    return 1;
                }
                if !silent {
                    info!(path = %path.display(), "Report saved");
                }
            } else if !silent {
                println!("\n--- Execution Report ---\n{}", rendered);
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize report");
            return 1;
        }
    }

    if batch.success {
        0
    } else {
        1
    }
}

// ============================================================================
// DESCOBERTA
// ============================================================================

/// Roda o binário de suite com `--list` e parseia a linha JSON.
async fn discover_tests(bin: &PathBuf) -> anyhow::Result<Vec<DiscoveredTest>> {
    let output = tokio::process::Command::new(bin)
        .arg("--list")
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "suite binary exited with {} during discovery",
            output.status
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(serde_json::from_str(stdout.trim())?)
}

/// Com algum teste marcado `only`, roda só esses; senão, todos.
fn select_test_ids(discovered: &[DiscoveredTest]) -> Vec<String> {
    let has_only = discovered.iter().any(|t| t.only);
    discovered
        .iter()
        .filter(|t| !has_only || t.only)
        .map(|t| t.id.clone())
        .collect()
}

/// Parseia pares `CHAVE=valor`; entradas sem `=` são ignoradas com aviso.
fn parse_pairs(pairs: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) => {
                map.insert(key.to_string(), value.to_string());
            }
            None => {
                eprintln!("Ignoring malformed pair '{}' (expected KEY=value)", pair);
            }
        }
    }
    map
}

// ============================================================================
// TESTES
// ============================================================================
