//! # Módulo de Telemetria do Engine
//!
//! Observabilidade do **lado do engine** (o sandbox tem o seu próprio canal
//! observável: a timeline NDJSON no stdout). Aqui vivem o logging
//! estruturado via `tracing` e a exportação opcional de spans OTLP, um
//! span `test_execution` por subprocess, com id do teste, desfecho e
//! duração como atributos.
//!
//! ## Configuração via ambiente:
//!
//! | Variável                       | Efeito                          |
//! |--------------------------------|---------------------------------|
//! | `OTEL_SERVICE_NAME`            | nome do serviço nos traces      |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT`  | endpoint gRPC do collector      |
//! | `OTEL_TRACES_SAMPLER_ARG`      | taxa de sampling (0.0 a 1.0)    |
//! | `RUST_LOG`                     | filtro de nível dos logs        |
//!
//! Sem endpoint configurado, só o layer de console é instalado. O
//! [`shutdown_telemetry`] faz o flush do batch exporter; sem ele, spans
//! acumulados no encerramento são perdidos.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CONFIGURAÇÃO
// ============================================================================

/// Configuração da telemetria do engine.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Nome do serviço nos traces exportados.
    pub service_name: String,
    /// Endpoint OTLP (gRPC). `None` = só console.
    pub otlp_endpoint: Option<String>,
    /// Taxa de sampling, 0.0 a 1.0.
    pub sampling_ratio: f64,
    pub enable_console_logging: bool,
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "glubean-engine".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Configuração a partir das variáveis `OTEL_*`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }
        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(parsed) = ratio.parse::<f64>() {
                config.sampling_ratio = parsed.clamp(0.0, 1.0);
            }
        }
        config
    }
}

// ============================================================================
// INICIALIZAÇÃO / ENCERRAMENTO
// ============================================================================

/// Instala o subscriber global: `EnvFilter` + console opcional + layer
/// OTLP quando há endpoint. Retorna o tracer OTLP quando configurado.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer =
                build_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
            let registry = tracing_subscriber::registry()
                .with(env_filter)
                .with(OpenTelemetryLayer::new(tracer.clone()));
            if config.enable_console_logging {
                registry
                    .with(tracing_subscriber::fmt::layer().compact())
                    .init();
            } else {
                registry.init();
            }
            tracing::info!(
                service_name = %config.service_name,
                endpoint = %endpoint,
                sampling_ratio = config.sampling_ratio,
                "Telemetry initialized with OTLP export"
            );
            Ok(Some(tracer))
        }
        None => {
            let registry = tracing_subscriber::registry().with(env_filter);
            if config.enable_console_logging {
                registry
                    .with(tracing_subscriber::fmt::layer().compact())
                    .init();
            } else {
                registry.init();
            }
            tracing::info!("Telemetry initialized (console only)");
            Ok(None)
        }
    }
}

fn build_otlp_tracer(
    service_name: &str,
    endpoint: &str,
    sampling_ratio: f64,
) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        // Baseado no trace ID: execuções relacionadas entram juntas.
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = provider.tracer(service_name.to_string());
    global::set_tracer_provider(provider);
    Ok(tracer)
}

/// Flush e encerramento do pipeline OTLP. Chamar antes de sair.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
    tracing::debug!("Telemetry shut down");
}

// ============================================================================
// INSTRUMENTAÇÃO DE EXECUÇÕES
// ============================================================================

/// Helpers de atributos para o span de uma execução de teste.
pub mod instrumentation {
    use std::time::Instant;

    /// Atributos acumulados de um span `test_execution`.
    #[derive(Debug)]
    pub struct TestSpanContext {
        pub test_id: String,
        pub suite: String,
        pub started: Instant,
        pub outcome: Option<&'static str>,
        pub duration_ms: Option<u64>,
        pub assertion_count: u64,
        pub failed_assertion_count: u64,
    }

    impl TestSpanContext {
        pub fn new(test_id: &str, suite: &str) -> Self {
            Self {
                test_id: test_id.to_string(),
                suite: suite.to_string(),
                started: Instant::now(),
                outcome: None,
                duration_ms: None,
                assertion_count: 0,
                failed_assertion_count: 0,
            }
        }

        /// Fecha o span com o desfecho e os contadores finais.
        pub fn finish(&mut self, success: bool, assertions: u64, failed: u64) {
            self.outcome = Some(if success { "passed" } else { "failed" });
            self.duration_ms = Some(self.started.elapsed().as_millis() as u64);
            self.assertion_count = assertions;
            self.failed_assertion_count = failed;
        }

        /// Atributos no vocabulário dos dashboards do engine.
        pub fn attributes(&self) -> Vec<(&'static str, String)> {
            let mut attrs = vec![
                ("test.id", self.test_id.clone()),
                ("test.suite", self.suite.clone()),
            ];
            if let Some(outcome) = self.outcome {
                attrs.push(("test.outcome", outcome.to_string()));
            }
            if let Some(duration) = self.duration_ms {
                attrs.push(("test.duration_ms", duration.to_string()));
            }
            attrs.push(("test.assertions", self.assertion_count.to_string()));
            attrs.push((
                "test.failed_assertions",
                self.failed_assertion_count.to_string(),
            ));
            attrs
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
