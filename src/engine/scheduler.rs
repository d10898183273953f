//! # Scheduler de Lote
//!
//! Distribui N ids de teste por um pool de workers de tamanho
//! `min(concurrency, N)`. Cada worker puxa o próximo índice de um cursor
//! atômico, roda um teste por vez e grava o resultado no slot de origem,
//! preservando a ordem de entrada no resultado final.
//!
//! ## Fail-fast / fail-after
//!
//! O limite efetivo de falhas é `fail_after ?? (fail_fast ? 1 : ∞)`.
//! Quando `failedCount >= limite`, workers param de puxar índices; os
//! testes que nunca começaram contam como `skipped`:
//! `skippedCount == len(entrada) - len(resultados)`.
//!
//! Testes em voo quando o limite é atingido terminam normalmente (não há
//! cancelamento retroativo); só a admissão de novos testes para.
//!
//! Cada execução roda dentro de um span `test_execution` com o id e o
//! desfecho, para a telemetria do engine.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, info_span, Instrument};

use crate::protocol::{BatchResult, ExecutionResult};

use super::executor::TestRunner;

/// Opções do scheduler (ver `RunConfig` para a forma de alto nível).
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub fail_fast: bool,
    pub fail_after: Option<u32>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            fail_fast: false,
            fail_after: None,
        }
    }
}

impl BatchOptions {
    fn failure_limit(&self) -> u32 {
        self.fail_after
            .unwrap_or(if self.fail_fast { 1 } else { u32::MAX })
    }
}

/// Executa um lote de testes sobre qualquer [`TestRunner`].
pub async fn run_many(
    runner: Arc<dyn TestRunner>,
    test_ids: &[String],
    options: &BatchOptions,
) -> BatchResult {
    let started = Instant::now();
    let total = test_ids.len();
    if total == 0 {
        return BatchResult {
            results: Vec::new(),
            success: true,
            failed_count: 0,
            skipped_count: 0,
            duration_ms: 0,
        };
    }

    let failure_limit = options.failure_limit();
    let worker_count = options.concurrency.max(1).min(total);
    info!(
        total,
        workers = worker_count,
        failure_limit,
        "Batch execution starting"
    );

    let ids: Arc<Vec<String>> = Arc::new(test_ids.to_vec());
    let cursor = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicU32::new(0));
    let slots: Arc<Mutex<Vec<Option<ExecutionResult>>>> =
        Arc::new(Mutex::new((0..total).map(|_| None).collect()));

    let mut workers = JoinSet::new();
    for worker_id in 0..worker_count {
        let runner = runner.clone();
        let ids = ids.clone();
        let cursor = cursor.clone();
        let failed = failed.clone();
        let slots = slots.clone();

        workers.spawn(async move {
            loop {
                // Admissão: para de puxar índices no limite de falhas.
                if failed.load(Ordering::SeqCst) >= failure_limit {
                    break;
                }
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= ids.len() {
                    break;
                }

                let test_id = &ids[index];
                let span = info_span!(
                    "test_execution",
                    test.id = %test_id,
                    worker = worker_id
                );
                let result = runner.run_test(test_id).instrument(span).await;

                info!(
                    test.id = %test_id,
                    success = result.success,
                    duration_ms = result.duration_ms,
                    assertions = result.assertion_count,
                    failed_assertions = result.failed_assertion_count,
                    "Test finished"
                );
                if !result.success {
                    failed.fetch_add(1, Ordering::SeqCst);
                }
                slots.lock().await[index] = Some(result);
            }
        });
    }
    while workers.join_next().await.is_some() {}

    // Compacta preservando a ordem de entrada; slots nunca preenchidos são
    // os testes pulados pelo fail-fast.
    let results: Vec<ExecutionResult> = {
        let mut slots = slots.lock().await;
        slots.iter_mut().filter_map(Option::take).collect()
    };
    let failed_count = failed.load(Ordering::SeqCst);
    let skipped_count = total - results.len();
    let batch = BatchResult {
        success: failed_count == 0,
        failed_count,
        skipped_count,
        duration_ms: started.elapsed().as_millis() as u64,
        results,
    };
    info!(
        executed = batch.results.len(),
        failed = batch.failed_count,
        skipped = batch.skipped_count,
        success = batch.success,
        "Batch execution finished"
    );
    batch
}

// ============================================================================
// TESTES
// ============================================================================
