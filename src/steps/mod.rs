//! # Módulo de Orquestração de Steps
//!
//! Executor in-sandbox dos testes multi-step. É ele quem garante as
//! invariantes de timeline dos steps:
//!
//! - cada `step_start` tem exatamente um `step_end` com o mesmo índice;
//! - depois da primeira falha, os steps restantes são reportados como
//!   `skipped` com duração zero, sem executar o corpo;
//! - timeout de step é falha **terminal** (nenhum retry a mais);
//! - o estado retornado por um step vira o estado do próximo, e só entra
//!   no evento se couber em 4 KB serializado.
//!
//! ## Ciclo de vida de fixtures
//!
//! ```text
//! fixtures de valor (em ordem)          fábrica roda, valor instalado
//! fixtures lifecycle (em ordem)         fábrica roda como task própria:
//!     setup -> use_value(v) ------+       valor instalado no contexto
//!     (aguarda corpo do teste)    |       setup/steps/teardown rodam
//!     teardown <------------------+       sinal de término em ordem LIFO
//! ```
//!
//! A fábrica lifecycle que termina sem chamar `use_value` falha o teste
//! com uma mensagem contendo `without calling use()`. Se a fábrica não
//! aguardar o future de `use_value`, o orquestrador continua aguardando o
//! corpo internamente: o teardown nunca roda antes do corpo terminar.
//!
//! ## Retries
//!
//! O contador de retries do teste vale por step: com `retries = 2`, um
//! step que sempre falha roda 3 vezes; sucesso na segunda tentativa
//! reporta `attempts = 2, retriesUsed = 1`. Os contadores de assertion da
//! tentativa são zerados a cada tentativa; o `step_end` reporta os da
//! última.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use serde_json::Value;

use crate::errors::{coded, ErrorCode, TestAbort};
use crate::protocol::{StepStatus, TimelineEvent};
use crate::runtime::Ctx;
use crate::suite::{Fixture, FixtureScope, StepsBody, TestMeta};

/// Estado retornado por um step só entra no evento até este tamanho.
const STATE_CAP_BYTES: usize = 4096;

/// Executa um teste multi-step inteiro: fixtures, setup, steps, teardown.
///
/// Retorna `Err` quando algum step falhou (o harness converte no status
/// final); o erro-sentinela de skip atravessa intacto.
pub async fn run_steps(ctx: &Ctx, meta: &TestMeta, body: &StepsBody) -> Result<()> {
    // Fixtures de valor: fábrica roda uma vez, valor vai para o contexto.
    for (name, fixture) in &body.fixtures {
        if let Fixture::Value(factory) = fixture {
            let value = factory(ctx.clone())
                .await
                .with_context(|| format!("fixture '{}' failed", name))?;
            ctx.install_fixture(name, value);
        }
    }

    // Fixtures lifecycle: cada fábrica vira uma task; a invocação segue a
    // ordem de declaração.
    let mut pending = Vec::new();
    for (name, fixture) in &body.fixtures {
        if let Fixture::Lifecycle(factory) = fixture {
            let (scope, value_rx, done_tx) = FixtureScope::new(name);
            let handle = tokio::spawn(factory(ctx.clone(), scope));
            pending.push((name.clone(), value_rx, done_tx, handle));
        }
    }

    let mut done_signals = Vec::new();
    let mut factories = Vec::new();
    for (name, value_rx, done_tx, handle) in pending {
        match value_rx.await {
            Ok(value) => {
                ctx.install_fixture(&name, value);
                done_signals.push(done_tx);
                factories.push((name, handle));
            }
            Err(_) => {
                // A fábrica terminou (ou morreu) sem entregar um valor.
                // As demais tasks são abandonadas; seus use_value pendentes
                // falham quando os canais caírem, e o subprocess encerra.
                return Err(match handle.await {
                    Ok(Err(e)) => e.context(format!("lifecycle fixture '{}' failed", name)),
                    Ok(Ok(())) => coded(
                        ErrorCode::FIXTURE_MISUSE,
                        format!(
                            "Lifecycle fixture '{}' completed without calling use()",
                            name
                        ),
                    ),
                    Err(join_error) => {
                        anyhow!("Lifecycle fixture '{}' panicked: {}", name, join_error)
                    }
                });
            }
        }
    }

    let core_result = run_core(ctx, meta, body).await;

    // Libera os teardowns em ordem reversa e espera as fábricas saírem.
    for done_tx in done_signals.into_iter().rev() {
        let _ = done_tx.send(());
    }
    let mut teardown_failure: Option<anyhow::Error> = None;
    for (name, handle) in factories {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if core_result.is_ok() && teardown_failure.is_none() {
                    teardown_failure =
                        Some(e.context(format!("lifecycle fixture '{}' failed", name)));
                } else {
                    ctx.log(format!("Lifecycle fixture '{}' teardown error: {}", name, e));
                }
            }
            Err(join_error) => {
                if core_result.is_ok() && teardown_failure.is_none() {
                    teardown_failure = Some(anyhow!(
                        "Lifecycle fixture '{}' panicked: {}",
                        name,
                        join_error
                    ));
                } else {
                    ctx.log(format!(
                        "Lifecycle fixture '{}' panicked during teardown: {}",
                        name, join_error
                    ));
                }
            }
        }
    }

    match teardown_failure {
        Some(e) if core_result.is_ok() => Err(e),
        _ => core_result,
    }
}

/// Setup, loop de steps e teardown (fixtures ficam no chamador).
async fn run_core(ctx: &Ctx, meta: &TestMeta, body: &StepsBody) -> Result<()> {
    let mut state = Value::Null;
    if let Some(setup) = &body.setup {
        ctx.log("Running setup...");
        state = setup(ctx.clone()).await.context("setup failed")?;
    }

    let loop_result = run_step_loop(ctx, meta, body, &mut state).await;

    // Teardown sempre roda num bloco guardado: exceções são logadas e não
    // mudam o desfecho do teste.
    if let Some(teardown) = &body.teardown {
        if let Err(e) = teardown(ctx.clone(), state.clone()).await {
            ctx.log(format!("Teardown error: {}", e));
        }
    }

    loop_result
}

async fn run_step_loop(
    ctx: &Ctx,
    meta: &TestMeta,
    body: &StepsBody,
    state: &mut Value,
) -> Result<()> {
    let total = body.steps.len();
    let max_attempts = meta.retries.saturating_add(1);
    let mut first_failure: Option<String> = None;
    let mut failed_count = 0u32;

    for (index, step) in body.steps.iter().enumerate() {
        // Cascata: depois da primeira falha, ninguém mais executa.
        if first_failure.is_some() {
            ctx.with_counters(|c| {
                c.step_total += 1;
                c.step_skipped += 1;
            });
            ctx.emit(TimelineEvent::StepEnd {
                index,
                name: step.name.clone(),
                status: StepStatus::Skipped,
                duration_ms: 0,
                assertions: 0,
                failed_assertions: 0,
                attempts: 0,
                retries_used: 0,
                error: None,
                return_state: None,
            });
            continue;
        }

        ctx.with_counters(|c| c.step_total += 1);
        ctx.set_step_index(Some(index));
        let start = Instant::now();
        ctx.emit(TimelineEvent::StepStart {
            index,
            name: step.name.clone(),
            total,
        });

        let mut attempts = 0u32;
        let mut step_error: Option<String> = None;
        let mut last_return: Option<Value> = None;
        let mut skip_signal: Option<anyhow::Error> = None;

        for attempt in 1..=max_attempts {
            attempts = attempt;
            step_error = None;
            ctx.reset_attempt_counters();

            let step_future = (step.func)(ctx.clone(), state.clone());
            let outcome = match step.timeout_ms {
                Some(timeout_ms) => {
                    match tokio::time::timeout(
                        Duration::from_millis(timeout_ms),
                        step_future,
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            // Timeout de step é terminal: sem retries.
                            step_error = Some(format!(
                                "Step '{}' timed out after {}ms",
                                step.name, timeout_ms
                            ));
                            break;
                        }
                    }
                }
                None => step_future.await,
            };

            match outcome {
                Ok(returned) => {
                    if let Some(value) = returned {
                        *state = value.clone();
                        last_return = Some(value);
                    }
                    if ctx.attempt_failed_assertions() == 0 {
                        break;
                    }
                    if attempt < max_attempts {
                        ctx.log(format!(
                            "Step '{}' failed (attempt {}/{}), retrying...",
                            step.name, attempt, max_attempts
                        ));
                    }
                }
                Err(e) => {
                    if matches!(
                        e.downcast_ref::<TestAbort>(),
                        Some(TestAbort::Skipped { .. })
                    ) {
                        skip_signal = Some(e);
                        break;
                    }
                    if attempt < max_attempts {
                        ctx.log(format!(
                            "Step '{}' failed (attempt {}/{}): {}; retrying...",
                            step.name, attempt, max_attempts, e
                        ));
                    } else {
                        step_error = Some(e.to_string());
                    }
                }
            }
        }

        if let Some(skip) = skip_signal {
            // ctx.skip() dentro de um step encerra o teste inteiro como
            // skipped; o step é reportado como não-executado.
            ctx.emit(TimelineEvent::StepEnd {
                index,
                name: step.name.clone(),
                status: StepStatus::Skipped,
                duration_ms: 0,
                assertions: 0,
                failed_assertions: 0,
                attempts: 0,
                retries_used: 0,
                error: None,
                return_state: None,
            });
            ctx.with_counters(|c| c.step_skipped += 1);
            ctx.set_step_index(None);
            return Err(skip);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let last_attempt_failed = ctx.attempt_failed_assertions() > 0;
        let failed = step_error.is_some() || last_attempt_failed;

        ctx.emit(TimelineEvent::StepEnd {
            index,
            name: step.name.clone(),
            status: if failed {
                StepStatus::Failed
            } else {
                StepStatus::Passed
            },
            duration_ms,
            assertions: ctx.attempt_assertions(),
            failed_assertions: ctx.attempt_failed_assertions(),
            attempts,
            retries_used: attempts.saturating_sub(1),
            error: step_error.clone(),
            return_state: last_return.map(cap_return_state),
        });
        ctx.with_counters(|c| {
            if failed {
                c.step_failed += 1;
            } else {
                c.step_passed += 1;
            }
        });
        ctx.set_step_index(None);

        if failed {
            failed_count += 1;
            first_failure = Some(step_error.unwrap_or_else(|| {
                format!("Step '{}' finished with failed assertions", step.name)
            }));
        }
    }

    match first_failure {
        Some(message) => {
            let message = if failed_count > 1 {
                format!("{} ({} steps failed)", message, failed_count)
            } else {
                message
            };
            Err(anyhow::Error::new(TestAbort::Failed { message }))
        }
        None => Ok(()),
    }
}

/// Estado retornado entra no evento só até 4 KB serializados; acima disso
/// vira um placeholder com o tamanho real.
fn cap_return_state(value: Value) -> Value {
    match serde_json::to_string(&value) {
        Ok(encoded) if encoded.len() <= STATE_CAP_BYTES => value,
        Ok(encoded) => Value::String(format!("[truncated: {} bytes]", encoded.len())),
        Err(_) => Value::String("[non-serializable]".to_string()),
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::ctx_with_sink;
    use crate::suite::{TestBody, TestBuilder};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn steps_of(builder: TestBuilder) -> (TestMeta, StepsBody) {
        let test = builder.build();
        match test.body {
            TestBody::Steps(body) => (test.meta, body),
            TestBody::Simple(_) => panic!("expected a steps test"),
        }
    }

    fn step_ends(sink: &crate::runtime::MemorySink) -> Vec<TimelineEvent> {
        sink.events()
            .into_iter()
            .filter(|e| matches!(e, TimelineEvent::StepEnd { .. }))
            .collect()
    }

    #[tokio::test]
    async fn test_two_steps_pass_with_state_threading() {
        let (ctx, sink) = ctx_with_sink();
        let (meta, body) = steps_of(
            TestBuilder::new("flow")
                .setup(|_ctx| async { Ok(json!({"count": 1})) })
                .step("bump", |_ctx, state| async move {
                    let count = state["count"].as_u64().unwrap();
                    Ok(Some(json!({"count": count + 1})))
                })
                .step("check", |ctx, state| async move {
                    ctx.assert(state["count"] == json!(2), "state threaded");
                    Ok(None)
                }),
        );

        run_steps(&ctx, &meta, &body).await.unwrap();

        let summary = ctx.summary_data();
        assert_eq!(summary.step_total, 2);
        assert_eq!(summary.step_passed, 2);
        assert_eq!(summary.step_failed, 0);
        assert_eq!(summary.assertion_failed, 0);

        // Setup loga antes de qualquer step.
        match &sink.events()[0] {
            TimelineEvent::Log { message, .. } => assert_eq!(message, "Running setup..."),
            other => panic!("unexpected first event: {other:?}"),
        }

        // step_start(0) -> step_end(0) -> step_start(1) -> step_end(1).
        let indices: Vec<(bool, usize)> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                TimelineEvent::StepStart { index, .. } => Some((true, *index)),
                TimelineEvent::StepEnd { index, .. } => Some((false, *index)),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![(true, 0), (false, 0), (true, 1), (false, 1)]);
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let (ctx, sink) = ctx_with_sink();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_step = calls.clone();
        let (meta, body) = steps_of(TestBuilder::new("retry").retries(2).step(
            "flaky",
            move |ctx, _state| {
                let calls = calls_in_step.clone();
                async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    ctx.assert(attempt >= 3, "service is warm");
                    Ok(None)
                }
            },
        ));

        run_steps(&ctx, &meta, &body).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        match step_ends(&sink).first().unwrap() {
            TimelineEvent::StepEnd {
                status,
                attempts,
                retries_used,
                assertions,
                failed_assertions,
                ..
            } => {
                assert_eq!(*status, StepStatus::Passed);
                assert_eq!(*attempts, 3);
                assert_eq!(*retries_used, 2);
                // step_end carrega os contadores da última tentativa.
                assert_eq!(*assertions, 1);
                assert_eq!(*failed_assertions, 0);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // O total agrega as três tentativas.
        assert_eq!(ctx.summary_data().assertion_total, 3);

        // Duas notificações de retry no log.
        let retry_logs = sink
            .events()
            .iter()
            .filter(|e| {
                matches!(e, TimelineEvent::Log { message, .. } if message.contains("retrying"))
            })
            .count();
        assert_eq!(retry_logs, 2);
    }

    #[tokio::test]
    async fn test_retries_zero_runs_exactly_once() {
        let (ctx, _sink) = ctx_with_sink();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_step = calls.clone();
        let (meta, body) = steps_of(TestBuilder::new("once").step("only", move |ctx, _state| {
            let calls = calls_in_step.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ctx.assert(false, "always fails");
                Ok(None)
            }
        }));

        let err = run_steps(&ctx, &meta, &body).await.unwrap_err();
        assert!(err.downcast_ref::<TestAbort>().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_always_failing_step_exhausts_attempts() {
        let (ctx, sink) = ctx_with_sink();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_step = calls.clone();
        let (meta, body) = steps_of(TestBuilder::new("exhaust").retries(2).step(
            "doomed",
            move |_ctx, _state| {
                let calls = calls_in_step.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow!("connection reset"))
                }
            },
        ));

        run_steps(&ctx, &meta, &body).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3, "retries=2 means 3 attempts");

        match step_ends(&sink).first().unwrap() {
            TimelineEvent::StepEnd {
                status,
                attempts,
                error,
                ..
            } => {
                assert_eq!(*status, StepStatus::Failed);
                assert_eq!(*attempts, 3);
                assert!(error.as_deref().unwrap().contains("connection reset"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cascade_skip_after_failure() {
        let (ctx, sink) = ctx_with_sink();
        let (meta, body) = steps_of(
            TestBuilder::new("cascade")
                .step("ok", |_ctx, _state| async { Ok(None) })
                .step("boom", |_ctx, _state| async { Err(anyhow!("nope")) })
                .step("never", |ctx, _state| async move {
                    ctx.assert(true, "must not run");
                    Ok(None)
                }),
        );

        run_steps(&ctx, &meta, &body).await.unwrap_err();

        let ends = step_ends(&sink);
        assert_eq!(ends.len(), 3, "every step still gets a step_end");
        match &ends[2] {
            TimelineEvent::StepEnd {
                status,
                duration_ms,
                assertions,
                attempts,
                ..
            } => {
                assert_eq!(*status, StepStatus::Skipped);
                assert_eq!(*duration_ms, 0);
                assert_eq!(*assertions, 0);
                assert_eq!(*attempts, 0);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let summary = ctx.summary_data();
        assert_eq!(summary.step_total, 3);
        assert_eq!(summary.step_passed, 1);
        assert_eq!(summary.step_failed, 1);
        assert_eq!(summary.step_skipped, 1);
        // "must not run" nunca executou.
        assert_eq!(summary.assertion_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_is_terminal() {
        let (ctx, sink) = ctx_with_sink();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_step = calls.clone();
        let (meta, body) = steps_of(TestBuilder::new("slow").retries(2).step_with(
            "sleepy",
            crate::suite::StepOptions {
                timeout_ms: Some(50),
            },
            move |_ctx, _state| {
                let calls = calls_in_step.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10_000)).await;
                    Ok(None)
                }
            },
        ));

        run_steps(&ctx, &meta, &body).await.unwrap_err();
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "timeout must not be retried"
        );
        match step_ends(&sink).first().unwrap() {
            TimelineEvent::StepEnd { status, error, .. } => {
                assert_eq!(*status, StepStatus::Failed);
                assert!(error.as_deref().unwrap().contains("timed out after 50ms"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_value_fixture_installed_before_steps() {
        let (ctx, _sink) = ctx_with_sink();
        let (meta, body) = steps_of(
            TestBuilder::new("with-fixture")
                .fixture("config", |_ctx| async { Ok(json!({"region": "eu-1"})) })
                .step("read", |ctx, _state| async move {
                    let config = ctx.fixture("config").unwrap();
                    ctx.assert(config["region"] == json!("eu-1"), "fixture visible");
                    Ok(None)
                }),
        );

        run_steps(&ctx, &meta, &body).await.unwrap();
        assert_eq!(ctx.summary_data().assertion_failed, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_fixture_setup_body_teardown_order() {
        let (ctx, _sink) = ctx_with_sink();
        let order = Arc::new(Mutex::new(Vec::<String>::new()));
        let order_in_fixture = order.clone();
        let order_in_step = order.clone();

        let (meta, body) = steps_of(
            TestBuilder::new("db-test")
                .lifecycle_fixture("db", move |_ctx, scope| {
                    let order = order_in_fixture.clone();
                    async move {
                        order.lock().unwrap().push("setup".to_string());
                        scope.use_value(json!({"id": "conn-1"})).await?;
                        order.lock().unwrap().push("teardown".to_string());
                        Ok(())
                    }
                })
                .step("query", move |ctx, _state| {
                    let order = order_in_step.clone();
                    async move {
                        order.lock().unwrap().push("body".to_string());
                        let db = ctx.fixture("db").unwrap();
                        ctx.assert(db["id"] == json!("conn-1"), "connection injected");
                        Ok(None)
                    }
                }),
        );

        run_steps(&ctx, &meta, &body).await.unwrap();
        assert_eq!(
            order.lock().unwrap().clone(),
            vec!["setup", "body", "teardown"],
            "teardown never runs before the body completes"
        );
    }

    #[tokio::test]
    async fn test_lifecycle_fixture_without_use_fails() {
        let (ctx, _sink) = ctx_with_sink();
        let (meta, body) = steps_of(
            TestBuilder::new("bad-fixture")
                .lifecycle_fixture("db", |_ctx, _scope| async {
                    // Nunca chama use_value.
                    Ok(())
                })
                .step("never", |_ctx, _state| async { Ok(None) }),
        );

        let err = run_steps(&ctx, &meta, &body).await.unwrap_err();
        assert!(
            err.to_string().contains("without calling use()"),
            "got: {err}"
        );
        assert_eq!(
            err.downcast_ref::<crate::errors::CodedError>().unwrap().code,
            ErrorCode::FIXTURE_MISUSE
        );
    }

    #[tokio::test]
    async fn test_teardown_error_is_logged_not_fatal() {
        let (ctx, sink) = ctx_with_sink();
        let (meta, body) = steps_of(
            TestBuilder::new("guarded")
                .step("ok", |_ctx, _state| async { Ok(Some(json!(7))) })
                .teardown(|_ctx, state| async move {
                    assert_eq!(state, json!(7), "teardown sees final state");
                    Err(anyhow!("cleanup glitch"))
                }),
        );

        run_steps(&ctx, &meta, &body).await.unwrap();
        assert!(sink.events().iter().any(|e| {
            matches!(e, TimelineEvent::Log { message, .. } if message.contains("cleanup glitch"))
        }));
    }

    #[tokio::test]
    async fn test_return_state_capped_at_4k() {
        let (ctx, sink) = ctx_with_sink();
        // 4096 bytes serializados exatos passam íntegros ("..." + aspas).
        let exact = "x".repeat(STATE_CAP_BYTES - 2);
        let exact_clone = exact.clone();
        let (meta, body) = steps_of(
            TestBuilder::new("states")
                .step("exact", move |_ctx, _state| {
                    let value = exact_clone.clone();
                    async move { Ok(Some(json!(value))) }
                })
                .step("huge", |_ctx, _state| async {
                    Ok(Some(json!("y".repeat(5000))))
                }),
        );

        run_steps(&ctx, &meta, &body).await.unwrap();

        let ends = step_ends(&sink);
        match &ends[0] {
            TimelineEvent::StepEnd { return_state, .. } => {
                assert_eq!(return_state, &Some(json!(exact)));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &ends[1] {
            TimelineEvent::StepEnd { return_state, .. } => {
                let marker = return_state.as_ref().unwrap().as_str().unwrap();
                assert_eq!(marker, "[truncated: 5002 bytes]");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_skip_inside_step_propagates() {
        let (ctx, sink) = ctx_with_sink();
        let (meta, body) = steps_of(
            TestBuilder::new("skippy")
                .step("gate", |ctx, _state| async move {
                    Err(ctx.skip("environment not provisioned"))
                })
                .step("never", |_ctx, _state| async { Ok(None) }),
        );

        let err = run_steps(&ctx, &meta, &body).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TestAbort>(),
            Some(TestAbort::Skipped { .. })
        ));
        // O step interrompido ainda fecha sua timeline.
        assert_eq!(step_ends(&sink).len(), 1);
    }

    #[tokio::test]
    async fn test_events_inside_step_carry_step_index() {
        let (ctx, sink) = ctx_with_sink();
        let (meta, body) = steps_of(TestBuilder::new("indexed").step(
            "noisy",
            |ctx, _state| async move {
                ctx.log("inside");
                ctx.assert(true, "fine");
                Ok(None)
            },
        ));

        run_steps(&ctx, &meta, &body).await.unwrap();
        for event in sink.events() {
            match event {
                TimelineEvent::Log { step_index, .. }
                | TimelineEvent::Assertion { step_index, .. } => {
                    assert_eq!(step_index, Some(0));
                }
                _ => {}
            }
        }
    }
}
