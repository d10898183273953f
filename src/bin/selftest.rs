//! Suite de conformidade do glubean.
//!
//! Um binário de testes real, construído só com a API pública do runtime.
//! Serve de smoke check de uma instalação (`glubean execute --bin
//! glubean-selftest`) e é o alvo dos testes end-to-end do engine: cada
//! teste aqui exercita um contrato observável da timeline (assertions
//! soft, retries de step, fixtures, skip, timeout de processo).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;

use glubean::harness;
use glubean::suite::{EachBuilder, Export, Module, TestBuilder};

/// Tentativas do step flaky dentro de um mesmo subprocess.
static FLAKY_CALLS: AtomicU32 = AtomicU32::new(0);

fn module() -> Module {
    Module::new()
        .test(
            TestBuilder::new("minimal-passing")
                .name("Minimal passing test")
                .tags(["smoke"])
                .run(|ctx| async move {
                    ctx.assert(true, "ok");
                    Ok(())
                })
                .build(),
        )
        .test(
            TestBuilder::new("soft-failure")
                .name("Soft assertion failure does not interrupt")
                .run(|ctx| async move {
                    ctx.assert(false, "nope");
                    ctx.log("after");
                    Ok(())
                })
                .build(),
        )
        .test(
            TestBuilder::new("pass-two")
                .run(|ctx| async move {
                    ctx.expect(2).to_be(2);
                    Ok(())
                })
                .build(),
        )
        .test(
            TestBuilder::new("pass-three")
                .run(|ctx| async move {
                    ctx.expect("abc").to_have_length(3);
                    Ok(())
                })
                .build(),
        )
        .test(
            TestBuilder::new("explicit-fail")
                .run(|ctx| async move { Err(ctx.fail("forced failure")) })
                .build(),
        )
        .test(
            TestBuilder::new("steps-retry")
                .name("Flaky first step recovers on third attempt")
                .retries(2)
                .step("s1", |ctx, _state| async move {
                    let attempt = FLAKY_CALLS.fetch_add(1, Ordering::SeqCst) + 1;
                    ctx.assert(attempt >= 3, "service warmed up");
                    Ok(Some(json!({"attempt": attempt})))
                })
                .step("s2", |ctx, state| async move {
                    ctx.assert(state["attempt"] == json!(3), "state from retried step");
                    Ok(None)
                })
                .build(),
        )
        .test(
            TestBuilder::new("slow-test")
                .name("Sleeps past small wall-clock deadlines")
                .run(|_ctx| async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                })
                .build(),
        )
        .test(
            TestBuilder::new("fixture-lifecycle")
                .lifecycle_fixture("db", |ctx, scope| async move {
                    ctx.log("opening connection");
                    scope.use_value(json!({"id": "conn-1"})).await?;
                    ctx.log("closing connection");
                    Ok(())
                })
                .step("query", |ctx, _state| async move {
                    let db = ctx.fixture("db").expect("db fixture installed");
                    ctx.assert(db["id"] == json!("conn-1"), "connection id visible");
                    Ok(None)
                })
                .build(),
        )
        .test(
            TestBuilder::new("fixture-no-use")
                .lifecycle_fixture("db", |_ctx, _scope| async move {
                    // Nunca chama use_value: contrato violado de propósito.
                    Ok(())
                })
                .step("never", |_ctx, _state| async { Ok(None) })
                .build(),
        )
        .test(
            TestBuilder::new("skipped-test")
                .run(|ctx| async move { Err(ctx.skip("dependency not provisioned")) })
                .build(),
        )
        .test(
            TestBuilder::new("marked-skip")
                .skip()
                .run(|ctx| async move {
                    ctx.assert(false, "must never run");
                    Ok(())
                })
                .build(),
        )
        .test(
            TestBuilder::new("var-echo")
                .run(|ctx| async move {
                    let greeting = ctx.vars().require("GREETING")?;
                    ctx.expect(greeting).to_be("hello");
                    Ok(())
                })
                .build(),
        )
        .test(
            TestBuilder::new("secret-check")
                .run(|ctx| async move {
                    let key = ctx.secrets().require("API_KEY")?;
                    ctx.assert(!key.is_empty(), "secret delivered over stdin");
                    Ok(())
                })
                .build(),
        )
        .export(
            "status-matrix",
            Export::EachBuilder(
                EachBuilder::new(
                    "status-matrix",
                    vec![json!({"code": 200}), json!({"code": 404, "name": "not found"})],
                )
                .run_each(|ctx, row| async move {
                    let code = row["code"].as_u64().unwrap_or(0);
                    ctx.assert(code == 200 || code == 404, "known status code");
                    Ok(())
                }),
            ),
        )
        .export(
            "aliased",
            Export::Test(
                TestBuilder::new("random-pick-1")
                    .name("Reachable by export name when the id drifts")
                    .run(|ctx| async move {
                        ctx.assert(true, "resolved via export");
                        Ok(())
                    })
                    .build(),
            ),
        )
}

fn main() {
    harness::main(module());
}
