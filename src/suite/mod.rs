//! # Módulo de Suite - Descritores de Teste e Registro de Módulos
//!
//! Este módulo define como um teste é **descrito** antes de ser executado:
//! metadados (id, nome, tags), o corpo (função simples ou sequência de
//! steps), fixtures e os builders fluentes que o usuário usa para montar
//! tudo isso.
//!
//! ## De onde vêm os testes?
//!
//! Num runtime dinâmico os testes seriam importados do arquivo do usuário em
//! tempo de execução. Aqui a descoberta é explícita: o binário de testes do
//! usuário monta um [`Module`] (lista ordenada de exports nomeados) e o
//! entrega ao harness. O resolver enxerga exatamente o mesmo contrato que
//! enxergaria sobre um módulo importado.
//!
//! ## Formas de export reconhecidas:
//!
//! | Export | O que é |
//! |---|---|
//! | `Test` | Um teste já construído |
//! | `Tests` | Uma sequência de testes (geração data-driven) |
//! | `Builder` | Um [`TestBuilder`] ainda não construído |
//! | `EachBuilder` | Um builder parametrizado que gera um teste por linha |
//!
//! Builders são idempotentes: `build()` chamado duas vezes produz testes
//! equivalentes, então o resolver pode construí-los quantas vezes precisar.
//!
//! ## Exemplo de uso:
//!
//! ```ignore
//! let module = Module::new().test(
//!     TestBuilder::new("login-flow")
//!         .name("Login flow")
//!         .tags(["auth", "smoke"])
//!         .step("request token", |ctx, _state| async move {
//!             let resp = ctx.http().post("/oauth/token").send().await?;
//!             ctx.assert(resp.status() == 200, "token endpoint responds");
//!             Ok(None)
//!         })
//!         .build(),
//! );
//! glubean::harness::main(module);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::runtime::Ctx;

// ============================================================================
// ASSINATURAS DE FUNÇÃO
// ============================================================================
// Todo corpo de teste é um `Fn` clonável (Arc) que devolve um future Send.
// Isso permite que builders sejam construídos mais de uma vez sem mover o
// closure do usuário.

pub type UnitFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type ValueFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
pub type StepFuture = Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>;

/// Corpo de um teste simples.
pub type TestFn = Arc<dyn Fn(Ctx) -> UnitFuture + Send + Sync>;
/// Setup de um teste multi-step; o retorno vira o estado inicial.
pub type SetupFn = Arc<dyn Fn(Ctx) -> ValueFuture + Send + Sync>;
/// Um step: recebe o estado corrente, pode devolver um estado novo.
pub type StepFn = Arc<dyn Fn(Ctx, Value) -> StepFuture + Send + Sync>;
/// Teardown: recebe o estado final; erros aqui são logados, nunca falham o teste.
pub type TeardownFn = Arc<dyn Fn(Ctx, Value) -> UnitFuture + Send + Sync>;
/// Fixture de valor: computa o valor uma vez, antes dos steps.
pub type FixtureFn = Arc<dyn Fn(Ctx) -> ValueFuture + Send + Sync>;
/// Fixture de ciclo de vida: setup, `use_value(...)`, teardown.
pub type LifecycleFn = Arc<dyn Fn(Ctx, FixtureScope) -> UnitFuture + Send + Sync>;

// ============================================================================
// FIXTURES
// ============================================================================

/// Escopo entregue a uma fixture de ciclo de vida.
///
/// A fábrica deve chamar [`FixtureScope::use_value`] exatamente uma vez. O
/// future devolvido só resolve quando o corpo do teste termina, então tudo
/// que a fábrica fizer depois do `await` é teardown. O escopo é consumido
/// pela chamada, o que torna um segundo `use_value` irrepresentável; zero
/// chamadas são detectadas pelo orquestrador e falham o teste.
pub struct FixtureScope {
    name: String,
    value_tx: oneshot::Sender<Value>,
    done_rx: oneshot::Receiver<()>,
}

impl FixtureScope {
    pub(crate) fn new(
        name: &str,
    ) -> (Self, oneshot::Receiver<Value>, oneshot::Sender<()>) {
        let (value_tx, value_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        (
            Self {
                name: name.to_string(),
                value_tx,
                done_rx,
            },
            value_rx,
            done_tx,
        )
    }

    /// Instala o valor da fixture no contexto e aguarda o corpo do teste.
    pub async fn use_value(self, value: impl Into<Value>) -> Result<()> {
        self.value_tx
            .send(value.into())
            .map_err(|_| anyhow!("fixture '{}': test body is no longer waiting", self.name))?;
        // O lado do orquestrador sempre sinaliza (mesmo com corpo falhado);
        // um erro aqui só acontece se o teste inteiro foi derrubado.
        let _ = self.done_rx.await;
        Ok(())
    }
}

/// Uma fixture nomeada, instalada no contexto antes dos steps.
#[derive(Clone)]
pub enum Fixture {
    /// Valor computado eagermente pela fábrica.
    Value(FixtureFn),
    /// Fábrica que envolve o corpo do teste (setup/uso/teardown).
    Lifecycle(LifecycleFn),
}

// ============================================================================
// DESCRITOR DE TESTE
// ============================================================================

/// Variante de forma de um teste.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Simple,
    Steps,
}

/// Metadados estáveis de um teste.
#[derive(Debug, Clone, Default)]
pub struct TestMeta {
    /// Identificador estável, único dentro do módulo. Nunca vazio.
    pub id: String,
    /// Nome de exibição (opcional).
    pub name: Option<String>,
    /// Tags ordenadas para filtragem em CI.
    pub tags: Vec<String>,
    pub skip: bool,
    pub only: bool,
    /// Override do timeout por teste, em milissegundos.
    pub timeout_ms: Option<u64>,
    /// Retries por step (testes multi-step).
    pub retries: u32,
}

/// Um step nomeado de um teste multi-step.
#[derive(Clone)]
pub struct StepDef {
    pub name: String,
    /// Timeout individual do step; estourar é falha terminal (sem retry).
    pub timeout_ms: Option<u64>,
    pub func: StepFn,
}

/// Corpo de um teste multi-step.
#[derive(Clone, Default)]
pub struct StepsBody {
    pub setup: Option<SetupFn>,
    pub teardown: Option<TeardownFn>,
    pub steps: Vec<StepDef>,
    pub fixtures: Vec<(String, Fixture)>,
}

/// Corpo de um teste: função única ou sequência de steps.
#[derive(Clone)]
pub enum TestBody {
    Simple(TestFn),
    Steps(StepsBody),
}

/// Um teste completamente construído, pronto para o harness.
#[derive(Clone)]
pub struct TestCase {
    pub meta: TestMeta,
    pub body: TestBody,
}

impl TestCase {
    pub fn kind(&self) -> TestKind {
        match self.body {
            TestBody::Simple(_) => TestKind::Simple,
            TestBody::Steps(_) => TestKind::Steps,
        }
    }
}

// ============================================================================
// BUILDER FLUENTE
// ============================================================================

/// Opções por step, passadas em [`TestBuilder::step_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions {
    pub timeout_ms: Option<u64>,
}

/// Builder fluente de um teste.
///
/// Chamar `.run(...)` produz um teste `simple`; chamar `.step(...)` uma ou
/// mais vezes produz um teste `steps`. As duas formas são exclusivas: steps
/// têm precedência se ambos forem configurados.
#[derive(Clone, Default)]
pub struct TestBuilder {
    meta: TestMeta,
    run: Option<TestFn>,
    body: StepsBody,
}

impl TestBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            meta: TestMeta {
                id: id.into(),
                ..TestMeta::default()
            },
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.meta.name = Some(name.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.meta.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn skip(mut self) -> Self {
        self.meta.skip = true;
        self
    }

    pub fn only(mut self) -> Self {
        self.meta.only = true;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.meta.timeout_ms = Some(timeout_ms);
        self
    }

    /// Retries por step (0 = uma tentativa só).
    pub fn retries(mut self, retries: u32) -> Self {
        self.meta.retries = retries;
        self
    }

    /// Corpo de um teste simples.
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Setup opcional; o valor devolvido vira o estado inicial dos steps.
    pub fn setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.body.setup = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Teardown opcional; sempre roda, erros são logados e não falham o teste.
    pub fn teardown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Ctx, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.body.teardown = Some(Arc::new(move |ctx, state| Box::pin(f(ctx, state))));
        self
    }

    /// Adiciona um step nomeado.
    pub fn step<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Ctx, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.step_with(name, StepOptions::default(), f)
    }

    /// Adiciona um step com opções (timeout individual).
    pub fn step_with<F, Fut>(mut self, name: impl Into<String>, opts: StepOptions, f: F) -> Self
    where
        F: Fn(Ctx, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.body.steps.push(StepDef {
            name: name.into(),
            timeout_ms: opts.timeout_ms,
            func: Arc::new(move |ctx, state| Box::pin(f(ctx, state))),
        });
        self
    }

    /// Fixture de valor: a fábrica roda uma vez e o valor fica disponível
    /// em `ctx.fixture(name)`.
    pub fn fixture<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.body.fixtures.push((
            name.into(),
            Fixture::Value(Arc::new(move |ctx| Box::pin(f(ctx)))),
        ));
        self
    }

    /// Fixture de ciclo de vida: a fábrica recebe um [`FixtureScope`] e deve
    /// chamar `use_value` exatamente uma vez.
    pub fn lifecycle_fixture<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Ctx, FixtureScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.body.fixtures.push((
            name.into(),
            Fixture::Lifecycle(Arc::new(move |ctx, scope| Box::pin(f(ctx, scope)))),
        ));
        self
    }

    /// Constrói o teste. Idempotente: pode ser chamado múltiplas vezes.
    pub fn build(&self) -> TestCase {
        let body = if !self.body.steps.is_empty() {
            TestBody::Steps(self.body.clone())
        } else if let Some(run) = &self.run {
            TestBody::Simple(run.clone())
        } else {
            // Builder sem corpo: falha em tempo de execução com uma
            // mensagem clara em vez de um pânico na construção.
            let id = self.meta.id.clone();
            TestBody::Simple(Arc::new(move |_ctx| {
                let id = id.clone();
                Box::pin(async move { Err(anyhow!("test '{}' has no body", id)) })
            }))
        };
        TestCase {
            meta: self.meta.clone(),
            body,
        }
    }
}

// ============================================================================
// EACH-BUILDER (DATA-DRIVEN)
// ============================================================================

/// Builder parametrizado: gera um teste por linha de dados.
///
/// Os ids gerados são estáveis (`{base}[{i}]`), o que preserva a propriedade
/// `enumerate ∘ find_by_id` do resolver entre execuções. Linhas que são
/// objetos com um campo `"name"` string usam esse campo como nome de
/// exibição.
#[derive(Clone, Default)]
pub struct EachBuilder {
    base: TestBuilder,
    rows: Vec<Value>,
    run_each: Option<Arc<dyn Fn(Ctx, Value) -> UnitFuture + Send + Sync>>,
}

impl EachBuilder {
    pub fn new(id: impl Into<String>, rows: Vec<Value>) -> Self {
        Self {
            base: TestBuilder::new(id),
            rows,
            run_each: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.base = self.base.name(name);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = self.base.tags(tags);
        self
    }

    pub fn skip(mut self) -> Self {
        self.base = self.base.skip();
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.base = self.base.timeout_ms(timeout_ms);
        self
    }

    /// Corpo executado uma vez por linha, recebendo a linha como segundo
    /// argumento.
    pub fn run_each<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Ctx, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.run_each = Some(Arc::new(move |ctx, row| Box::pin(f(ctx, row))));
        self
    }

    /// Constrói um teste por linha. Idempotente.
    pub fn build(&self) -> Vec<TestCase> {
        let base_id = self.base.meta.id.clone();
        let base_name = self.base.meta.name.clone();
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut meta = self.base.meta.clone();
                meta.id = format!("{}[{}]", base_id, i);
                meta.name = row
                    .get("name")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .or_else(|| base_name.clone());

                let body = match &self.run_each {
                    Some(f) => {
                        let f = f.clone();
                        let row = row.clone();
                        TestBody::Simple(Arc::new(move |ctx| f(ctx, row.clone())))
                    }
                    None => {
                        let id = meta.id.clone();
                        TestBody::Simple(Arc::new(move |_ctx| {
                            let id = id.clone();
                            Box::pin(async move { Err(anyhow!("test '{}' has no body", id)) })
                        }))
                    }
                };
                TestCase { meta, body }
            })
            .collect()
    }
}

// ============================================================================
// MÓDULO (REGISTRO DE EXPORTS)
// ============================================================================

/// Um export nomeado de um módulo de testes.
#[derive(Clone)]
pub enum Export {
    Test(TestCase),
    Tests(Vec<TestCase>),
    Builder(TestBuilder),
    EachBuilder(EachBuilder),
}

/// O módulo de testes do usuário: exports nomeados, em ordem de declaração.
///
/// A ordem importa para o resolver (o export `default` é procurado antes dos
/// demais) e para a enumeração determinística em CI.
#[derive(Clone, Default)]
pub struct Module {
    exports: Vec<(String, Export)>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra um export sob um nome arbitrário.
    pub fn export(mut self, name: impl Into<String>, export: Export) -> Self {
        self.exports.push((name.into(), export));
        self
    }

    /// Atalho: registra um teste já construído sob o próprio id.
    pub fn test(self, test: TestCase) -> Self {
        let name = test.meta.id.clone();
        self.export(name, Export::Test(test))
    }

    /// Atalho: registra um builder sob o id configurado nele.
    pub fn builder(self, builder: TestBuilder) -> Self {
        let name = builder.meta.id.clone();
        self.export(name, Export::Builder(builder))
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports
            .iter()
            .find(|(export_name, _)| export_name == name)
            .map(|(_, export)| export)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Export)> {
        self.exports.iter().map(|(name, e)| (name.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_simple_shape() {
        let test = TestBuilder::new("t1")
            .name("first test")
            .tags(["smoke"])
            .run(|_ctx| async { Ok(()) })
            .build();

        assert_eq!(test.meta.id, "t1");
        assert_eq!(test.meta.name.as_deref(), Some("first test"));
        assert_eq!(test.meta.tags, vec!["smoke".to_string()]);
        assert_eq!(test.kind(), TestKind::Simple);
    }

    #[test]
    fn test_builder_steps_shape() {
        let test = TestBuilder::new("flow")
            .retries(2)
            .step("one", |_ctx, _state| async { Ok(None) })
            .step_with(
                "two",
                StepOptions {
                    timeout_ms: Some(500),
                },
                |_ctx, _state| async { Ok(None) },
            )
            .build();

        assert_eq!(test.kind(), TestKind::Steps);
        assert_eq!(test.meta.retries, 2);
        match &test.body {
            TestBody::Steps(body) => {
                assert_eq!(body.steps.len(), 2);
                assert_eq!(body.steps[0].name, "one");
                assert_eq!(body.steps[1].timeout_ms, Some(500));
            }
            TestBody::Simple(_) => panic!("expected steps body"),
        }
    }

    #[test]
    fn test_builder_is_idempotent() {
        let builder = TestBuilder::new("twice")
            .name("built twice")
            .step("s", |_ctx, _state| async { Ok(None) });

        let a = builder.build();
        let b = builder.build();
        assert_eq!(a.meta.id, b.meta.id);
        assert_eq!(a.meta.name, b.meta.name);
        assert_eq!(a.kind(), b.kind());
    }

    #[test]
    fn test_each_builder_generates_stable_ids() {
        let rows = vec![json!({"code": 200}), json!({"code": 404, "name": "not found"})];
        let each = EachBuilder::new("status", rows)
            .name("status matrix")
            .run_each(|_ctx, _row| async { Ok(()) });

        let tests = each.build();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].meta.id, "status[0]");
        assert_eq!(tests[1].meta.id, "status[1]");
        // Linha com "name" usa o próprio nome; a outra herda do builder.
        assert_eq!(tests[0].meta.name.as_deref(), Some("status matrix"));
        assert_eq!(tests[1].meta.name.as_deref(), Some("not found"));

        let again = each.build();
        assert_eq!(again[0].meta.id, "status[0]");
    }

    #[test]
    fn test_module_lookup_and_order() {
        let module = Module::new()
            .test(TestBuilder::new("a").run(|_| async { Ok(()) }).build())
            .export(
                "b-builder",
                Export::Builder(TestBuilder::new("b").run(|_| async { Ok(()) })),
            );

        assert_eq!(module.len(), 2);
        assert!(module.get("a").is_some());
        assert!(module.get("b-builder").is_some());
        assert!(module.get("missing").is_none());

        let names: Vec<&str> = module.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b-builder"]);
    }
}
