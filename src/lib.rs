//! # Glubean - Motor de Execução de Testes de API
//!
//! Este crate é o **núcleo de execução** da plataforma Glubean: o engine
//! que roda cada teste num subprocess isolado, e o runtime que vive dentro
//! desse subprocess servindo o código de teste do usuário.
//!
//! ## As duas metades
//!
//! 1. **Engine** (processo host): spawna o binário de testes com flags de
//!    sandbox, alimenta o contexto por stdin, consome a timeline NDJSON do
//!    stdout, impõe timeout/OOM e agrega lotes com fail-fast.
//! 2. **Runtime** (dentro do sandbox): o objeto [`runtime::Ctx`] entregue
//!    a todo teste - vars/secrets, assertions soft, HTTP rastreado,
//!    validação de schema, steps com retry e fixtures.
//!
//! As metades conversam por um único contrato: o protocolo de eventos de
//! timeline ([`protocol::TimelineEvent`]), uma linha JSON por evento.
//!
//! ## Arquitetura
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      engine (host)                            │
//! │  scheduler ──> executor ──spawn──> binário de testes          │
//! │      ^                               │                        │
//! │      └──── eventos + resultados <────┘ (NDJSON no stdout)     │
//! └───────────────────────────────────────────────────────────────┘
//!                                      │ dentro do subprocess
//!                                      ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │  harness ──> resolver ──> runtime (Ctx) ──> steps/fixtures    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Exemplo: um binário de testes
//!
//! ```ignore
//! use glubean::suite::{Module, TestBuilder};
//!
//! fn main() -> ! {
//!     let module = Module::new().test(
//!         TestBuilder::new("health")
//!             .name("API health check")
//!             .run(|ctx| async move {
//!                 let resp = ctx.http().get("/healthz").send().await?;
//!                 ctx.expect(resp.status()).to_be(200);
//!                 Ok(())
//!             })
//!             .build(),
//!     );
//!     glubean::harness::main(module);
//! }
//! ```

pub mod engine;
pub mod errors;
pub mod harness;
pub mod limits;
pub mod policy;
pub mod protocol;
pub mod resolver;
pub mod runtime;
pub mod steps;
pub mod suite;
pub mod telemetry;

pub use engine::{run_many, BatchOptions, RunConfig, RunOptions, SubprocessExecutor, TestRunner};
pub use protocol::{BatchResult, ExecutionContext, ExecutionResult, TimelineEvent};
pub use runtime::Ctx;
pub use suite::{EachBuilder, Module, TestBuilder};
