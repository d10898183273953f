//! # Módulo de Limites de Execução
//!
//! Guard rails do engine para lotes grandes ou mal configurados: um lote
//! que excede os limites é rejeitado **antes** de qualquer subprocess
//! nascer, com violações estruturadas em vez de um estouro silencioso de
//! recursos no meio da execução.
//!
//! ## Por que isso importa?
//!
//! Suites geradas por ferramentas (matrizes data-driven, OpenAPI) podem
//! explodir em milhares de testes; concorrência alta demais esgota file
//! descriptors com um subprocess por teste; timeouts por teste absurdos
//! seguram workers por horas. Falhar cedo e com mensagem clara é mais
//! barato que diagnosticar um worker travado.
//!
//! ## Limites configuráveis (env):
//!
//! | Variável                    | Padrão | Limita                    |
//! |-----------------------------|--------|---------------------------|
//! | `GLUBEAN_MAX_TESTS`         | 1000   | testes por lote           |
//! | `GLUBEAN_MAX_CONCURRENCY`   | 32     | workers simultâneos       |
//! | `GLUBEAN_MAX_TIMEOUT_MS`    | 600000 | timeout por teste (10min) |

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;

/// Máximo de testes aceitos em um único lote.
pub const DEFAULT_MAX_TESTS: usize = 1000;

/// Máximo de subprocesses simultâneos.
pub const DEFAULT_MAX_CONCURRENCY: usize = 32;

/// Teto do timeout por teste, em milissegundos.
pub const DEFAULT_MAX_TIMEOUT_MS: u64 = 600_000;

/// Limites de execução de um lote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub max_tests: usize,
    pub max_concurrency: usize,
    pub max_timeout_ms: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_tests: DEFAULT_MAX_TESTS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_timeout_ms: DEFAULT_MAX_TIMEOUT_MS,
        }
    }
}

impl ExecutionLimits {
    /// Carrega overrides das variáveis `GLUBEAN_MAX_*`.
    pub fn from_env() -> Self {
        let mut limits = Self::default();
        if let Ok(value) = std::env::var("GLUBEAN_MAX_TESTS") {
            if let Ok(n) = value.parse() {
                limits.max_tests = n;
            }
        }
        if let Ok(value) = std::env::var("GLUBEAN_MAX_CONCURRENCY") {
            if let Ok(n) = value.parse() {
                limits.max_concurrency = n;
            }
        }
        if let Ok(value) = std::env::var("GLUBEAN_MAX_TIMEOUT_MS") {
            if let Ok(n) = value.parse() {
                limits.max_timeout_ms = n;
            }
        }
        limits
    }

    /// Limites apertados para CI de fumaça.
    pub fn strict() -> Self {
        Self {
            max_tests: 50,
            max_concurrency: 4,
            max_timeout_ms: 30_000,
        }
    }
}

/// Uma violação de limite detectada.
#[derive(Debug, Clone)]
pub struct LimitViolation {
    /// Código estruturado (E4001) para logs e dashboards.
    pub code: ErrorCode,
    pub limit_name: String,
    pub limit_value: String,
    pub actual_value: String,
    pub message: String,
}

/// Resultado da checagem de limites.
#[derive(Debug)]
pub struct LimitValidationResult {
    pub passed: bool,
    pub violations: Vec<LimitViolation>,
}

/// Valida um lote contra os limites, acumulando todas as violações.
pub fn validate_limits(
    test_count: usize,
    concurrency: usize,
    per_test_timeout_ms: u64,
    limits: &ExecutionLimits,
) -> LimitValidationResult {
    let mut violations = Vec::new();

    if test_count > limits.max_tests {
        violations.push(LimitViolation {
            code: ErrorCode::LIMITS_EXCEEDED,
            limit_name: "max_tests".to_string(),
            limit_value: limits.max_tests.to_string(),
            actual_value: test_count.to_string(),
            message: format!(
                "Batch has {} tests, the maximum allowed is {}",
                test_count, limits.max_tests
            ),
        });
    }

    if concurrency > limits.max_concurrency {
        violations.push(LimitViolation {
            code: ErrorCode::LIMITS_EXCEEDED,
            limit_name: "max_concurrency".to_string(),
            limit_value: limits.max_concurrency.to_string(),
            actual_value: concurrency.to_string(),
            message: format!(
                "Concurrency of {} exceeds the maximum of {}",
                concurrency, limits.max_concurrency
            ),
        });
    }

    if per_test_timeout_ms > limits.max_timeout_ms {
        violations.push(LimitViolation {
            code: ErrorCode::LIMITS_EXCEEDED,
            limit_name: "max_timeout_ms".to_string(),
            limit_value: limits.max_timeout_ms.to_string(),
            actual_value: per_test_timeout_ms.to_string(),
            message: format!(
                "Per-test timeout of {}ms exceeds the maximum of {}ms",
                per_test_timeout_ms, limits.max_timeout_ms
            ),
        });
    }

    LimitValidationResult {
        passed: violations.is_empty(),
        violations,
    }
}

// ============================================================================
// TESTES
// ============================================================================
