//! Orçamento de bytes de resposta (hook do sandbox).
//!
//! Quando o runner configura uma cota, cada corpo de resposta HTTP passa
//! por uma transformação contadora. A checagem acontece em dois momentos:
//!
//! 1. **Antes de consumir bytes**: se o `content-length` declarado já
//!    estouraria o orçamento acumulado, emitimos um warning e recusamos a
//!    resposta inteira.
//! 2. **Durante o stream**: sem `content-length`, avisamos que o tamanho é
//!    desconhecido e contamos chunk a chunk; no estouro, warning e aborto
//!    do stream com o mesmo erro.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use super::Ctx;

/// Erro de estouro do orçamento de resposta.
#[derive(Debug, Error)]
#[error("Network response budget of {limit} bytes exceeded")]
pub struct BudgetExceeded {
    pub limit: u64,
}

/// Cota cumulativa de bytes de resposta para um teste.
#[derive(Debug)]
pub struct NetworkBudget {
    limit: u64,
    used: AtomicU64,
}

impl NetworkBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// Checagem com o `content-length` declarado, antes de qualquer byte
    /// ser consumido. `None` = tamanho desconhecido (warning informativo,
    /// enforcement fica por conta de [`NetworkBudget::consume`]).
    pub(crate) fn precheck(
        &self,
        ctx: &Ctx,
        declared: Option<u64>,
    ) -> Result<(), BudgetExceeded> {
        let used = self.used();
        match declared {
            Some(length) => {
                if used.saturating_add(length) > self.limit {
                    ctx.warn(
                        false,
                        format!(
                            "Response of {} bytes would exceed the network budget ({} of {} bytes already used)",
                            length, used, self.limit
                        ),
                    );
                    return Err(BudgetExceeded { limit: self.limit });
                }
                Ok(())
            }
            None => {
                ctx.warn(
                    true,
                    format!(
                        "Response has no content-length; network budget enforced by streamed byte count ({} of {} bytes used)",
                        used, self.limit
                    ),
                );
                Ok(())
            }
        }
    }

    /// Conta um chunk streamado; o estouro aborta o stream.
    pub(crate) fn consume(&self, ctx: &Ctx, bytes: u64) -> Result<(), BudgetExceeded> {
        let total = self.used.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if total > self.limit {
            ctx.warn(
                false,
                format!(
                    "Network response budget exceeded: {} of {} bytes consumed",
                    total, self.limit
                ),
            );
            return Err(BudgetExceeded { limit: self.limit });
        }
        Ok(())
    }
}

// ============================================================================
// TESTES
// ============================================================================
