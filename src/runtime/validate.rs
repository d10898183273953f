//! Pipeline de validação de JSON Schema (`ctx.validate*`).
//!
//! Independente do desfecho, cada chamada emite **exatamente um** evento
//! `schema_validation`. O que muda com a severidade é o roteamento da
//! falha:
//!
//! | Severidade | Falha vira...                                   |
//! |------------|--------------------------------------------------|
//! | `error`    | assertion falhada (conta, teste continua)        |
//! | `warn`     | warning disparado (nunca falha o teste)          |
//! | `fatal`    | assertion falhada + erro-sentinela (teste para)  |
//!
//! A compilação do schema usa `jsonschema`; um schema inválido é tratado
//! como falha de validação (não como pânico), com o erro de compilação na
//! lista de issues.

use anyhow::Result;
use jsonschema::JSONSchema;
use serde_json::Value;

use crate::errors::TestAbort;
use crate::protocol::{Severity, TimelineEvent};

use super::Ctx;

/// Limite de issues anexadas ao evento, para não poluir a timeline.
const MAX_ISSUES: usize = 5;

/// Valida `data` contra `schema` e roteia o resultado conforme a
/// severidade. Retorna `Ok(Some(data))` no sucesso; `Ok(None)` em falha
/// não-fatal; `Err` apenas para `fatal`.
pub(crate) fn run(
    ctx: &Ctx,
    data: &Value,
    schema: &Value,
    label: &str,
    severity: Severity,
) -> Result<Option<Value>> {
    let issues: Option<Vec<String>> = match JSONSchema::compile(schema) {
        Ok(compiled) => match compiled.validate(data) {
            Ok(()) => None,
            Err(errors) => Some(
                errors
                    .map(|e| format!("{} at {}", e, e.instance_path))
                    .take(MAX_ISSUES)
                    .collect(),
            ),
        },
        Err(e) => Some(vec![format!("invalid schema: {}", e)]),
    };

    let success = issues.is_none();
    ctx.with_counters(|c| {
        c.schema_validation_total += 1;
        if !success {
            match severity {
                Severity::Error | Severity::Fatal => c.schema_validation_failed += 1,
                Severity::Warn => c.schema_validation_warnings += 1,
            }
        }
    });

    ctx.emit(TimelineEvent::SchemaValidation {
        label: label.to_string(),
        success,
        severity,
        issues: issues.clone(),
        step_index: ctx.current_step(),
    });

    if success {
        return Ok(Some(data.clone()));
    }

    let message = format!(
        "Schema validation failed: {} ({})",
        label,
        issues.unwrap_or_default().join("; ")
    );
    match severity {
        Severity::Error => {
            ctx.record_assertion(false, Some(message), None, None);
            Ok(None)
        }
        Severity::Warn => {
            ctx.warn(false, message);
            Ok(None)
        }
        Severity::Fatal => {
            ctx.record_assertion(false, Some(message.clone()), None, None);
            Err(anyhow::Error::new(TestAbort::Failed { message }))
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
