//! # Módulo de Códigos de Erro Estruturados
//!
//! Define códigos padronizados para as falhas que o engine e o runtime podem
//! reportar, além do erro-sentinela [`TestAbort`] que interrompe um teste.
//!
//! ## Para todos entenderem:
//!
//! Quando um teste falha, existem dois mundos de erro bem diferentes:
//!
//! 1. **Erros recuperáveis**: uma assertion falhou, um schema não bateu.
//!    Viram eventos e contadores; o teste continua rodando.
//! 2. **Erros terminais**: `fail()`, schema fatal, timeout de step, variável
//!    obrigatória ausente. Interrompem o corpo do teste na hora.
//!
//! O código numérico identifica a origem sem depender do texto da mensagem,
//! o que facilita dashboards, alertas e busca em logs.
//!
//! ## Categorias de Erro
//!
//! | Faixa  | Categoria   | Origem                                  |
//! |--------|-------------|------------------------------------------|
//! | E1xxx  | Discovery   | Resolver / registro de testes            |
//! | E2xxx  | Subprocess  | Spawn, timeout, OOM, sinais              |
//! | E3xxx  | Runtime     | Dentro do sandbox (vars, steps, budget)  |
//! | E4xxx  | Config      | Flags de sandbox, limites, dev-config    |
//! | E5xxx  | Internal    | Bug no próprio engine; reporte!          |

use std::fmt;

// ============================================================================
// ERRO-SENTINELA DO RUNTIME
// ============================================================================

/// Erro-sentinela que interrompe o corpo de um teste.
///
/// `ctx.fail(...)` e `ctx.skip(...)` devolvem um `anyhow::Error` cuja causa
/// raiz é este tipo; o harness faz downcast para decidir o status final.
/// Qualquer outro erro propagado pelo corpo do teste vira `status: failed`
/// com a mensagem e a cadeia de causas.
#[derive(Debug)]
pub enum TestAbort {
    /// Falha explícita via `ctx.fail(...)` ou schema com severidade fatal.
    Failed { message: String },

    /// Pulo explícito via `ctx.skip(...)`.
    Skipped { reason: Option<String> },
}

impl fmt::Display for TestAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestAbort::Failed { message } => write!(f, "{}", message),
            TestAbort::Skipped { reason: Some(r) } => write!(f, "test skipped: {}", r),
            TestAbort::Skipped { reason: None } => write!(f, "test skipped"),
        }
    }
}

impl std::error::Error for TestAbort {}

// ============================================================================
// ERRO COM CÓDIGO ANEXADO
// ============================================================================

/// Erro com um [`ErrorCode`] anexado.
///
/// O `Display` é apenas a mensagem, então o texto que chega na timeline
/// fica limpo; o código viaja junto e é recuperável por downcast (é assim
/// que engine e harness o levam para logs e relatórios).
#[derive(Debug)]
pub struct CodedError {
    pub code: ErrorCode,
    pub message: String,
}

impl CodedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CodedError {}

/// Atalho para erguer um erro codificado:
/// `Err(coded(ErrorCode::MISSING_REQUIRED, "..."))`.
pub fn coded(code: ErrorCode, message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(CodedError::new(code, message))
}

// ============================================================================
// CÓDIGO DE ERRO
// ============================================================================

/// Código de erro estruturado: primeiro dígito é a categoria, os três
/// últimos identificam o erro específico.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // Todo código aqui tem um ponto de construção real no engine ou no
    // runtime; concerns que já carregam a informação em outro lugar (o
    // `error` do step_end, o tipo BudgetExceeded) não ganham código.

    // ========================================================================
    // E1xxx: Discovery / registro
    // ========================================================================

    /// Teste não encontrado nem por id nem por export.
    pub const TEST_NOT_FOUND: Self = Self(1001);

    /// Nenhum teste para executar (módulo vazio ou seleção vazia).
    pub const EMPTY_MODULE: Self = Self(1002);

    // ========================================================================
    // E2xxx: Subprocess
    // ========================================================================

    /// Deadline de wall-clock estourado; o engine matou o processo.
    pub const PROCESS_TIMEOUT: Self = Self(2001);

    /// Processo morto por SIGKILL / exit 137 (memória esgotada).
    pub const PROCESS_OOM: Self = Self(2002);

    /// Processo terminado por SIGTERM / exit 143.
    pub const PROCESS_TERMINATED: Self = Self(2003);

    /// Saída não-zero sem classificação mais específica.
    pub const PROCESS_EXIT: Self = Self(2004);

    /// O spawn do subprocess falhou (binário ausente, permissão).
    pub const SPAWN_FAILED: Self = Self(2005);

    // ========================================================================
    // E3xxx: Runtime (dentro do sandbox)
    // ========================================================================

    /// `require()` sobre var/secret ausente ou vazia.
    pub const MISSING_REQUIRED: Self = Self(3001);

    /// Validador de `require()` rejeitou o valor.
    pub const VALIDATION_FAILED: Self = Self(3002);

    /// Fixture de ciclo de vida usada incorretamente.
    pub const FIXTURE_MISUSE: Self = Self(3003);

    /// `pollUntil` estourou o deadline sem `onTimeout`.
    pub const POLL_TIMEOUT: Self = Self(3004);

    /// Host ou scheme recusado pela política de rede do sandbox.
    pub const NETWORK_DENIED: Self = Self(3005);

    // ========================================================================
    // E4xxx: Configuração
    // ========================================================================

    /// Lote excede os limites de execução configurados.
    pub const LIMITS_EXCEEDED: Self = Self(4001);

    /// Arquivo apontado por GLUBEAN_DEV_CONFIG ilegível ou inválido.
    pub const DEV_CONFIG_INVALID: Self = Self(4002);

    // ========================================================================
    // E5xxx: Internos
    // ========================================================================

    /// Erro interno inesperado.
    pub const INTERNAL_ERROR: Self = Self(5001);

    /// Falha ao serializar um evento do protocolo.
    pub const EVENT_SERIALIZATION: Self = Self(5002);

    // ========================================================================
    // MÉTODOS
    // ========================================================================

    pub fn code(&self) -> u16 {
        self.0
    }

    /// Código com prefixo "E": `ErrorCode::PROCESS_OOM.formatted() == "E2002"`.
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Discovery,
            2 => ErrorCategory::Subprocess,
            3 => ErrorCategory::Runtime,
            4 => ErrorCategory::Configuration,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "Test not found",
            1002 => "No tests to run",
            2001 => "Process wall-clock timeout",
            2002 => "Process killed (out of memory)",
            2003 => "Process terminated",
            2004 => "Process exited with non-zero code",
            2005 => "Failed to spawn test process",
            3001 => "Missing required variable",
            3002 => "Variable validation failed",
            3003 => "Fixture misuse",
            3004 => "pollUntil deadline exceeded",
            3005 => "Network access denied",
            4001 => "Execution limits exceeded",
            4002 => "Invalid dev config",
            5001 => "Internal error",
            5002 => "Event serialization failure",
            _ => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

// ============================================================================
// CATEGORIA DE ERRO
// ============================================================================

/// Categoria derivada do primeiro dígito do código.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Discovery,
    Subprocess,
    Runtime,
    Configuration,
    Internal,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Discovery => "discovery",
            ErrorCategory::Subprocess => "subprocess",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
