//! # Configuração Compartilhada de Execução
//!
//! O [`RunConfig`] é o conjunto fechado de opções de engine resolvido uma
//! vez por lote: política de fail-fast, timeout por teste, concorrência,
//! permissões de sandbox, rede e verbosidade de trace.
//!
//! ## Mapeamento para flags de sandbox
//!
//! | Campo              | Efeito                                            |
//! |--------------------|---------------------------------------------------|
//! | `permissions`      | repassadas; leitura sempre garantida; flags de    |
//! |                    | rede pré-existentes são removidas                 |
//! | `allow_net`        | `"*"` → `--allow-net`; vazio → nada (sem rede);   |
//! |                    | lista → `--allow-net=a,b` (fail-closed no vazio)  |
//! | `per_test_timeout_ms` | deadline de wall-clock do executor             |
//! | `fail_fast`/`fail_after` | limite de falhas do scheduler               |
//! | `emit_full_trace`  | repassado ao harness                              |
//!
//! ## Presets
//!
//! - [`RunConfig::minimal`]: leitura + rede irrestrita (o default).
//! - [`RunConfig::local_dev`]: minimal + acesso ao ambiente.
//! - [`RunConfig::cloud_worker`]: sem env, timeout por teste mais longo.

use serde::{Deserialize, Serialize};

use crate::policy::NetworkAccess;

/// Timeout padrão por teste (wall-clock), em milissegundos.
pub const DEFAULT_PER_TEST_TIMEOUT_MS: u64 = 30_000;

/// Configuração de engine compartilhada por um lote inteiro.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    /// Para na primeira falha.
    pub fail_fast: bool,
    /// Para depois de N falhas; tem precedência sobre `fail_fast`.
    pub fail_after: Option<u32>,
    pub per_test_timeout_ms: u64,
    pub concurrency: usize,
    /// Flags de permissão do sandbox, em ordem.
    pub permissions: Vec<String>,
    /// Política de rede crua (`"*"`, vazio, ou lista separada por vírgula).
    pub allow_net: String,
    pub emit_full_trace: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::minimal()
    }
}

impl RunConfig {
    /// Leitura apenas, rede irrestrita.
    pub fn minimal() -> Self {
        Self {
            fail_fast: false,
            fail_after: None,
            per_test_timeout_ms: DEFAULT_PER_TEST_TIMEOUT_MS,
            concurrency: 1,
            permissions: vec!["--allow-read".to_string()],
            allow_net: "*".to_string(),
            emit_full_trace: false,
        }
    }

    /// Desenvolvimento local: minimal + variáveis de ambiente.
    pub fn local_dev() -> Self {
        let mut config = Self::minimal();
        config.permissions.push("--allow-env".to_string());
        config
    }

    /// Worker de nuvem: sem acesso a env, timeout por teste mais longo.
    pub fn cloud_worker() -> Self {
        Self {
            per_test_timeout_ms: 120_000,
            ..Self::minimal()
        }
    }

    /// Política de rede resolvida (fail-closed em listas vazias).
    pub fn network(&self) -> NetworkAccess {
        NetworkAccess::resolve(&self.allow_net)
    }

    /// Limite de falhas efetivo do scheduler.
    pub fn failure_limit(&self) -> u32 {
        self.fail_after
            .unwrap_or(if self.fail_fast { 1 } else { u32::MAX })
    }

    /// Flags de sandbox completos: permissões saneadas + flag de rede.
    pub fn sandbox_flags(&self) -> Vec<String> {
        // Flags de rede pré-existentes são removidas: a única fonte de
        // verdade para rede é `allow_net`.
        let mut flags: Vec<String> = self
            .permissions
            .iter()
            .filter(|flag| !flag.starts_with("--allow-net"))
            .cloned()
            .collect();
        if !flags.iter().any(|flag| flag == "--allow-read") {
            flags.insert(0, "--allow-read".to_string());
        }
        if let Some(net_flag) = self.network().to_flag() {
            flags.push(net_flag);
        }
        flags
    }
}

// ============================================================================
// TESTES
// ============================================================================
