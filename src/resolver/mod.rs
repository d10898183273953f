//! # Módulo de Resolução de Testes
//!
//! Dado um [`Module`] (exports nomeados do binário de testes do usuário),
//! este módulo responde três perguntas:
//!
//! 1. **O que existe?** [`enumerate`] lista os testes descobríveis, usado
//!    por tooling externo de discovery e pelo pre-flight de tags em CI
//!    (exposto pelo harness via `--list`).
//! 2. **Onde está o teste X?** [`find_by_id`] procura por id estável, na
//!    ordem: export `default`, export com o nome igual ao id (caso comum),
//!    demais exports na ordem de declaração. Igualdade exata, sem
//!    substring nem case-insensitive.
//! 3. **E se o id mudou?** [`find_by_export`] localiza pelo nome do
//!    export, fallback para testes não-determinísticos (ex.: linha de
//!    exemplo sorteada) cujo id descoberto pode não bater na execução.
//!
//! Builders e each-builders encontrados em qualquer posição são
//! construídos e o resultado resolvido recursivamente; como `build()` é
//! idempotente, resolver duas vezes produz testes equivalentes.

use serde::{Deserialize, Serialize};

use crate::suite::{Export, Module, TestCase, TestKind};

/// Um teste descoberto, com os metadados necessários para filtragem.
///
/// Serializável nos dois sentidos: o harness emite (`--list`) e o CLI do
/// engine consome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTest {
    pub export_name: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub kind: TestKind,
    #[serde(default)]
    pub only: bool,
    #[serde(default)]
    pub skip: bool,
}

/// Constrói (se preciso) e materializa os testes de um export.
fn resolve_export(export: &Export) -> Vec<TestCase> {
    match export {
        Export::Test(test) => vec![test.clone()],
        Export::Tests(tests) => tests.clone(),
        Export::Builder(builder) => vec![builder.build()],
        Export::EachBuilder(each) => each.build(),
    }
}

/// Lista todos os testes descobríveis, na ordem de declaração dos exports.
pub fn enumerate(module: &Module) -> Vec<DiscoveredTest> {
    let mut discovered = Vec::new();
    for (export_name, export) in module.iter() {
        for test in resolve_export(export) {
            discovered.push(DiscoveredTest {
                export_name: export_name.to_string(),
                id: test.meta.id.clone(),
                name: test.meta.name.clone(),
                tags: test.meta.tags.clone(),
                kind: test.kind(),
                only: test.meta.only,
                skip: test.meta.skip,
            });
        }
    }
    discovered
}

/// Procura um teste pelo id estável.
///
/// Ordem de busca: export `default`, export com nome igual ao id, demais
/// exports na ordem de declaração. O primeiro match vence.
pub fn find_by_id(module: &Module, id: &str) -> Option<TestCase> {
    if let Some(export) = module.get("default") {
        if let Some(test) = find_in_export(export, id) {
            return Some(test);
        }
    }
    if id != "default" {
        if let Some(export) = module.get(id) {
            if let Some(test) = find_in_export(export, id) {
                return Some(test);
            }
        }
    }
    for (export_name, export) in module.iter() {
        if export_name == "default" || export_name == id {
            continue;
        }
        if let Some(test) = find_in_export(export, id) {
            return Some(test);
        }
    }
    None
}

fn find_in_export(export: &Export, id: &str) -> Option<TestCase> {
    resolve_export(export)
        .into_iter()
        .find(|test| test.meta.id == id)
}

/// Localiza pelo nome do export; num export com vários testes, devolve o
/// primeiro resolvido.
pub fn find_by_export(module: &Module, export_name: &str) -> Option<TestCase> {
    module
        .get(export_name)
        .and_then(|export| resolve_export(export).into_iter().next())
}

// ============================================================================
// TESTES
// ============================================================================
