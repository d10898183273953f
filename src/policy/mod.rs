//! # Módulo de Política de Rede
//!
//! Duas responsabilidades, ambas funções puras:
//!
//! 1. **Resolução de acesso** ([`NetworkAccess`]): transforma o valor de
//!    `allowNet` da configuração (`"*"`, vazio, lista de hosts) no flag de
//!    sandbox correspondente, sempre fail-closed: uma lista que fica vazia
//!    depois do trim vira "sem rede".
//! 2. **Classificação SSRF** ([`classify_host`] e companhia): runners que
//!    executam testes de terceiros usam estes classificadores para recusar
//!    alvos sensíveis (loopback, RFC 1918, link-local, endpoints de
//!    metadata de cloud). Retorno `None` significa seguro.
//!
//! ## Por que fail-closed?
//!
//! `allowNet: "  ,  "` é quase sempre um erro de template/interpolação.
//! Liberar a rede nesse caso transformaria um typo em exposição; negar
//! tudo transforma o typo em um erro visível no primeiro request.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ============================================================================
// ACESSO DE REDE (allowNet -> flag de sandbox)
// ============================================================================

/// Política de rede resolvida a partir do valor `allowNet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkAccess {
    /// Nenhum acesso de rede (sentinela "sem rede").
    Denied,
    /// Acesso irrestrito (`allowNet: "*"`).
    Unrestricted,
    /// Somente os hosts listados.
    Allowlist(Vec<String>),
}

impl NetworkAccess {
    /// Resolve o valor cru de `allowNet`.
    ///
    /// - `"*"` → irrestrito
    /// - `""` → sem rede
    /// - `"a.com, b.com"` → allowlist com trim; entradas vazias caem fora
    /// - lista que fica vazia após o trim → sem rede (fail-closed)
    pub fn resolve(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed == "*" {
            return NetworkAccess::Unrestricted;
        }
        if trimmed.is_empty() {
            return NetworkAccess::Denied;
        }
        let hosts: Vec<String> = trimmed
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        if hosts.is_empty() {
            NetworkAccess::Denied
        } else {
            NetworkAccess::Allowlist(hosts)
        }
    }

    /// Reconstrói a política a partir do flag recebido pelo harness.
    ///
    /// Flag ausente significa "sem rede" (o sandbox nasce fechado).
    pub fn from_flag_value(value: Option<&str>) -> Self {
        match value {
            None => NetworkAccess::Denied,
            Some(v) => NetworkAccess::resolve(v),
        }
    }

    /// O flag de sandbox correspondente; `None` = nenhum flag (sem rede).
    pub fn to_flag(&self) -> Option<String> {
        match self {
            NetworkAccess::Denied => None,
            NetworkAccess::Unrestricted => Some("--allow-net".to_string()),
            NetworkAccess::Allowlist(hosts) => {
                Some(format!("--allow-net={}", hosts.join(",")))
            }
        }
    }

    /// Decide se um host pode ser alcançado sob esta política.
    pub fn allows(&self, host: &str) -> bool {
        match self {
            NetworkAccess::Denied => false,
            NetworkAccess::Unrestricted => true,
            NetworkAccess::Allowlist(hosts) => {
                let host = host.to_ascii_lowercase();
                hosts.iter().any(|h| h == &host)
            }
        }
    }
}

// ============================================================================
// CLASSIFICADORES SSRF
// ============================================================================

/// Violação detectada por um classificador. `None` = alvo seguro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolation {
    BlockedHostname,
    LoopbackIp,
    PrivateIp,
    LinkLocalIp,
    MetadataIp,
    BlockedScheme,
    BlockedPort,
}

impl PolicyViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyViolation::BlockedHostname => "blocked_hostname",
            PolicyViolation::LoopbackIp => "loopback_ip",
            PolicyViolation::PrivateIp => "private_ip",
            PolicyViolation::LinkLocalIp => "link_local_ip",
            PolicyViolation::MetadataIp => "metadata_ip",
            PolicyViolation::BlockedScheme => "blocked_scheme",
            PolicyViolation::BlockedPort => "blocked_port",
        }
    }
}

/// Hostnames sempre recusados, independente de resolução DNS.
const BLOCKED_HOSTNAMES: [&str; 4] = [
    "localhost",
    "localhost.localdomain",
    "metadata",
    "metadata.google.internal",
];

/// Endpoints de metadata de cloud (AWS/GCP, Alibaba, AWS IMDS IPv6).
const METADATA_V4: [Ipv4Addr; 2] = [
    Ipv4Addr::new(169, 254, 169, 254),
    Ipv4Addr::new(100, 100, 100, 200),
];

/// Classifica um hostname contra o conjunto fechado de nomes sensíveis.
pub fn classify_hostname(host: &str) -> Option<PolicyViolation> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if BLOCKED_HOSTNAMES.contains(&normalized.as_str()) {
        Some(PolicyViolation::BlockedHostname)
    } else {
        None
    }
}

/// Classifica um IP em categorias SSRF-sensíveis.
///
/// Metadata tem precedência sobre link-local: `169.254.169.254` pertence às
/// duas faixas e deve ser reportado como `metadata_ip`.
pub fn classify_ip(ip: IpAddr) -> Option<PolicyViolation> {
    match ip {
        IpAddr::V4(v4) => classify_ipv4(v4),
        IpAddr::V6(v6) => classify_ipv6(v6),
    }
}

fn classify_ipv4(ip: Ipv4Addr) -> Option<PolicyViolation> {
    if METADATA_V4.contains(&ip) {
        return Some(PolicyViolation::MetadataIp);
    }
    if ip.is_loopback() {
        return Some(PolicyViolation::LoopbackIp);
    }
    if ip.is_private() {
        return Some(PolicyViolation::PrivateIp);
    }
    if ip.is_link_local() {
        return Some(PolicyViolation::LinkLocalIp);
    }
    None
}

fn classify_ipv6(ip: Ipv6Addr) -> Option<PolicyViolation> {
    // IPv4 mapeado em IPv6 (::ffff:a.b.c.d) é classificado por recursão.
    let segments = ip.segments();
    if segments[..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
        let v4 = Ipv4Addr::new(
            (segments[6] >> 8) as u8,
            (segments[6] & 0xff) as u8,
            (segments[7] >> 8) as u8,
            (segments[7] & 0xff) as u8,
        );
        return classify_ipv4(v4);
    }
    // AWS IMDS em IPv6: fd00:ec2::254.
    if segments == [0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254] {
        return Some(PolicyViolation::MetadataIp);
    }
    if ip.is_loopback() {
        return Some(PolicyViolation::LoopbackIp);
    }
    // Unique-local fc00::/7 (na prática fd00::/8).
    if segments[0] & 0xfe00 == 0xfc00 {
        return Some(PolicyViolation::PrivateIp);
    }
    // Link-local fe80::/10.
    if segments[0] & 0xffc0 == 0xfe80 {
        return Some(PolicyViolation::LinkLocalIp);
    }
    None
}

/// Classifica um alvo que pode ser hostname ou IP literal.
pub fn classify_host(host: &str) -> Option<PolicyViolation> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return classify_ip(ip);
    }
    classify_hostname(host)
}

/// Apenas `http:` e `https:` são aceitos (com ou sem os dois-pontos).
pub fn classify_scheme(scheme: &str) -> Option<PolicyViolation> {
    match scheme.trim_end_matches(':') {
        "http" | "https" => None,
        _ => Some(PolicyViolation::BlockedScheme),
    }
}

/// Allowlist de portas fornecida pelo chamador; lista vazia = sem restrição.
pub fn classify_port(port: u16, allowed: &[u16]) -> Option<PolicyViolation> {
    if allowed.is_empty() || allowed.contains(&port) {
        None
    } else {
        Some(PolicyViolation::BlockedPort)
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Testes: resolução de allowNet
    // ========================================================================

    #[test]
    fn test_resolve_star_is_unrestricted() {
        assert_eq!(NetworkAccess::resolve("*"), NetworkAccess::Unrestricted);
        assert_eq!(
            NetworkAccess::resolve("*").to_flag().as_deref(),
            Some("--allow-net")
        );
    }

    #[test]
    fn test_resolve_empty_is_denied() {
        assert_eq!(NetworkAccess::resolve(""), NetworkAccess::Denied);
        assert_eq!(NetworkAccess::resolve("").to_flag(), None);
    }

    #[test]
    fn test_resolve_blank_list_fails_closed() {
        assert_eq!(NetworkAccess::resolve("  ,  "), NetworkAccess::Denied);
        assert_eq!(NetworkAccess::resolve(" , , "), NetworkAccess::Denied);
    }

    #[test]
    fn test_resolve_allowlist_trims_and_drops_empties() {
        let access = NetworkAccess::resolve(" api.example.com , ,b.example.com ");
        assert_eq!(
            access,
            NetworkAccess::Allowlist(vec![
                "api.example.com".to_string(),
                "b.example.com".to_string()
            ])
        );
        assert_eq!(
            access.to_flag().as_deref(),
            Some("--allow-net=api.example.com,b.example.com")
        );
    }

    #[test]
    fn test_from_flag_value() {
        assert_eq!(NetworkAccess::from_flag_value(None), NetworkAccess::Denied);
        assert_eq!(
            NetworkAccess::from_flag_value(Some("*")),
            NetworkAccess::Unrestricted
        );
        assert!(matches!(
            NetworkAccess::from_flag_value(Some("a.com")),
            NetworkAccess::Allowlist(_)
        ));
    }

    #[test]
    fn test_allows_is_case_insensitive() {
        let access = NetworkAccess::resolve("API.Example.com");
        assert!(access.allows("api.example.com"));
        assert!(access.allows("API.EXAMPLE.COM"));
        assert!(!access.allows("other.example.com"));
    }

    // ========================================================================
    // Testes: classificadores de hostname
    // ========================================================================

    #[test]
    fn test_blocked_hostnames() {
        for host in ["localhost", "LOCALHOST", "localhost.localdomain", "metadata", "metadata.google.internal", "metadata.google.internal."] {
            assert_eq!(
                classify_hostname(host),
                Some(PolicyViolation::BlockedHostname),
                "{host} should be blocked"
            );
        }
        assert_eq!(classify_hostname("example.com"), None);
        assert_eq!(classify_hostname("notlocalhost.example.com"), None);
    }

    // ========================================================================
    // Testes: classificadores de IP
    // ========================================================================

    #[test]
    fn test_loopback_ips() {
        assert_eq!(
            classify_host("127.0.0.1"),
            Some(PolicyViolation::LoopbackIp)
        );
        assert_eq!(classify_host("::1"), Some(PolicyViolation::LoopbackIp));
    }

    #[test]
    fn test_private_ranges() {
        for ip in ["10.0.0.1", "172.16.5.4", "192.168.1.1"] {
            assert_eq!(classify_host(ip), Some(PolicyViolation::PrivateIp), "{ip}");
        }
        assert_eq!(classify_host("172.32.0.1"), None, "172.32/12 is public");
        assert_eq!(
            classify_host("fd12:3456::1"),
            Some(PolicyViolation::PrivateIp),
            "unique-local IPv6"
        );
    }

    #[test]
    fn test_link_local() {
        assert_eq!(
            classify_host("169.254.1.1"),
            Some(PolicyViolation::LinkLocalIp)
        );
        assert_eq!(
            classify_host("fe80::1"),
            Some(PolicyViolation::LinkLocalIp)
        );
    }

    #[test]
    fn test_metadata_ips_take_precedence() {
        // 169.254.169.254 também é link-local; metadata vence.
        assert_eq!(
            classify_host("169.254.169.254"),
            Some(PolicyViolation::MetadataIp)
        );
        assert_eq!(
            classify_host("100.100.100.200"),
            Some(PolicyViolation::MetadataIp)
        );
        assert_eq!(
            classify_host("fd00:ec2::254"),
            Some(PolicyViolation::MetadataIp)
        );
    }

    #[test]
    fn test_ipv4_mapped_ipv6_recursion() {
        assert_eq!(
            classify_host("::ffff:127.0.0.1"),
            Some(PolicyViolation::LoopbackIp)
        );
        assert_eq!(
            classify_host("::ffff:169.254.169.254"),
            Some(PolicyViolation::MetadataIp)
        );
        assert_eq!(classify_host("::ffff:93.184.216.34"), None);
    }

    #[test]
    fn test_public_ip_is_safe() {
        assert_eq!(classify_host("93.184.216.34"), None);
        assert_eq!(classify_host("2606:2800:220:1::1"), None);
    }

    // ========================================================================
    // Testes: scheme e porta
    // ========================================================================

    #[test]
    fn test_scheme_allowlist() {
        assert_eq!(classify_scheme("http"), None);
        assert_eq!(classify_scheme("https:"), None);
        assert_eq!(classify_scheme("ftp"), Some(PolicyViolation::BlockedScheme));
        assert_eq!(
            classify_scheme("file:"),
            Some(PolicyViolation::BlockedScheme)
        );
    }

    #[test]
    fn test_port_allowlist() {
        assert_eq!(classify_port(443, &[]), None, "empty list = unrestricted");
        assert_eq!(classify_port(443, &[80, 443]), None);
        assert_eq!(
            classify_port(6379, &[80, 443]),
            Some(PolicyViolation::BlockedPort)
        );
    }

    #[test]
    fn test_violation_labels() {
        assert_eq!(PolicyViolation::BlockedHostname.as_str(), "blocked_hostname");
        assert_eq!(PolicyViolation::MetadataIp.as_str(), "metadata_ip");
        assert_eq!(PolicyViolation::LinkLocalIp.as_str(), "link_local_ip");
    }
}
