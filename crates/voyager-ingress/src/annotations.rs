//! Annotation/Policy parser
//!
//! Annotations arrive as untyped string maps on the Ingress (global scope),
//! on referenced Services (local scope) and on backing Pods. They are parsed
//! once per pass into [`IngressPolicy`] and [`BackendPolicy`]; nothing
//! downstream re-reads the raw maps.
//!
//! Precedence is applied key by key: a key set on the Ingress overrides the
//! same key on the Service, a key missing on the Ingress falls through to the
//! Service, and a key set nowhere takes its documented default. Listener-wide
//! policies (basic auth, whitelist) are enforced on the frontend when set
//! globally, so the backend only carries the Service value when the Ingress
//! leaves them unset.

use std::collections::BTreeMap;
use std::str::FromStr;

use ipnet::IpNet;
use serde::Serialize;

use voyager_common::crd::TlsVerifyMode;

use crate::compiler::CompileError;

/// Annotation keys, all under the `ingress.appscode.com/` prefix
pub mod keys {
    pub const LB_TYPE: &str = "ingress.appscode.com/type";
    pub const REPLICAS: &str = "ingress.appscode.com/replicas";
    pub const LOAD_BALANCER_IP: &str = "ingress.appscode.com/load-balancer-ip";
    pub const KEEP_SOURCE_IP: &str = "ingress.appscode.com/keep-source-ip";
    pub const HEALTH_CHECK_NODE_PORT: &str = "ingress.appscode.com/health-check-nodeport";
    pub const NODE_SELECTOR: &str = "ingress.appscode.com/node-selector";

    pub const STATS: &str = "ingress.appscode.com/stats";
    pub const STATS_PORT: &str = "ingress.appscode.com/stats-port";
    pub const STATS_SECRET: &str = "ingress.appscode.com/stats-secret-name";

    pub const ACCEPT_PROXY: &str = "ingress.appscode.com/accept-proxy";
    pub const SSL_REDIRECT: &str = "ingress.appscode.com/ssl-redirect";
    pub const FORCE_SSL_REDIRECT: &str = "ingress.appscode.com/force-ssl-redirect";
    pub const SSL_PASSTHROUGH: &str = "ingress.appscode.com/ssl-passthrough";

    pub const HSTS: &str = "ingress.appscode.com/hsts";
    pub const HSTS_MAX_AGE: &str = "ingress.appscode.com/hsts-max-age";
    pub const HSTS_PRELOAD: &str = "ingress.appscode.com/hsts-preload";
    pub const HSTS_INCLUDE_SUBDOMAINS: &str = "ingress.appscode.com/hsts-include-subdomains";

    pub const ENABLE_CORS: &str = "ingress.appscode.com/enable-cors";
    pub const CORS_ALLOW_ORIGIN: &str = "ingress.appscode.com/cors-allow-origin";
    pub const CORS_ALLOW_METHODS: &str = "ingress.appscode.com/cors-allow-methods";
    pub const CORS_ALLOW_HEADERS: &str = "ingress.appscode.com/cors-allow-headers";
    pub const CORS_ALLOW_CREDENTIALS: &str = "ingress.appscode.com/cors-allow-credentials";

    pub const LIMIT_RPM: &str = "ingress.appscode.com/limit-rpm";
    pub const LIMIT_RPS: &str = "ingress.appscode.com/limit-rps";
    pub const LIMIT_CONNECTION: &str = "ingress.appscode.com/limit-connection";

    pub const WHITELIST: &str = "ingress.appscode.com/whitelist-source-range";
    pub const MAX_CONNECTIONS: &str = "ingress.appscode.com/max-connections";
    pub const PROXY_BODY_SIZE: &str = "ingress.appscode.com/proxy-body-size";
    pub const DEFAULT_TIMEOUT: &str = "ingress.appscode.com/default-timeout";
    pub const DEFAULT_OPTION: &str = "ingress.appscode.com/default-option";
    pub const ERROR_FILES: &str = "ingress.appscode.com/errorfiles";

    pub const AUTH_TYPE: &str = "ingress.appscode.com/auth-type";
    pub const AUTH_REALM: &str = "ingress.appscode.com/auth-realm";
    pub const AUTH_SECRET: &str = "ingress.appscode.com/auth-secret";
    pub const AUTH_TLS_SECRET: &str = "ingress.appscode.com/auth-tls-secret";
    pub const AUTH_TLS_VERIFY_CLIENT: &str = "ingress.appscode.com/auth-tls-verify-client";
    pub const AUTH_TLS_ERROR_PAGE: &str = "ingress.appscode.com/auth-tls-error-page";

    pub const AFFINITY: &str = "ingress.appscode.com/affinity";
    pub const SESSION_COOKIE_NAME: &str = "ingress.appscode.com/session-cookie-name";
    pub const SESSION_COOKIE_HASH: &str = "ingress.appscode.com/session-cookie-hash";

    pub const SERVICE_ANNOTATIONS: &str = "ingress.appscode.com/service-annotations";
    pub const POD_ANNOTATIONS: &str = "ingress.appscode.com/pod-annotations";

    pub const CHECK: &str = "ingress.appscode.com/check";
    pub const CHECK_PORT: &str = "ingress.appscode.com/check-port";
    pub const AGENT_PORT: &str = "ingress.appscode.com/agent-port";
    pub const AGENT_INTERVAL: &str = "ingress.appscode.com/agent-interval";
    pub const BACKEND_TLS: &str = "ingress.appscode.com/backend-tls";
    pub const SEND_PROXY: &str = "ingress.appscode.com/send-proxy";
    pub const USE_DNS_RESOLVER: &str = "ingress.appscode.com/use-dns-resolver";
    pub const DNS_RESOLVER_NAMESERVERS: &str = "ingress.appscode.com/dns-resolver-nameservers";
    pub const DNS_RESOLVER_RETRIES: &str = "ingress.appscode.com/dns-resolver-retries";
    pub const DNS_RESOLVER_TIMEOUT: &str = "ingress.appscode.com/dns-resolver-timeout";
    pub const DNS_RESOLVER_HOLD: &str = "ingress.appscode.com/dns-resolver-hold";

    pub const BACKEND_WEIGHT: &str = "ingress.appscode.com/backend-weight";
}

pub const DEFAULT_STATS_PORT: i32 = 56789;
pub const DEFAULT_HSTS_MAX_AGE: u64 = 15_768_000;
pub const DEFAULT_SESSION_COOKIE: &str = "SERVERID";
pub const DEFAULT_AUTH_REALM: &str = "Authentication Required";
pub const DEFAULT_CORS_METHODS: &str = "GET, PUT, POST, DELETE, PATCH, OPTIONS";
pub const DEFAULT_CORS_HEADERS: &str =
    "DNT,Keep-Alive,User-Agent,X-Requested-With,If-Modified-Since,Cache-Control,Content-Type,Authorization";

/// Timeouts rendered into `defaults` unless overridden by `default-timeout`
pub const DEFAULT_TIMEOUTS: &[(&str, &str)] = &[
    ("connect", "5s"),
    ("client", "50s"),
    ("server", "50s"),
    ("client-fin", "50s"),
    ("tunnel", "50s"),
];

/// Options rendered into `defaults` unless overridden by `default-option`
pub const DEFAULT_OPTIONS: &[(&str, bool)] = &[("http-server-close", true), ("dontlognull", true)];

// =============================================================================
// Typed policy values
// =============================================================================

/// How the proxy is exposed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum LbType {
    /// Deployment behind a LoadBalancer Service
    #[default]
    LoadBalancer,
    /// Deployment behind a NodePort Service
    NodePort,
    /// DaemonSet binding host ports
    HostPort,
    /// Deployment behind a ClusterIP Service
    Internal,
}

impl FromStr for LbType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LoadBalancer" => Ok(Self::LoadBalancer),
            "NodePort" => Ok(Self::NodePort),
            "HostPort" => Ok(Self::HostPort),
            "Internal" => Ok(Self::Internal),
            other => Err(format!(
                "unknown type '{}', expected LoadBalancer, NodePort, HostPort or Internal",
                other
            )),
        }
    }
}

impl LbType {
    /// Whether the Service allocates node ports
    pub fn uses_node_ports(self) -> bool {
        matches!(self, Self::LoadBalancer | Self::NodePort)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatsPolicy {
    pub port: i32,
    pub secret: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Hsts {
    pub max_age: u64,
    pub preload: bool,
    pub include_subdomains: bool,
}

impl Hsts {
    /// Value of the `Strict-Transport-Security` header
    pub fn header_value(&self) -> String {
        let mut value = format!("max-age={}", self.max_age);
        if self.include_subdomains {
            value.push_str("; includeSubDomains");
        }
        if self.preload {
            value.push_str("; preload");
        }
        value
    }
}

/// Stick-table rate limits keyed by source IP
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    pub rpm: Option<u32>,
    pub rps: Option<u32>,
    pub connections: Option<u32>,
}

impl RateLimit {
    pub fn is_empty(&self) -> bool {
        self.rpm.is_none() && self.rps.is_none() && self.connections.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cors {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
    pub allow_credentials: bool,
}

/// Basic auth sourced from annotations: realm plus credential Secrets
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BasicAuthPolicy {
    pub realm: String,
    pub secrets: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TlsAuthPolicy {
    pub secret: String,
    pub verify: TlsVerifyMode,
    pub error_page: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StickySession {
    pub cookie_name: String,
    pub hash: Option<CookieHash>,
}

/// Algorithm deriving the per-server cookie value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CookieHash {
    Sha1,
    Md5,
    Index,
}

impl FromStr for CookieHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(Self::Sha1),
            "md5" => Ok(Self::Md5),
            "index" => Ok(Self::Index),
            other => Err(format!("unknown hash '{}', expected sha1, md5 or index", other)),
        }
    }
}

/// Secondary agent check attached to every server of a backend.
///
/// Only administrative state is driven by the agent; up/down stays with the
/// primary health check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentCheck {
    pub port: i32,
    pub interval: Option<String>,
}

/// PROXY protocol variant sent to servers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SendProxy {
    V1,
    V2,
    V2Ssl,
    V2SslCn,
}

impl FromStr for SendProxy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" | "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            "v2-ssl" => Ok(Self::V2Ssl),
            "v2-ssl-cn" => Ok(Self::V2SslCn),
            other => Err(format!(
                "unknown proxy protocol '{}', expected accept, v1, v2, v2-ssl or v2-ssl-cn",
                other
            )),
        }
    }
}

impl SendProxy {
    /// Server-line keyword
    pub fn keyword(self) -> &'static str {
        match self {
            Self::V1 => "send-proxy",
            Self::V2 => "send-proxy-v2",
            Self::V2Ssl => "send-proxy-v2-ssl",
            Self::V2SslCn => "send-proxy-v2-ssl-cn",
        }
    }
}

/// Live DNS resolution for ExternalName backends
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DnsResolverPolicy {
    /// `host:port` nameservers; empty means read `/etc/resolv.conf`
    pub nameservers: Vec<String>,
    pub retries: Option<u32>,
    pub timeout: BTreeMap<String, String>,
    pub hold: BTreeMap<String, String>,
}

// =============================================================================
// Ingress-scope policy
// =============================================================================

/// Policy parsed from the Ingress annotations alone
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngressPolicy {
    pub lb_type: LbType,
    pub replicas: i32,
    pub load_balancer_ip: Option<String>,
    pub keep_source_ip: bool,
    pub health_check_node_port: Option<i32>,
    pub node_selector: BTreeMap<String, String>,
    pub stats: Option<StatsPolicy>,
    pub accept_proxy: bool,
    pub ssl_redirect: bool,
    pub force_ssl_redirect: bool,
    pub ssl_passthrough: bool,
    pub hsts: Option<Hsts>,
    pub limit: RateLimit,
    pub whitelist: Vec<IpNet>,
    pub max_connections: Option<u32>,
    pub proxy_body_size: Option<u64>,
    pub timeouts: BTreeMap<String, String>,
    pub options: BTreeMap<String, bool>,
    pub error_files: Option<String>,
    pub basic_auth: Option<BasicAuthPolicy>,
    pub tls_auth: Option<TlsAuthPolicy>,
    pub service_annotations: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
}

impl IngressPolicy {
    /// Parse the Ingress-scope keys
    pub fn parse(annotations: &BTreeMap<String, String>) -> Result<Self, CompileError> {
        let view = Layered::global_only(annotations);

        let stats = if view.flag(keys::STATS)?.unwrap_or(false) {
            Some(StatsPolicy {
                port: view.port(keys::STATS_PORT)?.unwrap_or(DEFAULT_STATS_PORT),
                secret: view.string(keys::STATS_SECRET),
            })
        } else {
            None
        };

        let hsts = if view.flag(keys::HSTS)?.unwrap_or(true) {
            Some(Hsts {
                max_age: view.number(keys::HSTS_MAX_AGE)?.unwrap_or(DEFAULT_HSTS_MAX_AGE),
                preload: view.flag(keys::HSTS_PRELOAD)?.unwrap_or(false),
                include_subdomains: view.flag(keys::HSTS_INCLUDE_SUBDOMAINS)?.unwrap_or(false),
            })
        } else {
            None
        };

        let mut timeouts: BTreeMap<String, String> = DEFAULT_TIMEOUTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (name, value) in view.json_map(keys::DEFAULT_TIMEOUT)? {
            let value = json_scalar(&value);
            parse_time(&value).map_err(|reason| invalid(keys::DEFAULT_TIMEOUT, &value, reason))?;
            timeouts.insert(name, value);
        }

        let mut options: BTreeMap<String, bool> = DEFAULT_OPTIONS
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        for (name, value) in view.json_map(keys::DEFAULT_OPTION)? {
            let raw = json_scalar(&value);
            let enabled =
                parse_bool(&raw).map_err(|reason| invalid(keys::DEFAULT_OPTION, &raw, reason))?;
            options.insert(name, enabled);
        }

        let replicas = view.number::<i32>(keys::REPLICAS)?.unwrap_or(1);
        if replicas < 0 {
            return Err(invalid(keys::REPLICAS, &replicas.to_string(), "must not be negative"));
        }

        Ok(Self {
            lb_type: view.parsed(keys::LB_TYPE)?.unwrap_or_default(),
            replicas,
            load_balancer_ip: view.string(keys::LOAD_BALANCER_IP),
            keep_source_ip: view.flag(keys::KEEP_SOURCE_IP)?.unwrap_or(false),
            health_check_node_port: view.port(keys::HEALTH_CHECK_NODE_PORT)?,
            node_selector: view.string_map(keys::NODE_SELECTOR)?,
            stats,
            accept_proxy: view.flag(keys::ACCEPT_PROXY)?.unwrap_or(false),
            ssl_redirect: view.flag(keys::SSL_REDIRECT)?.unwrap_or(true),
            force_ssl_redirect: view.flag(keys::FORCE_SSL_REDIRECT)?.unwrap_or(false),
            ssl_passthrough: view.flag(keys::SSL_PASSTHROUGH)?.unwrap_or(false),
            hsts,
            limit: RateLimit {
                rpm: view.number(keys::LIMIT_RPM)?,
                rps: view.number(keys::LIMIT_RPS)?,
                connections: view.number(keys::LIMIT_CONNECTION)?,
            },
            whitelist: view.cidrs(keys::WHITELIST)?,
            max_connections: view.number(keys::MAX_CONNECTIONS)?,
            proxy_body_size: view.number(keys::PROXY_BODY_SIZE)?,
            timeouts,
            options,
            error_files: view.line(keys::ERROR_FILES)?,
            basic_auth: view.basic_auth()?,
            tls_auth: view.tls_auth()?,
            service_annotations: view.string_map(keys::SERVICE_ANNOTATIONS)?,
            pod_annotations: view.string_map(keys::POD_ANNOTATIONS)?,
        })
    }
}

// =============================================================================
// Backend-scope policy
// =============================================================================

/// Policy for one backend, merged from Ingress and Service annotations
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BackendPolicy {
    pub sticky: Option<StickySession>,
    pub cors: Option<Cors>,
    pub basic_auth: Option<BasicAuthPolicy>,
    pub whitelist: Vec<IpNet>,
    pub max_connections: Option<u32>,
    pub check: Option<bool>,
    pub check_port: Option<i32>,
    pub agent: Option<AgentCheck>,
    pub backend_tls: Option<String>,
    pub send_proxy: Option<SendProxy>,
    pub dns_resolver: Option<DnsResolverPolicy>,
}

impl BackendPolicy {
    /// Merge the Ingress (global) and Service (local) annotation maps
    pub fn parse(
        global: &BTreeMap<String, String>,
        service: &BTreeMap<String, String>,
    ) -> Result<Self, CompileError> {
        let view = Layered::new(global, service);
        let local = Layered::global_only(service);

        let sticky = match view.string(keys::AFFINITY).as_deref() {
            None => None,
            Some("cookie") => Some(StickySession {
                cookie_name: view
                    .text(keys::SESSION_COOKIE_NAME)?
                    .unwrap_or_else(|| DEFAULT_SESSION_COOKIE.to_string()),
                hash: view.parsed(keys::SESSION_COOKIE_HASH)?,
            }),
            Some(other) => {
                return Err(invalid(keys::AFFINITY, other, "only 'cookie' affinity is supported"))
            }
        };

        let cors = if view.flag(keys::ENABLE_CORS)?.unwrap_or(false) {
            Some(Cors {
                allow_origin: view
                    .text(keys::CORS_ALLOW_ORIGIN)?
                    .unwrap_or_else(|| "*".to_string()),
                allow_methods: view
                    .text(keys::CORS_ALLOW_METHODS)?
                    .unwrap_or_else(|| DEFAULT_CORS_METHODS.to_string()),
                allow_headers: view
                    .text(keys::CORS_ALLOW_HEADERS)?
                    .unwrap_or_else(|| DEFAULT_CORS_HEADERS.to_string()),
                allow_credentials: view.flag(keys::CORS_ALLOW_CREDENTIALS)?.unwrap_or(true),
            })
        } else {
            None
        };

        // Listener-wide keys: the frontend already enforces the global value.
        let basic_auth = if global.contains_key(keys::AUTH_SECRET) {
            None
        } else {
            local.basic_auth()?
        };
        let whitelist = if global.contains_key(keys::WHITELIST) {
            Vec::new()
        } else {
            local.cidrs(keys::WHITELIST)?
        };

        let agent = match view.port(keys::AGENT_PORT)? {
            Some(port) => {
                let interval = view.string(keys::AGENT_INTERVAL);
                if let Some(i) = &interval {
                    parse_time(i).map_err(|reason| invalid(keys::AGENT_INTERVAL, i, reason))?;
                }
                Some(AgentCheck { port, interval })
            }
            None => None,
        };

        let dns_resolver = if view.flag(keys::USE_DNS_RESOLVER)?.unwrap_or(false) {
            let nameservers = view
                .list(keys::DNS_RESOLVER_NAMESERVERS)
                .into_iter()
                .map(|ns| {
                    if ns.contains(':') {
                        ns
                    } else {
                        format!("{}:53", ns)
                    }
                })
                .collect();
            let timeout = view.json_map(keys::DNS_RESOLVER_TIMEOUT)?;
            let hold = view.json_map(keys::DNS_RESOLVER_HOLD)?;
            Some(DnsResolverPolicy {
                nameservers,
                retries: view.number(keys::DNS_RESOLVER_RETRIES)?,
                timeout: checked_times(keys::DNS_RESOLVER_TIMEOUT, timeout)?,
                hold: checked_times(keys::DNS_RESOLVER_HOLD, hold)?,
            })
        } else {
            None
        };

        Ok(Self {
            sticky,
            cors,
            basic_auth,
            whitelist,
            max_connections: view.number(keys::MAX_CONNECTIONS)?,
            check: view.flag(keys::CHECK)?,
            check_port: view.port(keys::CHECK_PORT)?,
            agent,
            backend_tls: view.line(keys::BACKEND_TLS)?,
            send_proxy: view.parsed(keys::SEND_PROXY)?,
            dns_resolver,
        })
    }
}

/// Weight of a backing Pod from its `backend-weight` annotation
pub fn pod_weight(annotations: &BTreeMap<String, String>) -> Result<Option<u32>, CompileError> {
    let weight: Option<u32> = Layered::global_only(annotations).number(keys::BACKEND_WEIGHT)?;
    match weight {
        Some(w) if w > 256 => Err(invalid(
            keys::BACKEND_WEIGHT,
            &w.to_string(),
            "weight must be between 0 and 256",
        )),
        other => Ok(other),
    }
}

// =============================================================================
// Lookup and value parsing
// =============================================================================

/// Key-by-key view: global map first, then the local map
struct Layered<'a> {
    global: &'a BTreeMap<String, String>,
    local: Option<&'a BTreeMap<String, String>>,
}

impl<'a> Layered<'a> {
    fn new(global: &'a BTreeMap<String, String>, local: &'a BTreeMap<String, String>) -> Self {
        Self {
            global,
            local: Some(local),
        }
    }

    fn global_only(global: &'a BTreeMap<String, String>) -> Self {
        Self {
            global,
            local: None,
        }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.global
            .get(key)
            .or_else(|| self.local.and_then(|l| l.get(key)))
            .map(|v| v.trim())
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).map(str::to_string)
    }

    /// A value quoted into the config: no quotes, no line breaks
    fn text(&self, key: &str) -> Result<Option<String>, CompileError> {
        match self.string(key) {
            Some(v) if v.contains(|c: char| c == '"' || c.is_control()) => Err(invalid(
                key,
                &v,
                "must not contain quotes or control characters",
            )),
            other => Ok(other),
        }
    }

    /// A value spliced into a config line verbatim: no line breaks
    fn line(&self, key: &str) -> Result<Option<String>, CompileError> {
        match self.string(key) {
            Some(v) if v.contains(char::is_control) => {
                Err(invalid(key, &v, "must not contain control characters"))
            }
            other => Ok(other),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, CompileError> {
        self.get(key)
            .map(|v| parse_bool(v).map_err(|reason| invalid(key, v, reason)))
            .transpose()
    }

    fn number<T: FromStr>(&self, key: &str) -> Result<Option<T>, CompileError> {
        self.get(key)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|_| invalid(key, v, "expected a non-negative integer"))
            })
            .transpose()
    }

    fn port(&self, key: &str) -> Result<Option<i32>, CompileError> {
        match self.number::<i32>(key)? {
            Some(p) if !(1..=65535).contains(&p) => {
                Err(invalid(key, &p.to_string(), "port must be between 1 and 65535"))
            }
            other => Ok(other),
        }
    }

    fn parsed<T: FromStr<Err = String>>(&self, key: &str) -> Result<Option<T>, CompileError> {
        self.get(key)
            .map(|v| v.parse::<T>().map_err(|reason| invalid(key, v, reason)))
            .transpose()
    }

    fn json_map(&self, key: &str) -> Result<BTreeMap<String, serde_json::Value>, CompileError> {
        let Some(v) = self.get(key) else {
            return Ok(BTreeMap::new());
        };
        let map: BTreeMap<String, serde_json::Value> = serde_json::from_str(v)
            .map_err(|e| invalid(key, v, format!("expected a JSON object: {}", e)))?;
        if map.keys().any(|k| k.contains(char::is_control)) {
            return Err(invalid(key, v, "keys must not contain control characters"));
        }
        Ok(map)
    }

    fn string_map(&self, key: &str) -> Result<BTreeMap<String, String>, CompileError> {
        Ok(self
            .json_map(key)?
            .into_iter()
            .map(|(k, v)| (k, json_scalar(&v)))
            .collect())
    }

    fn cidrs(&self, key: &str) -> Result<Vec<IpNet>, CompileError> {
        self.list(key)
            .iter()
            .map(|s| parse_cidr(s).map_err(|reason| invalid(key, s, reason)))
            .collect()
    }

    fn basic_auth(&self) -> Result<Option<BasicAuthPolicy>, CompileError> {
        let Some(secret) = self.string(keys::AUTH_SECRET) else {
            return Ok(None);
        };
        match self.get(keys::AUTH_TYPE) {
            None | Some("basic") => {}
            Some(other) => {
                return Err(invalid(keys::AUTH_TYPE, other, "only 'basic' auth is supported"))
            }
        }
        Ok(Some(BasicAuthPolicy {
            realm: self
                .text(keys::AUTH_REALM)?
                .unwrap_or_else(|| DEFAULT_AUTH_REALM.to_string()),
            secrets: secret
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }))
    }

    fn tls_auth(&self) -> Result<Option<TlsAuthPolicy>, CompileError> {
        let Some(secret) = self.string(keys::AUTH_TLS_SECRET) else {
            return Ok(None);
        };
        let verify = match self.get(keys::AUTH_TLS_VERIFY_CLIENT) {
            None | Some("required") => TlsVerifyMode::Required,
            Some("optional") => TlsVerifyMode::Optional,
            Some(other) => {
                return Err(invalid(
                    keys::AUTH_TLS_VERIFY_CLIENT,
                    other,
                    "expected 'required' or 'optional'",
                ))
            }
        };
        Ok(Some(TlsAuthPolicy {
            secret,
            verify,
            error_page: self.text(keys::AUTH_TLS_ERROR_PAGE)?,
        }))
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> CompileError {
    CompileError::InvalidAnnotation {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn json_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn checked_times(
    key: &str,
    map: BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, String>, CompileError> {
    map.into_iter()
        .map(|(name, v)| {
            let value = json_scalar(&v);
            parse_time(&value).map_err(|reason| invalid(key, &value, reason))?;
            Ok((name, value))
        })
        .collect()
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err("expected 'true' or 'false'".to_string()),
    }
}

/// Validate an HAProxy time value: digits with an optional `us|ms|s|m|h|d` unit
pub fn parse_time(value: &str) -> Result<(), String> {
    let digits = value.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return Err("time must start with a number".to_string());
    }
    match &value[digits..] {
        "" | "us" | "ms" | "s" | "m" | "h" | "d" => Ok(()),
        unit => Err(format!("unknown time unit '{}'", unit)),
    }
}

/// Parse a CIDR, accepting a bare address as a host route
pub fn parse_cidr(value: &str) -> Result<IpNet, String> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    value
        .parse::<std::net::IpAddr>()
        .map(IpNet::from)
        .map_err(|_| format!("'{}' is not an IP address or CIDR", value))
}
