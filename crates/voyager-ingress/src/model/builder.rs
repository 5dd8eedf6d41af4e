//! Routing model builder
//!
//! Walks one Ingress against its resolved inputs and settles every routing
//! decision: listener grouping, TLS termination, route precedence,
//! HTTP-to-HTTPS redirects, authentication and backend servers.
//!
//! Route precedence within a listener is "most specific, most explicit wins":
//! exact hosts before wildcards before the match-all host, longer wildcard
//! suffixes first, then longer paths first, then declaration order.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Secret, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::debug;

use voyager_common::crd::{
    HttpIngressRuleValue, Ingress, IngressBackend, PortRef, TcpIngressRuleValue, TlsVerifyMode,
};
use voyager_common::kube_utils::deterministic_hash;

use super::{
    AuthRef, Backend, CertBundle, DefaultOption, Defaults, ErrorFile, HostClass, HostPattern,
    Listener, ListenerKey, Mode, NamedValue, Redirect, Resolver, Route, RoutingModel, Server,
    Stats, User, Userlist, ANY_ADDRESS, ERROR_FILES_MOUNT_PATH,
};
use crate::annotations::{self, BackendPolicy, CookieHash, DnsResolverPolicy, IngressPolicy};
use crate::compiler::{service_target, CompileError, ResolvedInputs};
use crate::naming::{self, NameResolver};

const HOST_CAPTURE: &str = "http-request set-var(txn.host) hdr(host),field(1,:),lower";

/// Which sample fetch identifies the requested host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HostFetch {
    /// `Host` header captured into `txn.host`
    Header,
    /// SNI from the ClientHello, connection not terminated
    Sni,
    /// SNI of a terminated TLS connection
    TerminatedSni,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Http,
    Tcp,
}

#[derive(Clone, Debug)]
struct ClientAuth {
    bind: String,
    http_rules: Vec<String>,
}

struct TlsBinding {
    secret: String,
    hosts: Vec<HostPattern>,
}

struct DraftRoute {
    host: HostPattern,
    path: String,
    backend: String,
    order: usize,
}

/// Listener being assembled from one or more rules
struct Draft {
    origin: Origin,
    mode: Mode,
    node_port: Option<i32>,
    certs: Vec<String>,
    alpn: Vec<String>,
    proto: Option<String>,
    routes: Vec<DraftRoute>,
    catch_all: Option<String>,
    redirects: Vec<(HostPattern, String)>,
    frontend_rules: Vec<String>,
    basic_auth: Option<AuthRef>,
    frontend_auth: bool,
    client_auth: Option<ClientAuth>,
}

impl Draft {
    fn new(origin: Origin, mode: Mode) -> Self {
        Self {
            origin,
            mode,
            node_port: None,
            certs: Vec::new(),
            alpn: Vec::new(),
            proto: None,
            routes: Vec::new(),
            catch_all: None,
            redirects: Vec::new(),
            frontend_rules: Vec::new(),
            basic_auth: None,
            frontend_auth: false,
            client_auth: None,
        }
    }

    fn bind_options(
        &mut self,
        node_port: Option<i32>,
        cert: Option<String>,
        alpn: &[String],
        proto: &Option<String>,
    ) {
        if self.node_port.is_none() {
            self.node_port = node_port;
        }
        if let Some(cert) = cert {
            if !self.certs.contains(&cert) {
                self.certs.push(cert);
            }
        }
        for a in alpn {
            if !self.alpn.contains(a) {
                self.alpn.push(a.clone());
            }
        }
        if self.proto.is_none() {
            self.proto = proto.clone();
        }
    }
}

/// Server before its parameters are rendered
struct Endpoint {
    name: String,
    address: String,
    port: i32,
    weight: Option<u32>,
}

/// Builds a [`RoutingModel`] and the certificate files it references
pub struct ModelBuilder<'a> {
    ingress: &'a Ingress,
    namespace: &'a str,
    inputs: &'a ResolvedInputs,
    policy: &'a IngressPolicy,
    bindings: Vec<TlsBinding>,
    names: NameResolver,
    listeners: BTreeMap<ListenerKey, Draft>,
    certs: CertBundle,
    userlists: BTreeMap<String, Userlist>,
    resolvers: BTreeMap<String, Resolver>,
    order: usize,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(
        ingress: &'a Ingress,
        namespace: &'a str,
        inputs: &'a ResolvedInputs,
        policy: &'a IngressPolicy,
    ) -> Self {
        let bindings = ingress
            .spec
            .tls
            .iter()
            .filter_map(|tls| {
                tls.secret().map(|secret| TlsBinding {
                    secret,
                    hosts: tls.hosts.iter().map(|h| HostPattern::new(h)).collect(),
                })
            })
            .collect();
        Self {
            ingress,
            namespace,
            inputs,
            policy,
            bindings,
            names: NameResolver::new(),
            listeners: BTreeMap::new(),
            certs: CertBundle::default(),
            userlists: BTreeMap::new(),
            resolvers: BTreeMap::new(),
            order: 0,
        }
    }

    pub fn build(mut self) -> Result<(RoutingModel, CertBundle), CompileError> {
        let ingress = self.ingress;

        let default_backend = match &ingress.spec.backend {
            Some(be) => Some(self.resolve_backend(be, Mode::Http)?),
            None => None,
        };
        for rule in &ingress.spec.rules {
            if let Some(http) = &rule.http {
                self.add_http_rule(&rule.host, http)?;
            } else if let Some(tcp) = &rule.tcp {
                self.add_tcp_rule(&rule.host, tcp)?;
            }
        }
        if default_backend.is_some() {
            self.ensure_default_listener();
        }

        self.synthesize_redirects();
        self.apply_frontend_rules()?;
        self.apply_global_auth()?;
        self.shield_backends(default_backend.as_deref());

        let defaults = self.defaults()?;
        let stats = self.stats()?;
        let listeners = std::mem::take(&mut self.listeners);
        let frontends: Vec<Listener> = listeners
            .into_iter()
            .map(|(key, draft)| self.finish_listener(key, draft, default_backend.as_deref()))
            .collect();

        let Self {
            names,
            certs,
            userlists,
            resolvers,
            ..
        } = self;
        let mut backends = names.into_sections();
        let default_backend = default_backend.and_then(|name| {
            backends
                .iter()
                .position(|b| b.name == name)
                .map(|i| backends.remove(i))
        });

        debug!(
            frontends = frontends.len(),
            backends = backends.len(),
            certificates = certs.files.len(),
            "built routing model"
        );

        Ok((
            RoutingModel {
                defaults,
                userlists: userlists.into_values().collect(),
                resolvers: resolvers.into_values().collect(),
                stats,
                frontends,
                default_backend,
                backends,
            },
            certs,
        ))
    }

    // =========================================================================
    // Rules and listeners
    // =========================================================================

    fn next_order(&mut self) -> usize {
        self.order += 1;
        self.order
    }

    fn listener(
        &mut self,
        key: ListenerKey,
        origin: Origin,
        mode: Mode,
    ) -> Result<&mut Draft, CompileError> {
        let address = key.address.clone();
        let port = key.port;
        let draft = self
            .listeners
            .entry(key)
            .or_insert_with(|| Draft::new(origin, mode));
        if draft.origin != origin {
            return Err(CompileError::ListenerConflict {
                address,
                port,
                reason: "HTTP and TCP rules cannot share a listener".to_string(),
            });
        }
        Ok(draft)
    }

    /// Secret of the TLS entry covering `host`, most specific entry first
    fn binding_for(&self, host: &HostPattern) -> Option<String> {
        if host.class() == HostClass::Any {
            return None;
        }
        if let Some(binding) = self.bindings.iter().find(|b| b.hosts.contains(host)) {
            return Some(binding.secret.clone());
        }
        let mut best: Option<(usize, &TlsBinding)> = None;
        for binding in &self.bindings {
            for pattern in binding.hosts.iter().filter(|h| h.covers(host.as_str())) {
                let len = pattern.wildcard_suffix().map(str::len).unwrap_or(0);
                if best.map_or(true, |(best_len, _)| len > best_len) {
                    best = Some((len, binding));
                }
            }
        }
        best.map(|(_, b)| b.secret.clone())
    }

    fn add_http_rule(&mut self, host: &str, http: &HttpIngressRuleValue) -> Result<(), CompileError> {
        let host = HostPattern::new(host);
        let passthrough = self.policy.ssl_passthrough;
        let mode = if passthrough { Mode::Tcp } else { Mode::Http };
        let secret = if http.no_tls {
            None
        } else {
            self.binding_for(&host)
        };
        let port = http
            .port
            .unwrap_or(if secret.is_some() { 443 } else { 80 });
        let key = ListenerKey {
            address: bind_address(&http.address),
            port,
        };
        let cert = match secret {
            Some(s) if !passthrough => Some(self.certificate(&s)?),
            _ => None,
        };

        let mut routes = Vec::with_capacity(http.paths.len());
        for path in &http.paths {
            let backend = self.resolve_backend(&path.backend, mode)?;
            let path = if passthrough {
                String::new()
            } else {
                path.path.clone()
            };
            let order = self.next_order();
            routes.push(DraftRoute {
                host: host.clone(),
                path,
                backend,
                order,
            });
        }

        let draft = self.listener(key, Origin::Http, mode)?;
        draft.bind_options(http.node_port, cert, &http.alpn, &http.proto);
        for route in routes {
            // SNI dispatch has no paths; the first rule for a host wins
            if passthrough && draft.routes.iter().any(|r| r.host == route.host) {
                continue;
            }
            draft.routes.push(route);
        }
        Ok(())
    }

    fn add_tcp_rule(&mut self, host: &str, tcp: &TcpIngressRuleValue) -> Result<(), CompileError> {
        let host = HostPattern::new(host);
        let secret = if tcp.no_tls || self.policy.ssl_passthrough {
            None
        } else {
            self.binding_for(&host)
        };
        let key = ListenerKey {
            address: bind_address(&tcp.address),
            port: tcp.port,
        };
        let cert = match secret {
            Some(s) => Some(self.certificate(&s)?),
            None => None,
        };
        let backend = self.resolve_backend(&tcp.backend, Mode::Tcp)?;
        let order = self.next_order();

        let (address, port) = (key.address.clone(), key.port);
        let draft = self.listener(key, Origin::Tcp, Mode::Tcp)?;
        draft.bind_options(tcp.node_port, cert, &tcp.alpn, &tcp.proto);
        if host.class() == HostClass::Any {
            if draft.catch_all.is_some() {
                return Err(CompileError::ListenerConflict {
                    address,
                    port,
                    reason: "more than one TCP rule without a host".to_string(),
                });
            }
            draft.catch_all = Some(backend);
        } else {
            draft.routes.push(DraftRoute {
                host,
                path: String::new(),
                backend,
                order,
            });
        }
        Ok(())
    }

    /// Plaintext redirects for every TLS-covered host/path on port 443.
    ///
    /// A default backend needs somewhere to be served from; without any HTTP
    /// rule it gets the plaintext listener on port 80.
    fn ensure_default_listener(&mut self) {
        if self.listeners.values().any(|d| d.origin == Origin::Http) {
            return;
        }
        let key = ListenerKey {
            address: ANY_ADDRESS.to_string(),
            port: 80,
        };
        if !self.listeners.contains_key(&key) {
            self.listeners.insert(key, Draft::new(Origin::Http, Mode::Http));
        }
    }

    /// A host/path the user also declared on the plaintext listener is left
    /// alone, and a synthesized redirect never captures a longer user path.
    fn synthesize_redirects(&mut self) {
        if !self.policy.ssl_redirect || self.policy.ssl_passthrough {
            return;
        }
        let covered: Vec<(String, HostPattern, String)> = self
            .listeners
            .iter()
            .filter(|(k, d)| k.port == 443 && d.mode == Mode::Http && !d.certs.is_empty())
            .flat_map(|(k, d)| {
                d.routes
                    .iter()
                    .filter(|r| r.host.class() != HostClass::Any)
                    .map(move |r| (k.address.clone(), r.host.clone(), r.path.clone()))
            })
            .collect();

        for (address, host, path) in covered {
            let draft = self
                .listeners
                .entry(ListenerKey { address, port: 80 })
                .or_insert_with(|| Draft::new(Origin::Http, Mode::Http));
            if draft.origin != Origin::Http || draft.mode != Mode::Http || !draft.certs.is_empty() {
                continue;
            }
            let served = draft.routes.iter().any(|r| r.host == host && r.path == path);
            let pending = draft.redirects.iter().any(|(h, p)| *h == host && *p == path);
            if !served && !pending {
                draft.redirects.push((host, path));
            }
        }
    }

    fn apply_frontend_rules(&mut self) -> Result<(), CompileError> {
        let ingress = self.ingress;
        let namespace = self.namespace;
        for rule in &ingress.spec.frontend_rules {
            let keys: Vec<ListenerKey> = self
                .listeners
                .keys()
                .filter(|k| k.port == rule.port)
                .cloned()
                .collect();
            if keys.is_empty() {
                return Err(CompileError::FrontendRuleWithoutListener { port: rule.port });
            }

            let auth = rule.auth.as_ref();
            let basic = match auth.and_then(|a| a.basic.as_ref()) {
                Some(basic) => Some(AuthRef {
                    userlist: self.userlist(namespace, &basic.secrets())?,
                    realm: realm(basic.realm.as_deref()),
                }),
                None => None,
            };
            let client = match auth.and_then(|a| a.tls.as_ref()) {
                Some(tls) => Some(self.client_auth(
                    &tls.secret_name,
                    tls.verify_client,
                    tls.error_page.as_deref(),
                    &tls.headers,
                )?),
                None => None,
            };

            for key in keys {
                if let Some(draft) = self.listeners.get_mut(&key) {
                    draft.frontend_rules.extend(rule.rules.iter().cloned());
                    if let Some(basic) = &basic {
                        draft.basic_auth = Some(basic.clone());
                        draft.frontend_auth = true;
                    }
                    if let Some(client) = &client {
                        draft.client_auth = Some(client.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Annotation auth for listeners without a FrontendRule of their own
    fn apply_global_auth(&mut self) -> Result<(), CompileError> {
        let policy = self.policy;
        let namespace = self.namespace;
        let basic = match &policy.basic_auth {
            Some(auth) => Some(AuthRef {
                userlist: self.userlist(namespace, &auth.secrets)?,
                realm: realm(Some(&auth.realm)),
            }),
            None => None,
        };
        let client = match &policy.tls_auth {
            Some(tls) => Some(self.client_auth(
                &tls.secret,
                tls.verify,
                tls.error_page.as_deref(),
                &BTreeMap::new(),
            )?),
            None => None,
        };
        for draft in self.listeners.values_mut() {
            if draft.basic_auth.is_none() {
                draft.basic_auth = basic.clone();
            }
            if draft.client_auth.is_none() {
                draft.client_auth = client.clone();
            }
        }
        Ok(())
    }

    /// Drop Service auth from backends reachable only through listeners that
    /// carry FrontendRule basic auth
    fn shield_backends(&mut self, default_backend: Option<&str>) {
        let mut shielded = BTreeSet::new();
        let mut exposed = BTreeSet::new();
        for draft in self.listeners.values().filter(|d| d.mode == Mode::Http) {
            let target = if draft.frontend_auth {
                &mut shielded
            } else {
                &mut exposed
            };
            target.extend(draft.routes.iter().map(|r| r.backend.clone()));
            target.extend(default_backend.map(str::to_string));
        }
        for name in shielded.difference(&exposed) {
            if let Some(backend) = self.names.section_mut(name) {
                backend.auth = None;
            }
        }
    }

    fn finish_listener(
        &self,
        key: ListenerKey,
        draft: Draft,
        default_backend: Option<&str>,
    ) -> Listener {
        let policy = self.policy;
        let terminating = !draft.certs.is_empty();
        let http = draft.mode == Mode::Http;

        let mut bind = format!("{}:{}", key.address, key.port);
        if terminating {
            bind.push_str(" ssl");
            for cert in &draft.certs {
                bind.push_str(&format!(" crt {}", cert));
            }
            if let Some(client) = &draft.client_auth {
                bind.push_str(&client.bind);
            }
            if !draft.alpn.is_empty() {
                bind.push_str(&format!(" alpn {}", draft.alpn.join(",")));
            }
        }
        if let Some(proto) = &draft.proto {
            bind.push_str(&format!(" proto {}", proto));
        }
        if policy.accept_proxy {
            bind.push_str(" accept-proxy");
        }

        let mut http_rules = Vec::new();
        if http {
            http_rules.push(HOST_CAPTURE.to_string());
            if let Some(limit) = policy.proxy_body_size {
                http_rules.push(format!(
                    "http-request deny deny_status 413 if {{ req.hdr_val(content-length) gt {} }}",
                    limit
                ));
            }
            if terminating {
                if let Some(client) = &draft.client_auth {
                    http_rules.extend(client.http_rules.iter().cloned());
                }
                if let Some(hsts) = &policy.hsts {
                    http_rules.push(format!(
                        "http-response set-header Strict-Transport-Security \"{}\"",
                        hsts.header_value()
                    ));
                }
            } else if policy.force_ssl_redirect {
                http_rules.push(
                    "http-request redirect scheme https code 308 if { hdr(X-Forwarded-Proto) http }"
                        .to_string(),
                );
            }
        }

        let mut redirects: Vec<Redirect> = draft
            .redirects
            .iter()
            .map(|(host, path)| redirect(host, path, &draft.routes))
            .collect();
        redirects.sort_by(|a, b| {
            HostPattern::new(&a.host)
                .rank()
                .cmp(&HostPattern::new(&b.host).rank())
                .then(b.path.len().cmp(&a.path.len()))
        });

        let fetch = match (http, terminating) {
            (true, _) => HostFetch::Header,
            (false, true) => HostFetch::TerminatedSni,
            (false, false) => HostFetch::Sni,
        };
        let (mut routes, catch_all) = ordered_routes(draft.routes, fetch);
        let mut default = draft.catch_all.or(catch_all);
        if default.is_none() && http {
            default = default_backend.map(str::to_string);
        }
        if !http && default.is_none() && routes.len() == 1 {
            default = routes.pop().map(|r| r.backend);
        }

        let prefix = match draft.origin {
            Origin::Http => "http",
            Origin::Tcp => "tcp",
        };
        Listener {
            name: naming::frontend_name(prefix, &key),
            sni_inspect: !http && !terminating && !routes.is_empty(),
            access_rules: self.access_rules(draft.mode),
            auth: if http { draft.basic_auth } else { None },
            address: key.address,
            port: key.port,
            mode: draft.mode,
            node_port: draft.node_port,
            bind,
            max_connections: policy.max_connections,
            http_rules,
            frontend_rules: draft.frontend_rules,
            redirects,
            routes,
            default_backend: default,
        }
    }

    /// Whitelist and rate-limit rules evaluated before routing
    fn access_rules(&self, mode: Mode) -> Vec<String> {
        let policy = self.policy;
        let mut rules = Vec::new();
        if !policy.whitelist.is_empty() {
            rules.push(format!(
                "tcp-request connection reject if !{{ src {} }}",
                cidr_list(&policy.whitelist)
            ));
        }

        let limit = &policy.limit;
        if limit.is_empty() {
            return rules;
        }
        let rate = match mode {
            Mode::Http => limit
                .rps
                .map(|n| ("1s", n))
                .or_else(|| limit.rpm.map(|n| ("1m", n))),
            Mode::Tcp => None,
        };
        let mut stores = Vec::new();
        if let Some((period, _)) = rate {
            stores.push(format!("http_req_rate({})", period));
        }
        if limit.connections.is_some() {
            stores.push("conn_cur".to_string());
        }
        if stores.is_empty() {
            return rules;
        }

        let expire = match rate {
            Some(("1m", _)) => "1m",
            _ => "10s",
        };
        rules.push(format!(
            "stick-table type ip size 100k expire {} store {}",
            expire,
            stores.join(",")
        ));
        rules.push("tcp-request connection track-sc0 src".to_string());
        if let Some(n) = limit.connections {
            rules.push(format!(
                "tcp-request connection reject if {{ sc_conn_cur(0) gt {} }}",
                n
            ));
        }
        if let Some((_, n)) = rate {
            rules.push(format!(
                "http-request deny deny_status 429 if {{ sc_http_req_rate(0) gt {} }}",
                n
            ));
        }
        rules
    }

    // =========================================================================
    // Backends
    // =========================================================================

    fn resolve_backend(&mut self, be: &IngressBackend, mode: Mode) -> Result<String, CompileError> {
        let (svc_name, svc_ns) = service_target(&be.service_name, self.namespace);
        let inputs = self.inputs;
        let service = inputs
            .service(svc_ns, svc_name)
            .ok_or_else(|| CompileError::MissingReference {
                kind: "Service",
                name: format!("{}/{}", svc_ns, svc_name),
            })?;
        let policy = BackendPolicy::parse(self.ingress.annotations(), service.annotations())?;

        let spec = service.spec.as_ref();
        let service_port = spec
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| match &be.service_port {
                PortRef::Number(n) => ports.iter().find(|p| p.port == *n),
                PortRef::Name(name) => ports.iter().find(|p| p.name.as_deref() == Some(name.as_str())),
            });
        let external = spec
            .filter(|s| s.type_.as_deref() == Some("ExternalName"))
            .and_then(|s| s.external_name.clone());

        let port = match (service_port, &be.service_port, &external) {
            (Some(sp), _, _) => sp.port,
            (None, PortRef::Number(n), Some(_)) => *n,
            _ => {
                return Err(CompileError::PortNotFound {
                    backend: be
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("{}:{}", be.service_name, be.service_port)),
                    service: format!("{}/{}", svc_ns, svc_name),
                    port: be.service_port.to_string(),
                })
            }
        };

        let mut backend = Backend {
            name: String::new(),
            mode,
            balance: be.load_balance_on.clone(),
            backend_rules: be.backend_rules.clone(),
            sticky_cookie: None,
            http_rules: Vec::new(),
            auth: None,
            cors: None,
            servers: Vec::new(),
        };
        let check = policy.check.unwrap_or(false) || backend.has_httpchk();

        if !policy.whitelist.is_empty() {
            let src = cidr_list(&policy.whitelist);
            backend.http_rules.push(match mode {
                Mode::Http => format!("http-request deny if !{{ src {} }}", src),
                Mode::Tcp => format!("tcp-request content reject if !{{ src {} }}", src),
            });
        }
        if mode == Mode::Http {
            backend.sticky_cookie = policy.sticky.as_ref().map(|s| s.cookie_name.clone());
            if let Some(auth) = &policy.basic_auth {
                backend.auth = Some(AuthRef {
                    userlist: self.userlist(svc_ns, &auth.secrets)?,
                    realm: realm(Some(&auth.realm)),
                });
            }
            for rule in &be.header_rules {
                backend.http_rules.push(format!("http-request set-header {}", rule));
            }
            for rule in &be.rewrite_rules {
                backend.http_rules.push(format!("http-request replace-path {}", rule));
            }
            backend.cors = policy.cors.clone();
        }

        let resolver = match (&external, &policy.dns_resolver) {
            (Some(_), Some(dns)) => Some(self.resolver(dns)),
            _ => None,
        };
        let endpoints = match (&external, service_port) {
            (Some(host), _) => {
                if resolver.is_none() && mode == Mode::Http && be.backend_rules.is_empty() {
                    backend.http_rules.push(format!(
                        "http-request redirect location {} code 301",
                        external_location(host, port)
                    ));
                    Vec::new()
                } else {
                    vec![Endpoint {
                        name: "external".to_string(),
                        address: host.clone(),
                        port,
                        weight: None,
                    }]
                }
            }
            (None, Some(sp)) => self.endpoint_servers(svc_ns, svc_name, sp, be)?,
            (None, None) => Vec::new(),
        };
        backend.servers = servers(endpoints, &policy, be, check, resolver.as_deref());

        self.names.register(
            be.name.as_deref(),
            naming::backend_name(svc_name, svc_ns, port),
            backend,
        )
    }

    /// Ready endpoints of a Service port, sorted by server name
    fn endpoint_servers(
        &self,
        namespace: &str,
        service: &str,
        port: &ServicePort,
        be: &IngressBackend,
    ) -> Result<Vec<Endpoint>, CompileError> {
        let Some(endpoints) = self.inputs.endpoints(namespace, service) else {
            return Ok(Vec::new());
        };
        let target_number = match &port.target_port {
            Some(IntOrString::Int(n)) => Some(*n),
            Some(IntOrString::String(_)) => None,
            None => Some(port.port),
        };

        let mut out: BTreeMap<String, Endpoint> = BTreeMap::new();
        for subset in endpoints.subsets.iter().flatten() {
            let ports = subset.ports.as_deref().unwrap_or(&[]);
            let matched = match port.name.as_deref().filter(|n| !n.is_empty()) {
                Some(name) => ports.iter().find(|p| p.name.as_deref() == Some(name)),
                None if ports.len() == 1 => ports.first(),
                None => ports.iter().find(|p| Some(p.port) == target_number),
            };
            let Some(endpoint_port) = matched else {
                continue;
            };

            for address in subset.addresses.iter().flatten() {
                let pod = address
                    .target_ref
                    .as_ref()
                    .filter(|r| r.kind.as_deref() == Some("Pod"))
                    .and_then(|r| r.name.clone());
                let ident = pod.clone().or_else(|| address.hostname.clone());
                if !be.host_names.is_empty() {
                    let selected = ident.as_deref().is_some_and(|i| {
                        be.host_names.iter().any(|h| i.starts_with(h.as_str()))
                    });
                    if !selected {
                        continue;
                    }
                }

                let weight = match pod.as_deref().and_then(|p| self.inputs.pod(namespace, p)) {
                    Some(pod) => annotations::pod_weight(pod.annotations())?,
                    None => None,
                };
                let name = match &ident {
                    Some(i) => format!("pod-{}", i),
                    None => format!("ep-{}", address.ip.replace(['.', ':'], "-")),
                };
                out.entry(name.clone()).or_insert(Endpoint {
                    name,
                    address: address.ip.clone(),
                    port: endpoint_port.port,
                    weight,
                });
            }
        }
        Ok(out.into_values().collect())
    }

    fn resolver(&mut self, dns: &DnsResolverPolicy) -> String {
        let digest = deterministic_hash(&format!("{:?}", dns));
        let name = format!("dns-{}", digest.get(..8).unwrap_or(&digest));
        self.resolvers.entry(name.clone()).or_insert_with(|| Resolver {
            name: name.clone(),
            nameservers: dns
                .nameservers
                .iter()
                .enumerate()
                .map(|(i, ns)| NamedValue {
                    name: format!("ns{}", i + 1),
                    value: ns.clone(),
                })
                .collect(),
            parse_resolv_conf: dns.nameservers.is_empty(),
            retries: dns.retries,
            timeouts: named_values(&dns.timeout),
            holds: named_values(&dns.hold),
        });
        name
    }

    // =========================================================================
    // Secrets
    // =========================================================================

    fn secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>, CompileError> {
        let secret = self
            .inputs
            .secret(namespace, name)
            .ok_or_else(|| CompileError::MissingReference {
                kind: "Secret",
                name: format!("{}/{}", namespace, name),
            })?;
        secret_strings(secret, &format!("{}/{}", namespace, name))
    }

    /// Add a serving certificate to the bundle; returns its mounted path
    fn certificate(&mut self, secret: &str) -> Result<String, CompileError> {
        let data = self.secret_data(self.namespace, secret)?;
        let qualified = format!("{}/{}", self.namespace, secret);
        let crt = required_key(&data, &qualified, "tls.crt")?;
        let key = required_key(&data, &qualified, "tls.key")?;
        let pem = format!("{}\n{}\n", crt.trim_end(), key.trim_end());
        Ok(self
            .certs
            .add(format!("tls.{}.pem", secret), format!("tls/{}.pem", secret), pem))
    }

    fn client_auth(
        &mut self,
        secret: &str,
        verify: TlsVerifyMode,
        error_page: Option<&str>,
        headers: &BTreeMap<String, String>,
    ) -> Result<ClientAuth, CompileError> {
        let data = self.secret_data(self.namespace, secret)?;
        let qualified = format!("{}/{}", self.namespace, secret);
        let ca = required_key(&data, &qualified, "ca.crt")?;
        let ca_path = self
            .certs
            .add(format!("ca.{}.crt", secret), format!("ca/{}.crt", secret), ca.to_string());

        // An error page can only be served if the handshake succeeds
        let effective = if error_page.is_some() {
            TlsVerifyMode::Optional
        } else {
            verify
        };
        let mut bind = format!(" ca-file {} verify {}", ca_path, effective);
        if let Some(crl) = data.get("crl.pem") {
            let crl_path = self.certs.add(
                format!("crl.{}.pem", secret),
                format!("ca/{}-crl.pem", secret),
                crl.clone(),
            );
            bind.push_str(&format!(" crl-file {}", crl_path));
        }

        let mut http_rules = Vec::new();
        if let Some(page) = error_page {
            let condition = match verify {
                TlsVerifyMode::Required => "!{ ssl_c_used } || !{ ssl_c_verify 0 }",
                TlsVerifyMode::Optional => "{ ssl_c_used } !{ ssl_c_verify 0 }",
            };
            http_rules.push(format!(
                "http-request redirect location {} code 302 if {}",
                page, condition
            ));
        }
        for (name, expr) in headers {
            http_rules.push(format!("http-request set-header {} %[{}]", name, expr));
        }
        Ok(ClientAuth { bind, http_rules })
    }

    /// Register the userlist for a set of credential Secrets; returns its name
    fn userlist(&mut self, namespace: &str, secrets: &[String]) -> Result<String, CompileError> {
        let name = naming::userlist_name(namespace, secrets);
        if self.userlists.contains_key(&name) {
            return Ok(name);
        }

        let mut users: Vec<User> = Vec::new();
        for secret in secrets {
            let qualified = format!("{}/{}", namespace, secret);
            let data = self.secret_data(namespace, secret)?;
            for value in data.values() {
                for line in value
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                {
                    let user = parse_user(line).ok_or_else(|| CompileError::InvalidSecret {
                        secret: qualified.clone(),
                        reason: "expected 'user:hash' or 'user::password' lines".to_string(),
                    })?;
                    if !users.iter().any(|u| u.name == user.name) {
                        users.push(user);
                    }
                }
            }
        }
        if users.is_empty() {
            return Err(CompileError::InvalidSecret {
                secret: secrets.join(","),
                reason: "no credentials found".to_string(),
            });
        }

        self.userlists.insert(
            name.clone(),
            Userlist {
                name: name.clone(),
                users,
            },
        );
        Ok(name)
    }

    // =========================================================================
    // Global sections
    // =========================================================================

    fn defaults(&self) -> Result<Defaults, CompileError> {
        Ok(Defaults {
            options: self
                .policy
                .options
                .iter()
                .map(|(name, enabled)| DefaultOption {
                    name: name.clone(),
                    enabled: *enabled,
                })
                .collect(),
            timeouts: named_values(&self.policy.timeouts),
            error_files: self.error_files()?,
        })
    }

    fn error_files(&self) -> Result<Vec<ErrorFile>, CompileError> {
        let Some(name) = &self.policy.error_files else {
            return Ok(Vec::new());
        };
        let qualified = format!("{}/{}", self.namespace, name);
        let config_map = self
            .inputs
            .config_map(self.namespace, name)
            .ok_or_else(|| CompileError::MissingReference {
                kind: "ConfigMap",
                name: qualified.clone(),
            })?;

        let mut files = Vec::new();
        for (key, value) in config_map.data.iter().flatten() {
            let invalid = || CompileError::InvalidErrorFile {
                config_map: qualified.clone(),
                key: key.clone(),
            };
            let (code, ext) = key.split_once('.').ok_or_else(invalid)?;
            if code.len() != 3 || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            let (command, value) = match ext {
                "http" => ("errorfile", format!("{}/{}", ERROR_FILES_MOUNT_PATH, key)),
                "errorloc" | "errorloc302" | "errorloc303" => (ext, value.trim().to_string()),
                _ => return Err(invalid()),
            };
            files.push(ErrorFile {
                code: code.to_string(),
                command: command.to_string(),
                value,
            });
        }
        Ok(files)
    }

    fn stats(&self) -> Result<Option<Stats>, CompileError> {
        let Some(stats) = &self.policy.stats else {
            return Ok(None);
        };
        let (username, password) = match &stats.secret {
            Some(secret) => {
                let qualified = format!("{}/{}", self.namespace, secret);
                let data = self.secret_data(self.namespace, secret)?;
                (
                    Some(required_key(&data, &qualified, "username")?.to_string()),
                    Some(required_key(&data, &qualified, "password")?.to_string()),
                )
            }
            None => (None, None),
        };
        Ok(Some(Stats {
            port: stats.port,
            username,
            password,
        }))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn bind_address(address: &Option<String>) -> String {
    address
        .as_deref()
        .filter(|a| !a.is_empty())
        .unwrap_or(ANY_ADDRESS)
        .to_string()
}

fn realm(realm: Option<&str>) -> String {
    realm
        .filter(|r| !r.is_empty())
        .unwrap_or(annotations::DEFAULT_AUTH_REALM)
        .replace('"', "'")
}

fn cidr_list(nets: &[ipnet::IpNet]) -> String {
    nets.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn named_values(map: &BTreeMap<String, String>) -> Vec<NamedValue> {
    map.iter()
        .map(|(name, value)| NamedValue {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn external_location(host: &str, port: i32) -> String {
    match port {
        80 => format!("http://{}", host),
        443 => format!("https://{}", host),
        _ => format!("http://{}:{}", host, port),
    }
}

fn secret_strings(secret: &Secret, qualified: &str) -> Result<BTreeMap<String, String>, CompileError> {
    let mut out = BTreeMap::new();
    for (key, value) in secret.data.iter().flatten() {
        let text = String::from_utf8(value.0.clone()).map_err(|_| CompileError::InvalidSecret {
            secret: qualified.to_string(),
            reason: format!("key '{}' is not valid UTF-8", key),
        })?;
        out.insert(key.clone(), text);
    }
    for (key, value) in secret.string_data.iter().flatten() {
        out.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Ok(out)
}

fn required_key<'d>(
    data: &'d BTreeMap<String, String>,
    secret: &str,
    key: &str,
) -> Result<&'d str, CompileError> {
    data.get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| CompileError::InvalidSecret {
            secret: secret.to_string(),
            reason: format!("missing key '{}'", key),
        })
}

/// `user:hash` or `user::plaintext`
fn parse_user(line: &str) -> Option<User> {
    let (name, rest) = line.split_once(':')?;
    let (password, insecure) = match rest.strip_prefix(':') {
        Some(plain) => (plain, true),
        None => (rest, false),
    };
    if name.is_empty() || password.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(User {
        name: name.to_string(),
        password: password.to_string(),
        insecure,
    })
}

fn host_condition(host: &HostPattern, fetch: HostFetch) -> Option<String> {
    let (exact, suffix) = match fetch {
        HostFetch::Header => ("var(txn.host) -m str", "var(txn.host) -m end"),
        HostFetch::Sni => ("req_ssl_sni -i", "req_ssl_sni -m end"),
        HostFetch::TerminatedSni => ("ssl_fc_sni -i", "ssl_fc_sni -m end"),
    };
    match host.class() {
        HostClass::Any => None,
        HostClass::Wildcard => host
            .wildcard_suffix()
            .map(|s| format!("{{ {} {} }}", suffix, s)),
        HostClass::Exact => Some(format!("{{ {} {} }}", exact, host.as_str())),
    }
}

fn route_condition(host: &HostPattern, path: &str, fetch: HostFetch) -> String {
    let mut parts = Vec::with_capacity(2);
    if let Some(h) = host_condition(host, fetch) {
        parts.push(h);
    }
    if !path.is_empty() {
        parts.push(format!("{{ path_beg {} }}", path));
    }
    parts.join(" ")
}

/// Routes in precedence order, plus the first unconditional route if any
fn ordered_routes(mut drafts: Vec<DraftRoute>, fetch: HostFetch) -> (Vec<Route>, Option<String>) {
    drafts.sort_by(|a, b| {
        a.host
            .rank()
            .cmp(&b.host.rank())
            .then(b.path.len().cmp(&a.path.len()))
            .then(a.order.cmp(&b.order))
    });

    let mut catch_all = None;
    let mut routes = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let condition = route_condition(&draft.host, &draft.path, fetch);
        if condition.is_empty() {
            catch_all.get_or_insert(draft.backend);
            continue;
        }
        routes.push(Route {
            host: draft.host.as_str().to_string(),
            path: draft.path,
            backend: draft.backend,
            condition,
        });
    }
    (routes, catch_all)
}

/// Redirect for a TLS-covered host/path that leaves longer user paths alone
fn redirect(host: &HostPattern, path: &str, routes: &[DraftRoute]) -> Redirect {
    let mut condition = route_condition(host, path, HostFetch::Header);
    for route in routes.iter().filter(|r| {
        r.host == *host && r.path.len() > path.len() && r.path.starts_with(path)
    }) {
        condition.push_str(&format!(" !{{ path_beg {} }}", route.path));
    }
    Redirect {
        host: host.as_str().to_string(),
        path: path.to_string(),
        condition,
    }
}

fn servers(
    endpoints: Vec<Endpoint>,
    policy: &BackendPolicy,
    be: &IngressBackend,
    check: bool,
    resolver: Option<&str>,
) -> Vec<Server> {
    endpoints
        .into_iter()
        .enumerate()
        .map(|(i, ep)| {
            let mut params: Vec<String> = Vec::new();
            if check || policy.agent.is_some() {
                params.push("check".to_string());
                if let Some(port) = policy.check_port {
                    params.push(format!("port {}", port));
                }
            }
            if let Some(agent) = &policy.agent {
                params.push(format!("agent-check agent-port {}", agent.port));
                if let Some(interval) = &agent.interval {
                    params.push(format!("agent-inter {}", interval));
                }
            }
            if let Some(max) = policy.max_connections {
                params.push(format!("maxconn {}", max));
            }
            if let Some(weight) = ep.weight {
                params.push(format!("weight {}", weight));
            }
            if let Some(tls) = &policy.backend_tls {
                params.push(tls.clone());
            }
            if let Some(proxy) = policy.send_proxy {
                params.push(proxy.keyword().to_string());
            }
            if !be.alpn.is_empty() {
                params.push(format!("alpn {}", be.alpn.join(",")));
            }
            if let Some(proto) = &be.proto {
                params.push(format!("proto {}", proto));
            }
            if let Some(sticky) = &policy.sticky {
                let value = match sticky.hash {
                    Some(CookieHash::Index) => format!("s{}", i),
                    Some(hash) => deterministic_hash(&format!("{:?}/{}", hash, ep.name)),
                    None => ep.name.clone(),
                };
                params.push(format!("cookie {}", value));
            }
            if let Some(resolver) = resolver {
                params.push(format!("resolvers {} resolve-prefer ipv4", resolver));
            }
            Server {
                name: ep.name,
                address: ep.address,
                port: ep.port,
                params: params.iter().map(|p| format!(" {}", p)).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::keys;
    use crate::compiler::fixtures::*;
    use crate::compiler::ObjectKey;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use voyager_common::crd::{
        AuthOption, BasicAuth, FrontendRule, IngressSpec, IngressTls, TlsAuth,
    };

    fn build(ing: &Ingress, inputs: &ResolvedInputs) -> Result<(RoutingModel, CertBundle), CompileError> {
        let policy = IngressPolicy::parse(ing.annotations())?;
        ModelBuilder::new(ing, "default", inputs, &policy).build()
    }

    fn conditions(listener: &Listener) -> Vec<(&str, &str)> {
        listener
            .routes
            .iter()
            .map(|r| (r.condition.as_str(), r.backend.as_str()))
            .collect()
    }

    /// Non-empty, trimmed lines of the fully rendered config
    fn rendered(ing: &Ingress, inputs: &ResolvedInputs) -> Vec<String> {
        let compiled = crate::compiler::IngressCompiler::new(inputs)
            .compile(ing)
            .expect("compiles");
        compiled
            .config
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[track_caller]
    fn assert_line(lines: &[String], expected: &str) {
        assert!(
            lines.iter().any(|l| l == expected),
            "missing line `{}` in:\n{}",
            expected,
            lines.join("\n")
        );
    }

    fn annotate_service(inputs: &mut ResolvedInputs, name: &str, pairs: &[(&str, &str)]) {
        if let Some(svc) = inputs.services.get_mut(&ObjectKey::new("default", name)) {
            let annotations = svc.metadata.annotations.get_or_insert_with(BTreeMap::new);
            for (k, v) in pairs {
                annotations.insert(k.to_string(), v.to_string());
            }
        }
    }

    fn root_to(service: &str, port: i32) -> IngressSpec {
        IngressSpec {
            rules: vec![http_rule("", vec![("/", backend(service, port))])],
            ..Default::default()
        }
    }

    fn tls(secret: &str, hosts: &[&str]) -> IngressTls {
        IngressTls {
            secret_name: Some(secret.to_string()),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn longer_paths_route_first() {
        let ing = ingress(
            "web",
            IngressSpec {
                rules: vec![http_rule(
                    "",
                    vec![("/a", backend("web", 80)), ("/a/b", backend("api", 8080))],
                )],
                ..Default::default()
            },
        );
        let (model, _) = build(&ing, &inputs()).expect("builds");
        let fe = model.frontend(ANY_ADDRESS, 80).expect("port 80 listener");
        assert_eq!(
            conditions(fe),
            vec![
                ("{ path_beg /a/b }", "api.default:8080"),
                ("{ path_beg /a }", "web.default:80"),
            ]
        );
    }

    /// Story: an exact host wins over a wildcard covering it
    #[test]
    fn story_exact_host_beats_wildcard() {
        let ing = ingress(
            "web",
            IngressSpec {
                rules: vec![
                    http_rule("*.test", vec![("/", backend("web", 80))]),
                    http_rule("http.test", vec![("/", backend("api", 8080))]),
                ],
                ..Default::default()
            },
        );
        let (model, _) = build(&ing, &inputs()).expect("builds");
        let fe = model.frontend(ANY_ADDRESS, 80).expect("listener");
        assert_eq!(
            conditions(fe),
            vec![
                (
                    "{ var(txn.host) -m str http.test } { path_beg / }",
                    "api.default:8080"
                ),
                (
                    "{ var(txn.host) -m end .test } { path_beg / }",
                    "web.default:80"
                ),
            ]
        );
    }

    /// Story: frontend rules precede generated routing, which orders /p2 before /p
    #[test]
    fn story_frontend_rules_and_path_order() {
        let ing = ingress(
            "web",
            IngressSpec {
                frontend_rules: vec![FrontendRule {
                    port: 80,
                    rules: vec!["http-request set-header X-Edge voyager".to_string()],
                    auth: None,
                }],
                rules: vec![http_rule(
                    "",
                    vec![("/p", backend("web", 80)), ("/p2", backend("api", 8080))],
                )],
                ..Default::default()
            },
        );
        let (model, _) = build(&ing, &inputs()).expect("builds");
        let fe = model.frontend(ANY_ADDRESS, 80).expect("listener");
        assert_eq!(fe.frontend_rules, vec!["http-request set-header X-Edge voyager"]);
        assert_eq!(fe.routes[0].path, "/p2");
        assert_eq!(fe.routes[0].backend, "api.default:8080");
        assert_eq!(fe.routes[1].path, "/p");
    }

    #[test]
    fn frontend_rule_without_listener_is_rejected() {
        let ing = ingress(
            "web",
            IngressSpec {
                frontend_rules: vec![FrontendRule {
                    port: 8443,
                    ..Default::default()
                }],
                rules: vec![http_rule("", vec![("/", backend("web", 80))])],
                ..Default::default()
            },
        );
        assert_eq!(
            build(&ing, &inputs()).err(),
            Some(CompileError::FrontendRuleWithoutListener { port: 8443 })
        );
    }

    #[test]
    fn tls_host_terminates_on_443_and_redirects_from_80() {
        let mut inputs = inputs();
        add_secret(&mut inputs, tls_secret("a-tls"));
        let ing = ingress(
            "web",
            IngressSpec {
                tls: vec![tls("a-tls", &["a.test"])],
                rules: vec![http_rule("a.test", vec![("/", backend("web", 80))])],
                ..Default::default()
            },
        );
        let (model, certs) = build(&ing, &inputs).expect("builds");

        let secure = model.frontend(ANY_ADDRESS, 443).expect("tls listener");
        assert_eq!(
            secure.bind,
            "0.0.0.0:443 ssl crt /etc/ssl/private/haproxy/tls/a-tls.pem"
        );
        assert!(secure
            .http_rules
            .iter()
            .any(|r| r.starts_with("http-response set-header Strict-Transport-Security")));

        let plain = model.frontend(ANY_ADDRESS, 80).expect("redirect listener");
        assert!(plain.routes.is_empty());
        assert_eq!(
            plain.redirects[0].condition,
            "{ var(txn.host) -m str a.test } { path_beg / }"
        );
        assert_eq!(certs.files.len(), 1);
        assert_eq!(certs.files[0].key, "tls.a-tls.pem");
    }

    /// Story: a plaintext path the user declared keeps serving plaintext
    #[test]
    fn story_redirect_leaves_user_paths_alone() {
        let mut inputs = inputs();
        add_secret(&mut inputs, tls_secret("a-tls"));
        let mut plain_rule = http_rule("a.test", vec![("/public", backend("api", 8080))]);
        if let Some(http) = plain_rule.http.as_mut() {
            http.no_tls = true;
        }
        let ing = ingress(
            "web",
            IngressSpec {
                tls: vec![tls("a-tls", &["a.test"])],
                rules: vec![
                    http_rule("a.test", vec![("/", backend("web", 80))]),
                    plain_rule,
                ],
                ..Default::default()
            },
        );
        let (model, _) = build(&ing, &inputs).expect("builds");
        let plain = model.frontend(ANY_ADDRESS, 80).expect("plaintext listener");
        assert_eq!(
            conditions(plain),
            vec![(
                "{ var(txn.host) -m str a.test } { path_beg /public }",
                "api.default:8080"
            )]
        );
        assert_eq!(
            plain.redirects[0].condition,
            "{ var(txn.host) -m str a.test } { path_beg / } !{ path_beg /public }"
        );
    }

    #[test]
    fn ssl_redirect_can_be_disabled() {
        let mut inputs = inputs();
        add_secret(&mut inputs, tls_secret("a-tls"));
        let ing = annotate(
            ingress(
                "web",
                IngressSpec {
                    tls: vec![tls("a-tls", &["a.test"])],
                    rules: vec![http_rule("a.test", vec![("/", backend("web", 80))])],
                    ..Default::default()
                },
            ),
            &[(keys::SSL_REDIRECT, "false")],
        );
        let (model, _) = build(&ing, &inputs).expect("builds");
        assert!(model.frontend(ANY_ADDRESS, 80).is_none());
    }

    #[test]
    fn most_specific_tls_entry_covers_a_host() {
        let mut inputs = inputs();
        add_secret(&mut inputs, tls_secret("wide"));
        add_secret(&mut inputs, tls_secret("narrow"));
        let ing = ingress(
            "web",
            IngressSpec {
                tls: vec![tls("wide", &["*.test"]), tls("narrow", &["*.a.test"])],
                rules: vec![http_rule("x.a.test", vec![("/", backend("web", 80))])],
                ..Default::default()
            },
        );
        let (model, _) = build(&ing, &inputs).expect("builds");
        let secure = model.frontend(ANY_ADDRESS, 443).expect("tls listener");
        assert!(secure.bind.contains("tls/narrow.pem"));
        assert!(!secure.bind.contains("tls/wide.pem"));
    }

    #[test]
    fn missing_tls_secret_is_a_reference_error() {
        let ing = ingress(
            "web",
            IngressSpec {
                tls: vec![tls("absent", &["a.test"])],
                rules: vec![http_rule("a.test", vec![("/", backend("web", 80))])],
                ..Default::default()
            },
        );
        assert_eq!(
            build(&ing, &inputs()).err(),
            Some(CompileError::MissingReference {
                kind: "Secret",
                name: "default/absent".to_string()
            })
        );
    }

    /// Story: FrontendRule auth beats annotation auth, which beats Service auth
    #[test]
    fn story_auth_precedence() {
        let mut inputs = inputs();
        add_secret(&mut inputs, secret("fr-users", &[("auth", "alice::wonderland")]));
        add_secret(&mut inputs, secret("global-users", &[("auth", "bob:$6$hash")]));
        add_secret(&mut inputs, secret("svc-users", &[("auth", "carol::pw")]));
        let mut api = service("api", &[(None, 8080)]);
        api.metadata.annotations = Some(BTreeMap::from([(
            keys::AUTH_SECRET.to_string(),
            "svc-users".to_string(),
        )]));
        add_service(&mut inputs, api);

        let protected = FrontendRule {
            port: 80,
            rules: vec![],
            auth: Some(AuthOption {
                basic: Some(BasicAuth {
                    secret_name: Some("fr-users".to_string()),
                    realm: Some("edge".to_string()),
                    ..Default::default()
                }),
                tls: None,
            }),
        };
        let mut internal = http_rule("", vec![("/", backend("web", 80))]);
        if let Some(http) = internal.http.as_mut() {
            http.port = Some(8080);
        }
        let ing = ingress(
            "web",
            IngressSpec {
                frontend_rules: vec![protected],
                rules: vec![http_rule("", vec![("/", backend("api", 8080))]), internal],
                ..Default::default()
            },
        );

        // Without global auth: the frontend rule guards port 80 and shields api
        let (model, _) = build(&ing, &inputs).expect("builds");
        let edge = model.frontend(ANY_ADDRESS, 80).expect("edge listener");
        assert_eq!(
            edge.auth.as_ref().map(|a| a.userlist.as_str()),
            Some("auth_default_fr-users")
        );
        assert_eq!(model.backend("api.default:8080").and_then(|b| b.auth.clone()), None);
        assert!(model.frontend(ANY_ADDRESS, 8080).and_then(|f| f.auth.clone()).is_none());

        // With global auth: port 8080 picks up the annotation, port 80 keeps its own
        let ing = annotate(ing, &[(keys::AUTH_SECRET, "global-users")]);
        let (model, _) = build(&ing, &inputs).expect("builds");
        let edge = model.frontend(ANY_ADDRESS, 80).expect("edge listener");
        assert_eq!(edge.auth.as_ref().map(|a| a.realm.as_str()), Some("edge"));
        let internal = model.frontend(ANY_ADDRESS, 8080).expect("internal listener");
        assert_eq!(
            internal.auth.as_ref().map(|a| a.userlist.as_str()),
            Some("auth_default_global-users")
        );
        let users = model
            .userlists
            .iter()
            .find(|u| u.name == "auth_default_fr-users")
            .expect("frontend userlist");
        assert_eq!(
            users.users,
            vec![User {
                name: "alice".to_string(),
                password: "wonderland".to_string(),
                insecure: true
            }]
        );
    }

    #[test]
    fn service_auth_applies_when_nothing_overrides_it() {
        let mut inputs = inputs();
        add_secret(&mut inputs, secret("svc-users", &[("auth", "carol:$6$x\n# comment\n")]));
        let mut api = service("api", &[(None, 8080)]);
        api.metadata.annotations = Some(BTreeMap::from([
            (keys::AUTH_SECRET.to_string(), "svc-users".to_string()),
            (keys::AUTH_REALM.to_string(), "api".to_string()),
        ]));
        add_service(&mut inputs, api);
        let ing = ingress(
            "web",
            IngressSpec {
                rules: vec![http_rule("", vec![("/", backend("api", 8080))])],
                ..Default::default()
            },
        );
        let (model, _) = build(&ing, &inputs).expect("builds");
        assert_eq!(
            model.backend("api.default:8080").and_then(|b| b.auth.clone()),
            Some(AuthRef {
                userlist: "auth_default_svc-users".to_string(),
                realm: "api".to_string()
            })
        );
    }

    #[test]
    fn malformed_userlist_is_rejected() {
        let mut inputs = inputs();
        add_secret(&mut inputs, secret("users", &[("auth", "no-separator")]));
        let ing = annotate(
            ingress(
                "web",
                IngressSpec {
                    rules: vec![http_rule("", vec![("/", backend("web", 80))])],
                    ..Default::default()
                },
            ),
            &[(keys::AUTH_SECRET, "users")],
        );
        assert!(matches!(
            build(&ing, &inputs),
            Err(CompileError::InvalidSecret { .. })
        ));
    }

    #[test]
    fn duplicate_explicit_backend_names_fail() {
        let mut a = backend("web", 80);
        a.name = Some("shared".to_string());
        let mut b = backend("api", 8080);
        b.name = Some("shared".to_string());
        let ing = ingress(
            "web",
            IngressSpec {
                rules: vec![http_rule("", vec![("/a", a), ("/b", b)])],
                ..Default::default()
            },
        );
        assert_eq!(
            build(&ing, &inputs()).err(),
            Some(CompileError::DuplicateBackendName {
                name: "shared".to_string()
            })
        );
    }

    #[test]
    fn http_and_tcp_on_one_port_conflict() {
        let mut rule = http_rule("", vec![("/", backend("web", 80))]);
        if let Some(http) = rule.http.as_mut() {
            http.port = Some(8080);
        }
        let ing = ingress(
            "web",
            IngressSpec {
                rules: vec![rule, tcp_rule("", 8080, backend("api", 8080))],
                ..Default::default()
            },
        );
        assert!(matches!(
            build(&ing, &inputs()),
            Err(CompileError::ListenerConflict { port: 8080, .. })
        ));
    }

    #[test]
    fn tcp_hosts_dispatch_on_sni() {
        let ing = ingress(
            "web",
            IngressSpec {
                rules: vec![
                    tcp_rule("a.test", 443, backend("web", 80)),
                    tcp_rule("b.test", 443, backend("api", 8080)),
                ],
                ..Default::default()
            },
        );
        let (model, _) = build(&ing, &inputs()).expect("builds");
        let fe = model.frontend(ANY_ADDRESS, 443).expect("tcp listener");
        assert_eq!(fe.mode, Mode::Tcp);
        assert!(fe.sni_inspect);
        assert_eq!(fe.routes[0].condition, "{ req_ssl_sni -i a.test }");
        assert_eq!(fe.default_backend, None);
        assert_eq!(model.backend("web.default:80").map(|b| b.mode), Some(Mode::Tcp));
    }

    #[test]
    fn single_tcp_rule_becomes_the_default() {
        let ing = ingress(
            "web",
            IngressSpec {
                rules: vec![tcp_rule("db.test", 5432, backend("api", 8080))],
                ..Default::default()
            },
        );
        let (model, _) = build(&ing, &inputs()).expect("builds");
        let fe = model.frontend(ANY_ADDRESS, 5432).expect("tcp listener");
        assert!(fe.routes.is_empty());
        assert!(!fe.sni_inspect);
        assert_eq!(fe.default_backend.as_deref(), Some("api.default:8080"));
    }

    #[test]
    fn default_backend_alone_is_served_on_port_80() {
        let ing = ingress(
            "web",
            IngressSpec {
                backend: Some(backend("web", 80)),
                rules: vec![tcp_rule("", 5432, backend("api", 8080))],
                ..Default::default()
            },
        );
        let (model, _) = build(&ing, &inputs()).expect("builds");
        let fe = model.frontend(ANY_ADDRESS, 80).expect("default listener");
        assert_eq!(fe.mode, Mode::Http);
        assert_eq!(fe.default_backend.as_deref(), Some("web.default:80"));
        assert_eq!(
            model.default_backend.as_ref().map(|b| b.name.as_str()),
            Some("web.default:80")
        );
    }

    #[test]
    fn servers_come_from_endpoints_with_pod_weights() {
        let mut inputs = inputs();
        let mut pod = k8s_openapi::api::core::v1::Pod::default();
        pod.metadata.name = Some("web-a".to_string());
        pod.metadata.annotations = Some(BTreeMap::from([(
            keys::BACKEND_WEIGHT.to_string(),
            "30".to_string(),
        )]));
        inputs.pods.insert(ObjectKey::new("default", "web-a"), pod);
        let ing = annotate(
            ingress(
                "web",
                IngressSpec {
                    backend: Some(backend("web", 80)),
                    ..Default::default()
                },
            ),
            &[(keys::CHECK, "true")],
        );
        let (model, _) = build(&ing, &inputs).expect("builds");
        let default = model.default_backend.expect("default backend");
        assert_eq!(
            default.servers,
            vec![
                Server {
                    name: "pod-web-a".to_string(),
                    address: "10.0.0.1".to_string(),
                    port: 8000,
                    params: " check weight 30".to_string(),
                },
                Server {
                    name: "pod-web-b".to_string(),
                    address: "10.0.0.2".to_string(),
                    port: 8000,
                    params: " check".to_string(),
                },
            ]
        );
        assert!(model.backends.is_empty());
    }

    #[test]
    fn named_port_must_exist_on_the_service() {
        let mut be = backend("web", 80);
        be.service_port = PortRef::Name("grpc".to_string());
        let ing = ingress(
            "web",
            IngressSpec {
                backend: Some(be),
                ..Default::default()
            },
        );
        assert!(matches!(
            build(&ing, &inputs()),
            Err(CompileError::PortNotFound { .. })
        ));
    }

    #[test]
    fn error_files_map_to_defaults() {
        let mut inputs = inputs();
        let mut cm = k8s_openapi::api::core::v1::ConfigMap::default();
        cm.data = Some(BTreeMap::from([
            ("503.http".to_string(), "HTTP/1.0 503\r\n".to_string()),
            ("404.errorloc".to_string(), "https://example.com/404".to_string()),
        ]));
        inputs.config_maps.insert(ObjectKey::new("default", "errors"), cm);
        let ing = annotate(
            ingress(
                "web",
                IngressSpec {
                    backend: Some(backend("web", 80)),
                    ..Default::default()
                },
            ),
            &[(keys::ERROR_FILES, "errors")],
        );
        let (model, _) = build(&ing, &inputs).expect("builds");
        assert_eq!(
            model.defaults.error_files,
            vec![
                ErrorFile {
                    code: "404".to_string(),
                    command: "errorloc".to_string(),
                    value: "https://example.com/404".to_string(),
                },
                ErrorFile {
                    code: "503".to_string(),
                    command: "errorfile".to_string(),
                    value: "/srv/voyager/errorfiles/503.http".to_string(),
                },
            ]
        );
    }

    #[test]
    fn rate_limits_prefer_rps_over_rpm() {
        let ing = annotate(
            ingress(
                "web",
                IngressSpec {
                    rules: vec![http_rule("", vec![("/", backend("web", 80))])],
                    ..Default::default()
                },
            ),
            &[(keys::LIMIT_RPS, "10"), (keys::LIMIT_RPM, "100")],
        );
        let (model, _) = build(&ing, &inputs()).expect("builds");
        let fe = model.frontend(ANY_ADDRESS, 80).expect("listener");
        assert_eq!(
            fe.access_rules,
            vec![
                "stick-table type ip size 100k expire 10s store http_req_rate(1s)",
                "tcp-request connection track-sc0 src",
                "http-request deny deny_status 429 if { sc_http_req_rate(0) gt 10 }",
            ]
        );
    }

    // =========================================================================
    // Rendered backend and listener features
    // =========================================================================

    /// Story: an agent check rides along with the primary check, so an
    /// unreachable agent port cannot take a healthy server down on its own
    #[test]
    fn story_agent_check_keeps_primary_check() {
        let ing = annotate(
            ingress("web", root_to("web", 80)),
            &[(keys::AGENT_PORT, "5555"), (keys::AGENT_INTERVAL, "2s")],
        );
        let lines = rendered(&ing, &inputs());
        assert_line(
            &lines,
            "server pod-web-a 10.0.0.1:8000 check agent-check agent-port 5555 agent-inter 2s",
        );
        assert!(lines
            .iter()
            .filter(|l| l.contains("agent-check"))
            .all(|l| l.contains(" check agent-check")));
    }

    fn external_service(name: &str, host: &str) -> k8s_openapi::api::core::v1::Service {
        let mut svc = service(name, &[]);
        if let Some(spec) = svc.spec.as_mut() {
            spec.type_ = Some("ExternalName".to_string());
            spec.external_name = Some(host.to_string());
            spec.ports = None;
            spec.selector = None;
        }
        svc
    }

    /// Story: an ExternalName backend without a resolver becomes a redirect
    #[test]
    fn story_external_name_redirects() {
        let mut inputs = inputs();
        add_service(&mut inputs, external_service("ext", "example.org"));
        let ing = ingress("web", root_to("ext", 80));

        let lines = rendered(&ing, &inputs);
        assert_line(&lines, "backend ext.default:80");
        assert_line(&lines, "http-request redirect location http://example.org code 301");
        assert!(!lines.iter().any(|l| l.starts_with("server ")));
        assert!(!lines.iter().any(|l| l.starts_with("resolvers ")));
    }

    /// Story: with a DNS resolver the ExternalName host is proxied and
    /// resolved live through a shared `resolvers` section
    #[test]
    fn story_external_name_with_resolver_is_proxied() {
        let mut inputs = inputs();
        add_service(&mut inputs, external_service("ext", "example.org"));
        annotate_service(
            &mut inputs,
            "ext",
            &[
                (keys::USE_DNS_RESOLVER, "true"),
                (keys::DNS_RESOLVER_NAMESERVERS, "8.8.8.8"),
                (keys::DNS_RESOLVER_RETRIES, "3"),
            ],
        );
        let ing = ingress("web", root_to("ext", 8080));

        let lines = rendered(&ing, &inputs);
        let resolver = lines
            .iter()
            .find_map(|l| l.strip_prefix("resolvers "))
            .expect("resolvers section")
            .to_string();
        assert!(resolver.starts_with("dns-"));
        assert_line(&lines, "nameserver ns1 8.8.8.8:53");
        assert_line(&lines, "resolve_retries 3");
        assert_line(
            &lines,
            &format!(
                "server external example.org:8080 resolvers {} resolve-prefer ipv4",
                resolver
            ),
        );
        assert!(!lines.iter().any(|l| l.contains("redirect location")));
    }

    #[test]
    fn story_cors_headers_use_defaults() {
        let ing = annotate(ingress("web", root_to("web", 80)), &[(keys::ENABLE_CORS, "true")]);
        let lines = rendered(&ing, &inputs());
        assert_line(&lines, r#"http-response set-header Access-Control-Allow-Origin "*""#);
        assert_line(
            &lines,
            &format!(
                r#"http-response set-header Access-Control-Allow-Methods "{}""#,
                annotations::DEFAULT_CORS_METHODS
            ),
        );
        assert_line(
            &lines,
            &format!(
                r#"http-response set-header Access-Control-Allow-Headers "{}""#,
                annotations::DEFAULT_CORS_HEADERS
            ),
        );
        assert_line(&lines, "http-response set-header Access-Control-Allow-Credentials true");
    }

    #[test]
    fn story_cors_credentials_can_be_disabled() {
        let ing = annotate(
            ingress("web", root_to("web", 80)),
            &[
                (keys::ENABLE_CORS, "true"),
                (keys::CORS_ALLOW_ORIGIN, "https://app.test"),
                (keys::CORS_ALLOW_CREDENTIALS, "false"),
            ],
        );
        let lines = rendered(&ing, &inputs());
        assert_line(
            &lines,
            r#"http-response set-header Access-Control-Allow-Origin "https://app.test""#,
        );
        assert!(!lines.iter().any(|l| l.contains("Allow-Credentials")));
    }

    #[test]
    fn story_sticky_cookie_with_index_values() {
        let ing = annotate(
            ingress("web", root_to("web", 80)),
            &[
                (keys::AFFINITY, "cookie"),
                (keys::SESSION_COOKIE_NAME, "BACKEND"),
                (keys::SESSION_COOKIE_HASH, "index"),
            ],
        );
        let lines = rendered(&ing, &inputs());
        assert_line(&lines, "cookie BACKEND insert indirect nocache");
        assert_line(&lines, "server pod-web-a 10.0.0.1:8000 cookie s0");
        assert_line(&lines, "server pod-web-b 10.0.0.2:8000 cookie s1");
    }

    #[test]
    fn story_sticky_cookie_with_hashed_values() {
        let ing = annotate(
            ingress("web", root_to("web", 80)),
            &[(keys::AFFINITY, "cookie"), (keys::SESSION_COOKIE_HASH, "md5")],
        );
        let lines = rendered(&ing, &inputs());
        assert_line(
            &lines,
            &format!("cookie {} insert indirect nocache", annotations::DEFAULT_SESSION_COOKIE),
        );
        let value = deterministic_hash(&format!("{:?}/{}", CookieHash::Md5, "pod-web-a"));
        assert_line(&lines, &format!("server pod-web-a 10.0.0.1:8000 cookie {}", value));
    }

    /// Story: an Ingress whitelist rejects at the connection, a Service
    /// whitelist denies only its own backend, and the Ingress one wins
    #[test]
    fn story_whitelists_at_frontend_and_backend() {
        let mut inputs = inputs();
        annotate_service(&mut inputs, "api", &[(keys::WHITELIST, "172.16.0.0/12")]);
        let spec = IngressSpec {
            rules: vec![http_rule(
                "",
                vec![("/api", backend("api", 8080)), ("/", backend("web", 80))],
            )],
            ..Default::default()
        };

        let lines = rendered(&ingress("web", spec.clone()), &inputs);
        assert_line(&lines, "http-request deny if !{ src 172.16.0.0/12 }");
        assert!(!lines.iter().any(|l| l.starts_with("tcp-request connection reject")));

        let global = annotate(
            ingress("web", spec),
            &[(keys::WHITELIST, "10.0.0.0/8, 192.168.1.5")],
        );
        let lines = rendered(&global, &inputs);
        assert_line(
            &lines,
            "tcp-request connection reject if !{ src 10.0.0.0/8 192.168.1.5/32 }",
        );
        assert!(!lines.iter().any(|l| l.contains("172.16.0.0/12")));
    }

    #[rstest]
    #[case::check_with_port(&[(keys::CHECK, "true"), (keys::CHECK_PORT, "8081")], &[], " check port 8081")]
    #[case::httpchk_implies_check(&[(keys::CHECK_PORT, "8081")], &["option httpchk GET /healthz"], " check port 8081")]
    #[case::port_alone_is_inert(&[(keys::CHECK_PORT, "8081")], &[], "")]
    #[case::check_disabled(&[(keys::CHECK, "false")], &[], "")]
    fn story_health_check_parameters(
        #[case] service_annotations: &[(&str, &str)],
        #[case] backend_rules: &[&str],
        #[case] params: &str,
    ) {
        let mut inputs = inputs();
        annotate_service(&mut inputs, "web", service_annotations);
        let mut be = backend("web", 80);
        be.backend_rules = backend_rules.iter().map(|r| r.to_string()).collect();
        let ing = ingress(
            "web",
            IngressSpec {
                rules: vec![http_rule("", vec![("/", be)])],
                ..Default::default()
            },
        );

        let lines = rendered(&ing, &inputs);
        assert_line(&lines, &format!("server pod-web-a 10.0.0.1:8000{}", params));
        for rule in backend_rules {
            assert_line(&lines, rule);
        }
    }

    /// Story: client certificates are verified against the CA and CRL, a
    /// failed verification is sent to the error page, and verification
    /// results are forwarded upstream
    #[test]
    fn story_tls_client_auth() {
        let mut inputs = inputs();
        add_secret(&mut inputs, tls_secret("a-tls"));
        add_secret(
            &mut inputs,
            secret(
                "client-ca",
                &[
                    ("ca.crt", "-----BEGIN CERTIFICATE-----\nCA\n-----END CERTIFICATE-----"),
                    ("crl.pem", "-----BEGIN X509 CRL-----\nCRL\n-----END X509 CRL-----"),
                ],
            ),
        );
        let ing = ingress(
            "web",
            IngressSpec {
                tls: vec![tls("a-tls", &["a.test"])],
                rules: vec![http_rule("a.test", vec![("/", backend("web", 80))])],
                frontend_rules: vec![FrontendRule {
                    port: 443,
                    rules: vec![],
                    auth: Some(AuthOption {
                        basic: None,
                        tls: Some(TlsAuth {
                            secret_name: "client-ca".to_string(),
                            verify_client: TlsVerifyMode::Required,
                            error_page: Some("https://errors.test/cert".to_string()),
                            headers: BTreeMap::from([(
                                "X-SSL-Client-CN".to_string(),
                                "ssl_c_s_dn(cn)".to_string(),
                            )]),
                        }),
                    }),
                }],
                ..Default::default()
            },
        );

        let lines = rendered(&ing, &inputs);
        assert_line(
            &lines,
            "bind 0.0.0.0:443 ssl crt /etc/ssl/private/haproxy/tls/a-tls.pem \
             ca-file /etc/ssl/private/haproxy/ca/client-ca.crt verify optional \
             crl-file /etc/ssl/private/haproxy/ca/client-ca-crl.pem",
        );
        assert_line(
            &lines,
            "http-request redirect location https://errors.test/cert code 302 \
             if !{ ssl_c_used } || !{ ssl_c_verify 0 }",
        );
        assert_line(&lines, "http-request set-header X-SSL-Client-CN %[ssl_c_s_dn(cn)]");
        assert_line(&lines, "bind 0.0.0.0:80");
    }

    #[test]
    fn story_host_names_select_endpoints_by_pod_prefix() {
        let mut be = backend("web", 80);
        be.host_names = vec!["web-b".to_string()];
        let ing = ingress(
            "web",
            IngressSpec {
                rules: vec![http_rule("", vec![("/", be)])],
                ..Default::default()
            },
        );
        let lines = rendered(&ing, &inputs());
        assert_line(&lines, "server pod-web-b 10.0.0.2:8000");
        assert!(!lines.iter().any(|l| l.starts_with("server pod-web-a")));
    }

    #[test]
    fn story_limit_connection_tracks_concurrent_connections() {
        let ing = annotate(
            ingress("web", root_to("web", 80)),
            &[(keys::LIMIT_CONNECTION, "100")],
        );
        let lines = rendered(&ing, &inputs());
        assert_line(&lines, "stick-table type ip size 100k expire 10s store conn_cur");
        assert_line(&lines, "tcp-request connection track-sc0 src");
        assert_line(&lines, "tcp-request connection reject if { sc_conn_cur(0) gt 100 }");
        assert!(!lines.iter().any(|l| l.contains("sc_http_req_rate")));
    }
}
