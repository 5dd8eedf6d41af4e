//! Routing model
//!
//! The canonical, renderer-facing description of one HAProxy config. Every
//! ordering decision (ACL precedence, section order) is settled here so that
//! rendering is a plain walk over the structure.

mod builder;

use serde::Serialize;

use crate::annotations::Cors;

pub use builder::ModelBuilder;

/// Mount root of the certificate Secret inside the proxy pod
pub const CERT_MOUNT_PATH: &str = "/etc/ssl/private/haproxy";
/// Mount path of the error-file ConfigMap inside the proxy pod
pub const ERROR_FILES_MOUNT_PATH: &str = "/srv/voyager/errorfiles";
/// Default bind address
pub const ANY_ADDRESS: &str = "0.0.0.0";

/// Complete description of one rendered config
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RoutingModel {
    pub defaults: Defaults,
    pub userlists: Vec<Userlist>,
    pub resolvers: Vec<Resolver>,
    pub stats: Option<Stats>,
    /// Sorted by (bind address, port)
    pub frontends: Vec<Listener>,
    pub default_backend: Option<Backend>,
    /// Sorted by name, excluding the default backend
    pub backends: Vec<Backend>,
}

impl RoutingModel {
    /// Look up a frontend by bind address and port
    pub fn frontend(&self, address: &str, port: i32) -> Option<&Listener> {
        self.frontends
            .iter()
            .find(|f| f.address == address && f.port == port)
    }

    /// Look up a backend section by name, including the default backend
    pub fn backend(&self, name: &str) -> Option<&Backend> {
        self.default_backend
            .iter()
            .chain(self.backends.iter())
            .find(|b| b.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NamedValue {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Defaults {
    pub options: Vec<DefaultOption>,
    pub timeouts: Vec<NamedValue>,
    pub error_files: Vec<ErrorFile>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DefaultOption {
    pub name: String,
    pub enabled: bool,
}

/// `errorfile`/`errorloc*` directive keyed by status code
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorFile {
    pub code: String,
    pub command: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Userlist {
    pub name: String,
    pub users: Vec<User>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct User {
    pub name: String,
    pub password: String,
    /// Plain-text password (`user::password` in the Secret)
    pub insecure: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Resolver {
    pub name: String,
    pub nameservers: Vec<NamedValue>,
    pub parse_resolv_conf: bool,
    pub retries: Option<u32>,
    pub timeouts: Vec<NamedValue>,
    pub holds: Vec<NamedValue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub port: i32,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Bind address and port identifying a listener
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey {
    pub address: String,
    pub port: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Http,
    Tcp,
}

/// One HAProxy `frontend`
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: i32,
    pub mode: Mode,
    pub node_port: Option<i32>,
    /// Everything after `bind `: address, certificates, client auth
    pub bind: String,
    pub max_connections: Option<u32>,
    /// Connection-level rules evaluated before any routing
    pub access_rules: Vec<String>,
    /// Inspect the TLS ClientHello for SNI dispatch without terminating
    pub sni_inspect: bool,
    /// Generated request/response rules (host capture, auth, HSTS, ...)
    pub http_rules: Vec<String>,
    /// Raw lines from FrontendRules, ahead of generated routing
    pub frontend_rules: Vec<String>,
    pub auth: Option<AuthRef>,
    pub redirects: Vec<Redirect>,
    /// Ordered most specific first
    pub routes: Vec<Route>,
    pub default_backend: Option<String>,
}

/// `use_backend` entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Route {
    pub host: String,
    pub path: String,
    pub backend: String,
    pub condition: String,
}

/// Synthesized HTTP to HTTPS redirect for a TLS-covered host/path
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Redirect {
    pub host: String,
    pub path: String,
    pub condition: String,
}

/// One HAProxy `backend`
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Backend {
    pub name: String,
    pub mode: Mode,
    pub balance: Option<String>,
    pub backend_rules: Vec<String>,
    pub sticky_cookie: Option<String>,
    /// Generated request/response rules (whitelist, auth, headers, CORS, ...)
    pub http_rules: Vec<String>,
    pub auth: Option<AuthRef>,
    pub cors: Option<Cors>,
    pub servers: Vec<Server>,
}

/// Basic auth check against a rendered userlist
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuthRef {
    pub userlist: String,
    pub realm: String,
}

impl Backend {
    /// Whether a backend rule supplies its own `option httpchk`
    pub fn has_httpchk(&self) -> bool {
        self.backend_rules
            .iter()
            .any(|r| r.trim_start().starts_with("option httpchk"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: i32,
    /// Server-line parameters, each prefixed by a space
    pub params: String,
}

/// Host pattern specificity class
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostClass {
    Exact,
    Wildcard,
    Any,
}

/// A rule's host pattern
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPattern(String);

impl HostPattern {
    pub fn new(host: &str) -> Self {
        Self(host.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn class(&self) -> HostClass {
        if self.0.is_empty() {
            HostClass::Any
        } else if self.0.starts_with("*.") {
            HostClass::Wildcard
        } else {
            HostClass::Exact
        }
    }

    /// Suffix matched by a wildcard, including the leading dot
    pub fn wildcard_suffix(&self) -> Option<&str> {
        self.0.strip_prefix('*')
    }

    /// Whether this pattern (as a TLS binding) covers `host`.
    ///
    /// A wildcard covers any single- or multi-label prefix and itself.
    pub fn covers(&self, host: &str) -> bool {
        if self.0 == host {
            return true;
        }
        match self.wildcard_suffix() {
            Some(suffix) => host.len() > suffix.len() && host.ends_with(suffix),
            None => false,
        }
    }

    /// Ordering key: exact before wildcard before match-all, longer wildcard
    /// suffixes first
    pub fn rank(&self) -> (HostClass, usize) {
        let suffix_len = self.wildcard_suffix().map(str::len).unwrap_or(0);
        (self.class(), usize::MAX - suffix_len)
    }
}

/// A file materialised into the offshoot certificate Secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertFile {
    /// Secret data key
    pub key: String,
    /// Path relative to [`CERT_MOUNT_PATH`]
    pub path: String,
    pub content: String,
}

/// Certificates, CA bundles and CRLs needed by the rendered config
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertBundle {
    pub files: Vec<CertFile>,
}

impl CertBundle {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Add a file once; returns its absolute path
    pub fn add(&mut self, key: String, path: String, content: String) -> String {
        let absolute = format!("{}/{}", CERT_MOUNT_PATH, path);
        if !self.files.iter().any(|f| f.key == key) {
            self.files.push(CertFile { key, path, content });
        }
        absolute
    }
}
