use serde::{Deserialize, Serialize};

/// Describes where to connect, as whom, and with what credential.
///
/// A target is pure data: the engine holds at most one active instance
/// behind an `Arc` and swaps it wholesale on login or session refresh, so
/// in-flight readers never observe a partially updated descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Host name, without scheme (e.g. `api.example.com`).
    pub host: String,

    /// Organization the session belongs to.
    pub organization_id: Option<String>,

    /// User the session belongs to.
    pub user_id: Option<String>,

    /// Plain-HTTP port. `None` means the scheme default.
    pub port: Option<u16>,

    /// HTTPS port. `None` means the scheme default.
    pub ssl_port: Option<u16>,

    /// Base path prepended to relative operation URLs (e.g. `/services/data`).
    pub api_base_path: String,

    /// Current access token. Absent only for remote-host targets, where the
    /// caller supplies its own authorization headers.
    pub access_token: Option<String>,
}

impl Target {
    /// Create a target for the given host with no credential attached yet.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            organization_id: None,
            user_id: None,
            port: None,
            ssl_port: None,
            api_base_path: String::new(),
            access_token: None,
        }
    }

    /// Create a "remote host" target: no access token is required and
    /// operations built against it default to `requires_access_token = false`.
    #[must_use]
    pub fn remote(host: impl Into<String>) -> Self {
        Self::new(host)
    }

    /// Set the access token.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set the organization identifier.
    #[must_use]
    pub fn with_organization_id(mut self, org: impl Into<String>) -> Self {
        self.organization_id = Some(org.into());
        self
    }

    /// Set the user identifier.
    #[must_use]
    pub fn with_user_id(mut self, user: impl Into<String>) -> Self {
        self.user_id = Some(user.into());
        self
    }

    /// Set explicit HTTP / HTTPS ports.
    #[must_use]
    pub fn with_ports(mut self, port: Option<u16>, ssl_port: Option<u16>) -> Self {
        self.port = port;
        self.ssl_port = ssl_port;
        self
    }

    /// Set the API base path used to resolve relative operation URLs.
    #[must_use]
    pub fn with_api_base_path(mut self, path: impl Into<String>) -> Self {
        self.api_base_path = path.into();
        self
    }

    /// Whether an access token is currently present.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.access_token.is_some()
    }

    /// Base URL for this target: scheme, host, optional explicit port, and
    /// the API base path.
    #[must_use]
    pub fn base_url(&self, use_ssl: bool) -> String {
        let scheme = if use_ssl { "https" } else { "http" };
        let port = if use_ssl { self.ssl_port } else { self.port };
        let base_path = normalize_base_path(&self.api_base_path);
        match port {
            Some(p) => format!("{scheme}://{}:{p}{base_path}", self.host),
            None => format!("{scheme}://{}{base_path}", self.host),
        }
    }

    /// Resolve an operation URL against this target. Absolute URLs pass
    /// through untouched; anything else is joined to [`Target::base_url`].
    #[must_use]
    pub fn resolve(&self, url: &str, use_ssl: bool) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_owned();
        }
        let base = self.base_url(use_ssl);
        if url.is_empty() {
            base
        } else if url.starts_with('/') {
            format!("{base}{url}")
        } else {
            format!("{base}/{url}")
        }
    }
}

/// Ensure a non-empty base path has exactly one leading and no trailing slash.
fn normalize_base_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
