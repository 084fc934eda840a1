use super::*;

/// Scheme used for archive-local logical paths produced by the proxy table.
pub const ARCHIVE_SCHEME: &str = "zip";

pub type ProxyHook = Box<dyn FnMut(&Url) -> Option<Url>>;

/// Joins references against a context URL and maps well-known external hosts
/// to archive-local logical paths.
pub struct UrlResolver {
    proxy_hosts: Vec<(String, String)>,
    service_rules: Vec<(fancy_regex::Regex, String)>,
    hook: Option<ProxyHook>,
}

impl std::fmt::Debug for UrlResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlResolver")
            .field("proxy_hosts", &self.proxy_hosts)
            .field("service_rules", &self.service_rules.len())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl Default for UrlResolver {
    fn default() -> Self {
        let proxy_hosts = [
            "www.desmos.com",
            "www.brainfacts.org",
            "agentcooper.github.io",
            "cdn.hypothes.is",
            "via.hypothes.is",
            "hypothes.is",
        ]
        .into_iter()
        .map(|host| (host.to_string(), host.to_string()))
        .collect();

        let service_rules = [
            r"^https://hypothes\.is/(api.*?)/?$",
            r"^http://localhost:8001/(api.*?)/?$",
        ]
        .into_iter()
        .filter_map(|pattern| fancy_regex::Regex::new(pattern).ok())
        .map(|regex| (regex, "fake-service".to_string()))
        .collect();

        Self {
            proxy_hosts,
            service_rules,
            hook: None,
        }
    }
}

impl UrlResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the built-in host table and service rules with a custom hook.
    /// The hook returns `None` to fall through to the defaults.
    pub fn set_proxy_hook(&mut self, hook: ProxyHook) {
        self.hook = Some(hook);
    }

    /// Standard base-URL resolution. An absolute `reference` ignores the
    /// context. Malformed input is an error, never a panic.
    pub fn resolve(&self, reference: &str, context: &Url) -> Result<Url> {
        context
            .join(reference)
            .map_err(|err| Error::MalformedUrl(format!("{reference}: {err}")))
    }

    /// Resolves a reference that must stand on its own when no context is
    /// available.
    pub fn resolve_maybe(&self, reference: &str, context: Option<&Url>) -> Result<Url> {
        match context {
            Some(context) => self.resolve(reference, context),
            None => Url::parse(reference)
                .map_err(|err| Error::MalformedUrl(format!("{reference}: {err}"))),
        }
    }

    /// Maps well-known hosts to `zip:` logical paths; anything unmatched
    /// passes through unchanged.
    pub fn proxy(&mut self, url: &Url) -> Url {
        if let Some(hook) = self.hook.as_mut() {
            if let Some(mapped) = hook(url) {
                return mapped;
            }
        }

        if let Some(host) = url.host_str() {
            for (known, local) in &self.proxy_hosts {
                if host == known {
                    if let Ok(mapped) =
                        Url::parse(&format!("{ARCHIVE_SCHEME}:/{local}{}", url.path()))
                    {
                        return mapped;
                    }
                }
            }
        }

        let text = url.to_string();
        for (rule, service) in &self.service_rules {
            let captured = match rule.captures(&text) {
                Ok(Some(captures)) => captures.get(1).map(|m| m.as_str().to_string()),
                _ => None,
            };
            if let Some(api_path) = captured {
                if let Ok(mapped) =
                    Url::parse(&format!("{ARCHIVE_SCHEME}:/{service}/{api_path}"))
                {
                    return mapped;
                }
            }
        }

        url.clone()
    }

    /// Resolve followed by proxy, the shape every patched URL read goes
    /// through.
    pub fn proxied(&mut self, reference: &str, context: &Url) -> Result<Url> {
        let resolved = self.resolve(reference, context)?;
        Ok(self.proxy(&resolved))
    }
}

/// True when a proxied URL addresses the archive rather than the network.
pub fn is_archive_url(url: &Url) -> bool {
    url.scheme() == ARCHIVE_SCHEME
}

/// Archive-relative path of a `zip:` URL, without the leading slash.
pub fn archive_path(url: &Url) -> String {
    url.path().trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn relative_reference_joins_context() -> Result<()> {
        let resolver = UrlResolver::new();
        let url = resolver.resolve("a.png", &ctx("http://example.com/dir/page.html"))?;
        assert_eq!(url.as_str(), "http://example.com/dir/a.png");
        Ok(())
    }

    #[test]
    fn absolute_reference_ignores_context() -> Result<()> {
        let resolver = UrlResolver::new();
        let url = resolver.resolve("https://other.com/x", &ctx("http://example.com/"))?;
        assert_eq!(url.as_str(), "https://other.com/x");
        Ok(())
    }

    #[test]
    fn malformed_reference_is_reported() {
        let resolver = UrlResolver::new();
        let err = resolver.resolve_maybe("::not a url::", None).unwrap_err();
        assert!(matches!(err, Error::MalformedUrl(_)));
    }

    #[test]
    fn known_host_maps_to_archive_path() -> Result<()> {
        let mut resolver = UrlResolver::new();
        let url = resolver.proxy(&ctx("http://www.desmos.com/calculator.html"));
        assert_eq!(url.as_str(), "zip:/www.desmos.com/calculator.html");
        assert!(is_archive_url(&url));
        assert_eq!(archive_path(&url), "www.desmos.com/calculator.html");
        Ok(())
    }

    #[test]
    fn unknown_host_passes_through() {
        let mut resolver = UrlResolver::new();
        let original = ctx("http://example.com/page.html");
        assert_eq!(resolver.proxy(&original), original);
    }

    #[test]
    fn service_rule_rewrites_api_calls() {
        let mut resolver = UrlResolver::new();
        let url = resolver.proxy(&ctx("http://localhost:8001/api/search/"));
        assert_eq!(url.as_str(), "zip:/fake-service/api/search");
    }

    #[test]
    fn hook_overrides_table() {
        let mut resolver = UrlResolver::new();
        resolver.set_proxy_hook(Box::new(|url| {
            (url.host_str() == Some("www.desmos.com"))
                .then(|| Url::parse("zip:/elsewhere/x").unwrap())
        }));
        let mapped = resolver.proxy(&ctx("http://www.desmos.com/calculator.html"));
        assert_eq!(mapped.as_str(), "zip:/elsewhere/x");
        // Unmatched hook falls through to the defaults.
        let fallback = resolver.proxy(&ctx("http://hypothes.is/app.html"));
        assert_eq!(fallback.as_str(), "zip:/hypothes.is/app.html");
    }
}
