use super::*;

/// Request options for a patched fetch, the subset the replay engine routes.
#[derive(Debug, Clone)]
pub struct FetchInit {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Default for FetchInit {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// Synthetic response, whether archived or fetched live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok_with(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            status_text: "ok".to_string(),
            body,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            status_text: "file not found".to_string(),
            body: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Live-network fallback for references that are not archived. Supplied by
/// the consumer; the engine never opens a socket itself.
pub trait LiveFetch {
    fn fetch(&mut self, url: &Url, init: &FetchInit) -> std::result::Result<Response, String>;
}

/// Routes references either to the archive resource map or to the live
/// fallback, producing synthetic 200/404 responses for archived content.
pub struct ContentFetcher {
    resolver: UrlResolver,
    map: ResourceMap,
    live: Option<Box<dyn LiveFetch>>,
    calls: Vec<String>,
}

impl std::fmt::Debug for ContentFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentFetcher")
            .field("resolver", &self.resolver)
            .field("resources", &self.map.len())
            .field("live", &self.live.is_some())
            .field("calls", &self.calls.len())
            .finish()
    }
}

impl ContentFetcher {
    pub fn new(resolver: UrlResolver, map: ResourceMap) -> Self {
        Self {
            resolver,
            map,
            live: None,
            calls: Vec::new(),
        }
    }

    pub fn set_live_fetch(&mut self, live: Box<dyn LiveFetch>) {
        self.live = Some(live);
    }

    pub fn resolver_mut(&mut self) -> &mut UrlResolver {
        &mut self.resolver
    }

    pub fn resource_map(&self) -> &ResourceMap {
        &self.map
    }

    /// URLs handed to `fetch_url` / `fetch_reference`, in call order.
    pub fn take_calls(&mut self) -> Vec<String> {
        std::mem::take(&mut self.calls)
    }

    /// Resolves `reference` against `context` and fetches it.
    pub fn fetch_reference(
        &mut self,
        reference: &str,
        context: &Url,
        init: &FetchInit,
    ) -> Result<Response> {
        let url = self.resolver.resolve(reference, context)?;
        self.fetch_url(&url, init)
    }

    /// Archived references never raise: a locator miss or archive read
    /// failure becomes a synthetic 404. Non-archived references delegate to
    /// the live fallback; a missing or failing fallback aggregates both
    /// causes.
    pub fn fetch_url(&mut self, url: &Url, init: &FetchInit) -> Result<Response> {
        self.calls.push(url.to_string());
        let proxied = self.resolver.proxy(url);

        if is_archive_url(&proxied) {
            let path = archive_path(&proxied);
            return Ok(match self.map.locate(&path) {
                Some(handle) => Response::ok_with(handle.bytes.as_slice().to_vec()),
                None => {
                    tracing::warn!(
                        requested = %url,
                        proxied = %proxied,
                        "archived resource missing, degrading to 404"
                    );
                    Response::not_found()
                }
            });
        }

        let archive_cause = format!("{proxied} is not archived");
        match self.live.as_mut() {
            Some(live) => live.fetch(&proxied, init).map_err(|network| {
                Error::FetchFailed {
                    url: proxied.to_string(),
                    archive: archive_cause.clone(),
                    network,
                }
            }),
            None => Err(Error::FetchFailed {
                url: proxied.to_string(),
                archive: archive_cause,
                network: "no live fetch configured".to_string(),
            }),
        }
    }

    /// Playable URL for a reference: the locator-backed local URL when the
    /// proxied reference is archived, the proxied URL text otherwise. A
    /// locator miss degrades to the proxied URL so the page renders a broken
    /// resource instead of crashing.
    pub fn resource_url(&mut self, reference: &str, context: &Url) -> String {
        let resolved = match self.resolver.resolve(reference, context) {
            Ok(url) => url,
            Err(_) => return reference.to_string(),
        };
        let proxied = self.resolver.proxy(&resolved);
        if !is_archive_url(&proxied) {
            return proxied.to_string();
        }
        let path = archive_path(&proxied);
        match self.map.locate_reference(&path) {
            Some(handle) => handle.local_url.clone(),
            None => {
                tracing::warn!(reference, context = %context, path, "resource not found");
                proxied.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingLive;

    impl LiveFetch for FailingLive {
        fn fetch(&mut self, _url: &Url, _init: &FetchInit) -> std::result::Result<Response, String> {
            Err("connection refused".to_string())
        }
    }

    struct CannedLive(Response);

    impl LiveFetch for CannedLive {
        fn fetch(&mut self, _url: &Url, _init: &FetchInit) -> std::result::Result<Response, String> {
            Ok(self.0.clone())
        }
    }

    fn fetcher() -> ContentFetcher {
        let map = ResourceMap::from_pairs(&[
            ("www.desmos.com/calculator.html", "<h1>Hi</h1>"),
            ("www.desmos.com/app.css", "body{color:red}"),
        ]);
        ContentFetcher::new(UrlResolver::new(), map)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn archived_reference_returns_synthetic_200() -> Result<()> {
        let mut f = fetcher();
        let resp = f.fetch_url(&url("http://www.desmos.com/calculator.html"), &FetchInit::default())?;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.status_text, "ok");
        assert_eq!(resp.text(), "<h1>Hi</h1>");
        Ok(())
    }

    #[test]
    fn archive_miss_returns_synthetic_404_not_error() -> Result<()> {
        let mut f = fetcher();
        let resp = f.fetch_url(&url("http://www.desmos.com/missing.js"), &FetchInit::default())?;
        assert_eq!(resp.status, 404);
        assert_eq!(resp.status_text, "file not found");
        assert!(resp.body.is_empty());
        Ok(())
    }

    #[test]
    fn unarchived_reference_uses_live_fallback() -> Result<()> {
        let mut f = fetcher();
        f.set_live_fetch(Box::new(CannedLive(Response::ok_with(b"live".to_vec()))));
        let resp = f.fetch_url(&url("http://example.com/x"), &FetchInit::default())?;
        assert_eq!(resp.text(), "live");
        Ok(())
    }

    #[test]
    fn dual_failure_aggregates_both_causes() {
        let mut f = fetcher();
        f.set_live_fetch(Box::new(FailingLive));
        let err = f
            .fetch_url(&url("http://example.com/x"), &FetchInit::default())
            .unwrap_err();
        match err {
            Error::FetchFailed { url, archive, network } => {
                assert_eq!(url, "http://example.com/x");
                assert!(archive.contains("not archived"));
                assert_eq!(network, "connection refused");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_live_fallback_is_also_aggregated() {
        let mut f = fetcher();
        let err = f
            .fetch_url(&url("http://example.com/x"), &FetchInit::default())
            .unwrap_err();
        assert!(matches!(err, Error::FetchFailed { .. }));
    }

    #[test]
    fn resource_url_prefers_locator_hit() {
        let mut f = fetcher();
        let ctx = url("http://www.desmos.com/calculator.html");
        let local = f.resource_url("app.css", &ctx);
        assert!(local.starts_with("local:"), "got {local}");
        let missing = f.resource_url("missing.png", &ctx);
        assert_eq!(missing, "zip:/www.desmos.com/missing.png");
    }

    #[test]
    fn fetch_calls_are_recorded() -> Result<()> {
        let mut f = fetcher();
        let ctx = url("http://www.desmos.com/calculator.html");
        f.fetch_reference("app.css", &ctx, &FetchInit::default())?;
        assert_eq!(f.take_calls(), vec!["http://www.desmos.com/app.css"]);
        Ok(())
    }
}
