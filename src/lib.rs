//! Deterministic offline replay of archived web pages.
//!
//! A [`Replayer`] owns an in-process DOM arena and patches every iframe it
//! tracks so that page resources resolve into a loaded archive instead of the
//! network. Original references survive in shadow attributes (`patched-src`,
//! `patched-href`); reads and selector queries stay transparent, writes are
//! intercepted and localized.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

pub use url::Url;

mod dom;
mod fetcher;
mod locator;
mod mutation;
mod resolver;
mod rewriter;
mod selector;

pub use fetcher::{ContentFetcher, FetchInit, LiveFetch, Response};
pub use locator::{ArchiveReader, MimeLookup, ResourceHandle, ResourceMap};
pub use resolver::{archive_path, is_archive_url, ProxyHook, UrlResolver, ARCHIVE_SCHEME};
pub use rewriter::RewrittenDocument;

pub(crate) use dom::*;
pub(crate) use mutation::*;
pub(crate) use rewriter::{patch_link_element, rewrite_document};
pub(crate) use selector::*;

#[derive(Debug)]
pub enum Error {
    MalformedUrl(String),
    HtmlParse(String),
    UnsupportedSelector(String),
    InvalidPattern(String),
    ArchiveRead { path: String, reason: String },
    FetchFailed { url: String, archive: String, network: String },
    PatchFailed { frame: String, reason: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MalformedUrl(detail) => write!(f, "malformed URL: {detail}"),
            Error::HtmlParse(detail) => write!(f, "HTML parse error: {detail}"),
            Error::UnsupportedSelector(selector) => {
                write!(f, "unsupported selector: {selector}")
            }
            Error::InvalidPattern(pattern) => write!(f, "invalid handler pattern: {pattern}"),
            Error::ArchiveRead { path, reason } => {
                write!(f, "archive read failed for {path}: {reason}")
            }
            Error::FetchFailed { url, archive, network } => {
                write!(f, "all fetch attempts failed for {url}: {archive}; {network}")
            }
            Error::PatchFailed { frame, reason } => {
                write!(f, "patch failed for {frame}: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle to a tracked iframe element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub(crate) NodeId);

/// Handle to an element inside a tracked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(pub(crate) NodeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Unpatched,
    Patching,
    Patched,
}

/// How attribute writes get intercepted.
///
/// `CreateElement` only covers elements created through
/// [`Replayer::create_element`]; elements that came in with parsed markup
/// write raw attributes and are caught later by the mutation tracker.
/// `Prototype` covers every element of every tracked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagPatchStrategy {
    CreateElement,
    #[default]
    Prototype,
}

/// Where intercepted `postMessage` calls are routed. The target origin is
/// always forced to the wildcard; archived pages never share an origin with
/// the replay host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostMessageStrategy {
    #[default]
    Top,
    Target,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XhrResponseType {
    #[default]
    Text,
    ArrayBuffer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XhrOutcome {
    pub status: u16,
    pub status_text: String,
    pub response_text: Option<String>,
    pub response_bytes: Option<Vec<u8>>,
}

/// An intercepted `postMessage`. `to` is the frame the message was routed
/// to, `None` when no destination exists yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub from: FrameId,
    pub to: Option<FrameId>,
    pub origin: String,
    pub data: String,
}

pub struct FetchProxyRequest {
    pub url: Url,
    pub init: FetchInit,
    pub base: Option<Url>,
}

pub type FetchProxy =
    Box<dyn FnMut(&FetchProxyRequest, &mut ContentFetcher) -> Option<Result<Response>>>;
pub type IframePatchHook = Box<dyn FnMut(&mut Replayer, FrameId) -> Result<()>>;
pub type LoadHook = Box<dyn FnMut(&mut Replayer, FrameId)>;
pub type HtmlPostProcess = Box<dyn FnMut(String) -> String>;
pub type WebSocketSetup = Box<dyn FnOnce(&mut WebSocketHub)>;
pub type XhrHandler = Box<dyn FnMut(&Url, &FetchInit) -> Option<Response>>;

pub struct ReplayConfig {
    pub tag_patch_strategy: TagPatchStrategy,
    pub post_message_strategy: PostMessageStrategy,
    pub fetch_proxy: Option<FetchProxy>,
    pub on_iframe_patch: Option<IframePatchHook>,
    pub on_load: Option<LoadHook>,
    pub html_post_process: Option<HtmlPostProcess>,
    pub web_socket_setup: Option<WebSocketSetup>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            tag_patch_strategy: TagPatchStrategy::default(),
            post_message_strategy: PostMessageStrategy::default(),
            fetch_proxy: None,
            on_iframe_patch: None,
            on_load: None,
            html_post_process: None,
            web_socket_setup: None,
        }
    }
}

impl std::fmt::Debug for ReplayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayConfig")
            .field("tag_patch_strategy", &self.tag_patch_strategy)
            .field("post_message_strategy", &self.post_message_strategy)
            .field("fetch_proxy", &self.fetch_proxy.is_some())
            .field("on_iframe_patch", &self.on_iframe_patch.is_some())
            .field("on_load", &self.on_load.is_some())
            .field("html_post_process", &self.html_post_process.is_some())
            .field("web_socket_setup", &self.web_socket_setup.is_some())
            .finish()
    }
}

/// Endpoint the archived annotation client connects to.
pub const DEFAULT_ANNOTATION_ENDPOINT: &str = "wss://hypothes.is/ws";

const ANNOTATION_IDENTITY_REPLY: &str =
    r#"{"type":"whoyouare","userid":"Obsidian User","ok":true,"reply_to":1}"#;

pub type SocketServer = Box<dyn FnMut(&str) -> Vec<String>>;

/// Mock servers for WebSocket endpoints archived pages talk to. Connections
/// to URLs without a registered server stay open but never receive replies.
pub struct WebSocketHub {
    servers: HashMap<String, SocketServer>,
}

impl std::fmt::Debug for WebSocketHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut endpoints: Vec<&String> = self.servers.keys().collect();
        endpoints.sort();
        f.debug_struct("WebSocketHub")
            .field("endpoints", &endpoints)
            .finish()
    }
}

impl Default for WebSocketHub {
    fn default() -> Self {
        let mut hub = Self { servers: HashMap::new() };
        hub.register(
            DEFAULT_ANNOTATION_ENDPOINT,
            Box::new(|_message| vec![ANNOTATION_IDENTITY_REPLY.to_string()]),
        );
        hub
    }
}

impl WebSocketHub {
    pub fn register(&mut self, url: impl Into<String>, server: SocketServer) {
        self.servers.insert(url.into(), server);
    }

    pub fn has_server(&self, url: &str) -> bool {
        self.servers.contains_key(url)
    }

    fn reply(&mut self, url: &str, message: &str) -> Option<Vec<String>> {
        self.servers.get_mut(url).map(|server| server(message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(usize);

#[derive(Debug)]
struct SocketState {
    url: String,
    received: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

enum WorkerEvent {
    Message(String),
    Fetch { reference: String, reply: mpsc::Sender<Response> },
}

/// Execution context handed to a worker body on its backing thread.
pub struct WorkerContext {
    script_source: String,
    inbox: mpsc::Receiver<String>,
    outbox: mpsc::Sender<WorkerEvent>,
}

impl WorkerContext {
    pub fn script_source(&self) -> &str {
        &self.script_source
    }

    /// Blocks for the next message; `None` once the worker is closed.
    pub fn recv(&self) -> Option<String> {
        self.inbox.recv().ok()
    }

    pub fn try_recv(&self) -> Option<String> {
        self.inbox.try_recv().ok()
    }

    pub fn post_message(&self, data: &str) {
        let _ = self.outbox.send(WorkerEvent::Message(data.to_string()));
    }

    /// Fetches through the replay engine, blocking until the host services
    /// the request via [`Replayer::pump_workers`].
    pub fn fetch(&self, reference: &str) -> std::result::Result<Response, String> {
        let (tx, rx) = mpsc::channel();
        self.outbox
            .send(WorkerEvent::Fetch { reference: reference.to_string(), reply: tx })
            .map_err(|_| "worker host gone".to_string())?;
        rx.recv().map_err(|_| "worker host gone".to_string())
    }
}

/// Consumer-supplied behavior of a worker. The engine resolves and fetches
/// the script source; the body decides what to do with it.
pub trait WorkerBody: Send {
    fn run(self: Box<Self>, ctx: WorkerContext);
}

enum WorkerState {
    Initializing {
        body: Box<dyn WorkerBody>,
        queued: Vec<String>,
    },
    Ready {
        inbox: Option<mpsc::Sender<String>>,
        events: mpsc::Receiver<WorkerEvent>,
        handle: std::thread::JoinHandle<()>,
    },
    Done,
}

struct WorkerSlot {
    context: Url,
    source: String,
    state: WorkerState,
    messages: Vec<String>,
}

#[derive(Debug)]
struct FrameWindow {
    location: Url,
    suppressed: HashMap<ConsoleLevel, usize>,
}

/// The replay engine. Owns the DOM arena, the content fetcher, and all
/// per-frame state; every operation of the patched page surface goes through
/// it.
pub struct Replayer {
    dom: Dom,
    fetcher: ContentFetcher,
    config: ReplayConfig,
    host_root: Option<NodeId>,
    host_frame: Option<NodeId>,
    host_address: Option<Url>,
    patch_states: HashMap<NodeId, PatchState>,
    srcdoc_seen: HashMap<NodeId, Option<String>>,
    frame_contexts: HashMap<NodeId, Url>,
    windows: HashMap<NodeId, FrameWindow>,
    /// Document or shadow root to the iframe element owning it.
    owner_frame: HashMap<NodeId, NodeId>,
    covered: HashSet<NodeId>,
    registry: MutationRegistry,
    hub: WebSocketHub,
    sockets: Vec<SocketState>,
    workers: Vec<WorkerSlot>,
    xhr_handlers: Vec<(fancy_regex::Regex, XhrHandler)>,
    posted: Vec<PostedMessage>,
    dropped_posts: usize,
}

impl Replayer {
    pub fn new(fetcher: ContentFetcher, mut config: ReplayConfig) -> Self {
        let mut hub = WebSocketHub::default();
        if let Some(setup) = config.web_socket_setup.take() {
            setup(&mut hub);
        }
        Self {
            dom: Dom::new(),
            fetcher,
            config,
            host_root: None,
            host_frame: None,
            host_address: None,
            patch_states: HashMap::new(),
            srcdoc_seen: HashMap::new(),
            frame_contexts: HashMap::new(),
            windows: HashMap::new(),
            owner_frame: HashMap::new(),
            covered: HashSet::new(),
            registry: MutationRegistry::new(),
            hub,
            sockets: Vec::new(),
            workers: Vec::new(),
            xhr_handlers: Vec::new(),
            posted: Vec::new(),
            dropped_posts: 0,
        }
    }

    pub fn fetcher(&self) -> &ContentFetcher {
        &self.fetcher
    }

    pub fn fetcher_mut(&mut self) -> &mut ContentFetcher {
        &mut self.fetcher
    }

    pub fn web_socket_hub_mut(&mut self) -> &mut WebSocketHub {
        &mut self.hub
    }

    /// Builds the host document around a single bootstrap iframe addressed
    /// at `address` and patches it.
    pub fn attach(&mut self, address: &str) -> Result<FrameId> {
        let host_address =
            Url::parse(address).map_err(|err| Error::MalformedUrl(format!("{address}: {err}")))?;
        self.host_address = Some(host_address);

        let markup = format!(
            "<iframe patched-src=\"{}\" width=\"100%\" height=\"100%\" \
             allowfullscreen=\"allowfullscreen\" frameborder=\"0\"></iframe>",
            escape_html_attr(address)
        );
        let root = self.dom.parse_document(&markup)?;
        self.host_root = Some(root);
        self.registry.observe(root);

        let iframe = self
            .dom
            .elements_by_tag(root, "iframe")
            .first()
            .copied()
            .ok_or_else(|| Error::PatchFailed {
                frame: address.to_string(),
                reason: "bootstrap markup produced no iframe".to_string(),
            })?;
        self.host_frame = Some(iframe);
        self.patch_iframe(FrameId(iframe))?;

        if let Some(mut hook) = self.config.on_load.take() {
            hook(self, FrameId(iframe));
            if self.config.on_load.is_none() {
                self.config.on_load = Some(hook);
            }
        }
        Ok(FrameId(iframe))
    }

    pub fn host_frame(&self) -> Option<FrameId> {
        self.host_frame.map(FrameId)
    }

    pub fn host_html(&self) -> Option<String> {
        self.host_root.map(|root| self.dom.to_html(root))
    }

    /// Patches one iframe: resolves its source, fetches and rewrites the
    /// content, writes it as the frame's document, and wires up tracking.
    /// A frame that is already patched with an unchanged `srcdoc` is left
    /// alone.
    pub fn patch_iframe(&mut self, frame: FrameId) -> Result<()> {
        let node = frame.0;
        if self.dom.tag_name(node) != Some("iframe") {
            return Err(Error::PatchFailed {
                frame: format!("{frame:?}"),
                reason: "patch target is not an iframe".to_string(),
            });
        }

        let srcdoc = self.dom.attr(node, "srcdoc").map(ToOwned::to_owned);
        if self.patch_states.get(&node) == Some(&PatchState::Patched)
            && self.srcdoc_seen.get(&node) == Some(&srcdoc)
        {
            return Ok(());
        }
        self.patch_states.insert(node, PatchState::Patching);

        let inherited = self.inherited_context(node);
        let source = self
            .dom
            .attr(node, "src")
            .or_else(|| self.dom.attr(node, "patched-src"))
            .map(ToOwned::to_owned);

        let (content, context, fragment) = if let Some(reference) = source {
            self.dom.set_attr(node, "patched-src", &reference);
            self.dom.remove_attr(node, "src");
            let resolved = self
                .fetcher
                .resolver_mut()
                .resolve_maybe(&reference, inherited.as_ref())?;
            let fragment = resolved.fragment().map(ToOwned::to_owned);
            let response = match self.fetcher.fetch_url(&resolved, &FetchInit::default()) {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(url = %resolved, error = %err, "frame source unreachable, loading empty document");
                    Response::not_found()
                }
            };
            (response.text(), resolved, fragment)
        } else if let Some(doc) = srcdoc.clone() {
            let context = inherited.ok_or_else(|| Error::PatchFailed {
                frame: format!("{frame:?}"),
                reason: "srcdoc frame has no inherited context".to_string(),
            })?;
            (doc, context, None)
        } else {
            let context = inherited.ok_or_else(|| Error::PatchFailed {
                frame: format!("{frame:?}"),
                reason: "frame has no source and no context".to_string(),
            })?;
            (String::new(), context, None)
        };
        self.srcdoc_seen.insert(node, srcdoc);

        let rewritten = rewrite_document(&mut self.fetcher, &content, &context)?;
        let html = match self.config.html_post_process.take() {
            Some(mut post) => {
                let html = post(rewritten.html);
                if self.config.html_post_process.is_none() {
                    self.config.html_post_process = Some(post);
                }
                html
            }
            None => rewritten.html,
        };

        let content_root = self.dom.parse_document(&html)?;
        if let Some(element) = self.dom.element_mut(node) {
            element.content_document = Some(content_root);
        }
        self.owner_frame.insert(content_root, node);
        self.frame_contexts.insert(node, rewritten.context_url.clone());

        let mut location = rewritten.context_url;
        if fragment.is_some() {
            location.set_fragment(fragment.as_deref());
        }
        self.windows
            .insert(node, FrameWindow { location, suppressed: HashMap::new() });

        self.registry.observe(content_root);
        self.patch_states.insert(node, PatchState::Patched);
        self.dom.set_attr(node, "patched", "true");

        if let Some(mut hook) = self.config.on_iframe_patch.take() {
            let result = hook(self, frame);
            if self.config.on_iframe_patch.is_none() {
                self.config.on_iframe_patch = Some(hook);
            }
            result?;
        }

        // Rewriting left nested iframes with only the shadow attribute; load
        // them now.
        for nested in self.dom.elements_by_tag(content_root, "iframe") {
            if let Err(err) = self.patch_iframe(FrameId(nested)) {
                tracing::warn!(error = %err, "nested frame patch failed, leaving frame unloaded");
            }
        }
        Ok(())
    }

    pub fn patch_state(&self, frame: FrameId) -> PatchState {
        self.patch_states
            .get(&frame.0)
            .copied()
            .unwrap_or(PatchState::Unpatched)
    }

    pub fn frame_html(&self, frame: FrameId) -> Option<String> {
        let root = self.dom.element(frame.0)?.content_document?;
        Some(self.dom.to_html(root))
    }

    pub fn frame_location(&self, frame: FrameId) -> Option<&Url> {
        self.windows.get(&frame.0).map(|window| &window.location)
    }

    /// The frame's document node, usable as an append target and selector
    /// scope.
    pub fn document_scope(&self, frame: FrameId) -> Option<ElementId> {
        self.dom.element(frame.0)?.content_document.map(ElementId)
    }

    pub fn as_frame(&self, element: ElementId) -> Option<FrameId> {
        (self.dom.tag_name(element.0) == Some("iframe")).then(|| FrameId(element.0))
    }

    fn inherited_context(&self, node: NodeId) -> Option<Url> {
        let root = self.dom.tree_root(node);
        if let Some(owner) = self.owner_frame.get(&root) {
            if let Some(context) = self.frame_contexts.get(owner) {
                return Some(context.clone());
            }
        }
        self.host_address.clone()
    }

    fn frame_base(&self, frame: FrameId) -> Option<Url> {
        self.frame_contexts
            .get(&frame.0)
            .cloned()
            .or_else(|| self.host_address.clone())
    }

    fn is_covered(&self, node: NodeId) -> bool {
        match self.config.tag_patch_strategy {
            TagPatchStrategy::Prototype => true,
            TagPatchStrategy::CreateElement => self.covered.contains(&node),
        }
    }

    /// Creates a detached element through the patched document surface. The
    /// element is covered by attribute interception regardless of strategy.
    pub fn create_element(&mut self, frame: FrameId, tag: &str) -> Result<ElementId> {
        if !self.windows.contains_key(&frame.0) {
            return Err(Error::PatchFailed {
                frame: format!("{frame:?}"),
                reason: "frame has no document".to_string(),
            });
        }
        let node = self.dom.create_detached_element(tag);
        self.covered.insert(node);
        Ok(ElementId(node))
    }

    pub fn append_element(&mut self, parent: ElementId, child: ElementId) {
        self.dom.append_child(parent.0, child.0);
        self.registry.enqueue(
            &self.dom,
            MutationRecord {
                target: parent.0,
                added: vec![child.0],
                kind: MutationKind::ChildList,
            },
        );
    }

    /// Attaches a shadow tree to `host` and tracks it like a frame document.
    pub fn attach_shadow(&mut self, host: ElementId) -> Result<ElementId> {
        let root = self.dom.create_document();
        let Some(element) = self.dom.element_mut(host.0) else {
            return Err(Error::PatchFailed {
                frame: format!("{host:?}"),
                reason: "shadow host is not an element".to_string(),
            });
        };
        element.shadow_root = Some(root);
        let host_tree = self.dom.tree_root(host.0);
        if let Some(owner) = self.owner_frame.get(&host_tree).copied() {
            self.owner_frame.insert(root, owner);
        }
        self.registry.observe(root);
        Ok(ElementId(root))
    }

    /// Intercepted attribute write. Covered iframes re-patch on `src`
    /// without ever setting the native attribute; covered resource elements
    /// localize the value and keep the original in the shadow attribute;
    /// everything else is a raw write that the mutation tracker picks up.
    pub fn set_attribute(&mut self, element: ElementId, name: &str, value: &str) -> Result<()> {
        let node = element.0;
        let Some(tag) = self.dom.tag_name(node).map(ToOwned::to_owned) else {
            return Err(Error::PatchFailed {
                frame: format!("{element:?}"),
                reason: "attribute target is not an element".to_string(),
            });
        };
        let covered = self.is_covered(node);

        if covered && tag == "iframe" && name == "src" {
            // Patched right here; no record, or the drain would run the
            // whole sequence a second time for the same write.
            self.dom.set_attr(node, "patched-src", value);
            self.srcdoc_seen.remove(&node);
            return self.patch_iframe(FrameId(node));
        }

        if covered && is_resource_attr(&tag, name) {
            self.dom.set_attr(node, name, value);
            self.localize_attr(node, name);
            self.record_attr_mutation(node, name);
            return Ok(());
        }

        self.dom.set_attr(node, name, value);
        self.record_attr_mutation(node, name);
        Ok(())
    }

    /// Intercepted attribute read: covered elements answer `src`/`href` with
    /// the original reference from the shadow attribute.
    pub fn get_attribute(&self, element: ElementId, name: &str) -> Option<String> {
        let node = element.0;
        if matches!(name, "src" | "href") && self.is_covered(node) {
            if let Some(shadow) = self.dom.attr(node, &format!("patched-{name}")) {
                return Some(shadow.to_string());
            }
        }
        self.dom.attr(node, name).map(ToOwned::to_owned)
    }

    /// Selector query against a frame's document. `src`/`href` attribute
    /// conditions are rewritten to their shadow attributes so callers match
    /// on the references the page was authored with.
    pub fn query_selector(&self, frame: FrameId, selector: &str) -> Result<Vec<ElementId>> {
        let root = self
            .dom
            .element(frame.0)
            .and_then(|element| element.content_document)
            .ok_or_else(|| Error::PatchFailed {
                frame: format!("{frame:?}"),
                reason: "frame has no document".to_string(),
            })?;

        let mut groups = parse_selector_groups(selector)?;
        for chain in &mut groups {
            for part in chain {
                for condition in &mut part.step.attrs {
                    let key = match condition {
                        SelectorAttrCondition::Exists { key }
                        | SelectorAttrCondition::Eq { key, .. }
                        | SelectorAttrCondition::StartsWith { key, .. }
                        | SelectorAttrCondition::EndsWith { key, .. }
                        | SelectorAttrCondition::Contains { key, .. } => key,
                    };
                    let shadow = match key.as_str() {
                        "src" => Some("patched-src"),
                        "href" => Some("patched-href"),
                        _ => None,
                    };
                    if let Some(shadow) = shadow {
                        *key = shadow.to_string();
                    }
                }
            }
        }
        Ok(select_all_parsed(&self.dom, root, &groups)
            .into_iter()
            .map(ElementId)
            .collect())
    }

    fn record_attr_mutation(&mut self, node: NodeId, name: &str) {
        self.registry.enqueue(
            &self.dom,
            MutationRecord {
                target: node,
                added: Vec::new(),
                kind: MutationKind::Attributes { name: name.to_string() },
            },
        );
    }

    fn localize_attr(&mut self, node: NodeId, name: &str) {
        let Some(value) = self.dom.attr(node, name).map(ToOwned::to_owned) else {
            return;
        };
        if value.starts_with("local:") {
            return;
        }
        let Some(context) = self.inherited_context(node) else {
            return;
        };
        let local = self.fetcher.resource_url(&value, &context);
        self.dom.set_attr(node, name, &local);
        self.dom.set_attr(node, &format!("patched-{name}"), &value);
    }

    /// Number of document and shadow trees under mutation tracking.
    pub fn observed_tree_count(&self) -> usize {
        self.registry.observer_count()
    }

    /// Processes queued mutation records. Failures are logged and never
    /// propagate; a broken mutation must not take down the page.
    pub fn drain_mutations(&mut self) -> usize {
        let mut processed = 0;
        // Patching can enqueue follow-up records; bounded so a pathological
        // page cannot spin forever.
        for _ in 0..8 {
            if !self.registry.has_pending() {
                break;
            }
            for record in self.registry.take_batches() {
                processed += 1;
                if let Err(err) = self.apply_mutation(&record) {
                    tracing::error!(error = %err, "mutation handling failed");
                }
            }
        }
        processed
    }

    fn apply_mutation(&mut self, record: &MutationRecord) -> Result<()> {
        match &record.kind {
            MutationKind::Attributes { name } => {
                self.apply_attribute_mutation(record.target, name)
            }
            MutationKind::ChildList => {
                for added in &record.added {
                    self.adopt_subtree(*added)?;
                }
                Ok(())
            }
        }
    }

    fn apply_attribute_mutation(&mut self, target: NodeId, name: &str) -> Result<()> {
        let Some(tag) = self.dom.tag_name(target).map(ToOwned::to_owned) else {
            return Ok(());
        };
        if tag == "iframe" && matches!(name, "src" | "patched-src" | "srcdoc") {
            if let Some(src) = self.dom.attr(target, "src").map(ToOwned::to_owned) {
                self.dom.set_attr(target, "patched-src", &src);
                self.dom.remove_attr(target, "src");
            }
            self.srcdoc_seen.remove(&target);
            return self.patch_iframe(FrameId(target));
        }
        if is_resource_attr(&tag, name) {
            self.localize_attr(target, name);
        }
        Ok(())
    }

    fn adopt_subtree(&mut self, node: NodeId) -> Result<()> {
        let mut nodes = vec![node];
        nodes.extend(self.dom.descendants(node));
        for id in nodes {
            let Some(tag) = self.dom.tag_name(id).map(ToOwned::to_owned) else {
                continue;
            };
            match tag.as_str() {
                "iframe" => {
                    if let Some(src) = self.dom.attr(id, "src").map(ToOwned::to_owned) {
                        self.dom.set_attr(id, "patched-src", &src);
                        self.dom.remove_attr(id, "src");
                    }
                    if self.dom.attr(id, "patched-src").is_some()
                        || self.dom.attr(id, "srcdoc").is_some()
                    {
                        self.patch_iframe(FrameId(id))?;
                    }
                }
                "link" => {
                    if let Some(context) = self.inherited_context(id) {
                        patch_link_element(&mut self.dom, &mut self.fetcher, id, &context);
                    }
                }
                "img" | "script" => self.localize_attr(id, "src"),
                _ => {}
            }
        }
        Ok(())
    }

    /// Patched `fetch`: resolves against the frame's context, offers the
    /// request to the configured proxy, then routes through the archive.
    pub fn patched_fetch(
        &mut self,
        frame: FrameId,
        reference: &str,
        init: FetchInit,
    ) -> Result<Response> {
        let base = self.frame_base(frame);
        let url = self
            .fetcher
            .resolver_mut()
            .resolve_maybe(reference, base.as_ref())?;
        self.routed_fetch(&url, &init, base.as_ref())
    }

    fn routed_fetch(&mut self, url: &Url, init: &FetchInit, base: Option<&Url>) -> Result<Response> {
        if let Some(mut proxy) = self.config.fetch_proxy.take() {
            let request = FetchProxyRequest {
                url: url.clone(),
                init: init.clone(),
                base: base.cloned(),
            };
            let outcome = proxy(&request, &mut self.fetcher);
            if self.config.fetch_proxy.is_none() {
                self.config.fetch_proxy = Some(proxy);
            }
            if let Some(result) = outcome {
                return result;
            }
        }
        self.fetcher.fetch_url(url, init)
    }

    /// Registers an XHR handler tried before the default archive route.
    /// Handlers are matched against the resolved URL in registration order.
    pub fn add_xhr_handler(&mut self, pattern: &str, handler: XhrHandler) -> Result<()> {
        let regex = fancy_regex::Regex::new(pattern)
            .map_err(|err| Error::InvalidPattern(format!("{pattern}: {err}")))?;
        self.xhr_handlers.push((regex, handler));
        Ok(())
    }

    /// Patched `XMLHttpRequest` send.
    pub fn xhr_request(
        &mut self,
        frame: FrameId,
        method: &str,
        reference: &str,
        response_type: XhrResponseType,
    ) -> Result<XhrOutcome> {
        let base = self.frame_base(frame);
        let url = self
            .fetcher
            .resolver_mut()
            .resolve_maybe(reference, base.as_ref())?;
        let init = FetchInit { method: method.to_ascii_uppercase(), ..FetchInit::default() };

        let mut handled = None;
        let text = url.to_string();
        for (pattern, handler) in self.xhr_handlers.iter_mut() {
            if matches!(pattern.is_match(&text), Ok(true)) {
                if let Some(response) = handler(&url, &init) {
                    handled = Some(response);
                    break;
                }
            }
        }
        let response = match handled {
            Some(response) => response,
            None => self.routed_fetch(&url, &init, base.as_ref())?,
        };

        Ok(match response_type {
            XhrResponseType::Text => XhrOutcome {
                status: response.status,
                status_text: response.status_text.clone(),
                response_text: Some(response.text()),
                response_bytes: None,
            },
            XhrResponseType::ArrayBuffer => XhrOutcome {
                status: response.status,
                status_text: response.status_text,
                response_text: None,
                response_bytes: Some(response.body),
            },
        })
    }

    /// Patched `postMessage`. The target origin is always forced to the
    /// wildcard; the strategy decides the destination frame.
    pub fn post_message(&mut self, from: FrameId, data: &str, target_origin: &str) {
        if target_origin != "*" {
            tracing::debug!(target_origin, "target origin forced to wildcard");
        }
        let to = match self.config.post_message_strategy {
            PostMessageStrategy::Disabled => {
                self.dropped_posts += 1;
                tracing::debug!(data, "message dropped, routing disabled");
                return;
            }
            PostMessageStrategy::Top => self.host_frame.map(FrameId),
            PostMessageStrategy::Target => {
                let root = self.dom.tree_root(from.0);
                self.owner_frame
                    .get(&root)
                    .copied()
                    .map(FrameId)
                    .or_else(|| self.host_frame.map(FrameId))
            }
        };
        self.posted.push(PostedMessage {
            from,
            to,
            origin: "*".to_string(),
            data: data.to_string(),
        });
    }

    pub fn take_posted_messages(&mut self) -> Vec<PostedMessage> {
        std::mem::take(&mut self.posted)
    }

    pub fn dropped_message_count(&self) -> usize {
        self.dropped_posts
    }

    /// Patched console call: output is suppressed and counted per frame.
    pub fn console(&mut self, frame: FrameId, level: ConsoleLevel, message: &str) {
        tracing::debug!(level = level.as_str(), message, "console output suppressed");
        if let Some(window) = self.windows.get_mut(&frame.0) {
            *window.suppressed.entry(level).or_insert(0) += 1;
        }
    }

    pub fn suppressed_console_count(&self, frame: FrameId, level: ConsoleLevel) -> usize {
        self.windows
            .get(&frame.0)
            .and_then(|window| window.suppressed.get(&level))
            .copied()
            .unwrap_or(0)
    }

    /// Patched `WebSocket` constructor.
    pub fn web_socket_connect(&mut self, frame: FrameId, reference: &str) -> Result<SocketId> {
        let base = self.frame_base(frame);
        let url = self
            .fetcher
            .resolver_mut()
            .resolve_maybe(reference, base.as_ref())?;
        let url = url.to_string();
        if !self.hub.has_server(&url) {
            tracing::warn!(%url, "no mock server registered for socket endpoint");
        }
        self.sockets.push(SocketState { url, received: Vec::new() });
        Ok(SocketId(self.sockets.len() - 1))
    }

    pub fn socket_send(&mut self, socket: SocketId, message: &str) {
        let Some(url) = self.sockets.get(socket.0).map(|slot| slot.url.clone()) else {
            tracing::warn!(socket = socket.0, "send on unknown socket");
            return;
        };
        if let Some(replies) = self.hub.reply(&url, message) {
            self.sockets[socket.0].received.extend(replies);
        }
    }

    pub fn socket_take_received(&mut self, socket: SocketId) -> Vec<String> {
        self.sockets
            .get_mut(socket.0)
            .map(|slot| std::mem::take(&mut slot.received))
            .unwrap_or_default()
    }

    /// Patched `Worker` constructor: resolves and fetches the script source,
    /// then holds the body in the initializing state until the next pump.
    /// Messages posted before then are queued.
    pub fn create_worker(
        &mut self,
        frame: FrameId,
        reference: &str,
        body: Box<dyn WorkerBody>,
    ) -> Result<WorkerId> {
        let base = self.frame_base(frame);
        let url = self
            .fetcher
            .resolver_mut()
            .resolve_maybe(reference, base.as_ref())?;
        let source = match self.fetcher.fetch_url(&url, &FetchInit::default()) {
            Ok(response) => response.text(),
            Err(err) => {
                tracing::warn!(%url, error = %err, "worker source unreachable, starting empty");
                String::new()
            }
        };
        self.workers.push(WorkerSlot {
            context: url,
            source,
            state: WorkerState::Initializing { body, queued: Vec::new() },
            messages: Vec::new(),
        });
        Ok(WorkerId(self.workers.len() - 1))
    }

    pub fn worker_post_message(&mut self, worker: WorkerId, data: &str) {
        let Some(slot) = self.workers.get_mut(worker.0) else {
            tracing::warn!(worker = worker.0, "message to unknown worker");
            return;
        };
        match &mut slot.state {
            WorkerState::Initializing { queued, .. } => queued.push(data.to_string()),
            WorkerState::Ready { inbox: Some(tx), .. } => {
                if tx.send(data.to_string()).is_err() {
                    tracing::warn!(worker = worker.0, "worker inbox closed");
                }
            }
            _ => tracing::warn!(worker = worker.0, "worker not accepting messages"),
        }
    }

    pub fn worker_source(&self, worker: WorkerId) -> Option<&str> {
        self.workers.get(worker.0).map(|slot| slot.source.as_str())
    }

    pub fn worker_take_messages(&mut self, worker: WorkerId) -> Vec<String> {
        self.workers
            .get_mut(worker.0)
            .map(|slot| std::mem::take(&mut slot.messages))
            .unwrap_or_default()
    }

    /// Spawns initializing workers, flushes their queued messages, and
    /// services outstanding worker events, including fetch round-trips.
    pub fn pump_workers(&mut self) {
        for slot in &mut self.workers {
            if matches!(slot.state, WorkerState::Initializing { .. }) {
                let state = std::mem::replace(&mut slot.state, WorkerState::Done);
                if let WorkerState::Initializing { body, queued } = state {
                    let (in_tx, in_rx) = mpsc::channel();
                    let (out_tx, out_rx) = mpsc::channel();
                    let ctx = WorkerContext {
                        script_source: slot.source.clone(),
                        inbox: in_rx,
                        outbox: out_tx,
                    };
                    let handle = std::thread::spawn(move || body.run(ctx));
                    for message in queued {
                        let _ = in_tx.send(message);
                    }
                    slot.state = WorkerState::Ready {
                        inbox: Some(in_tx),
                        events: out_rx,
                        handle,
                    };
                }
            }
        }
        self.service_worker_events();
    }

    fn service_worker_events(&mut self) {
        let mut pending: Vec<(usize, WorkerEvent)> = Vec::new();
        for (index, slot) in self.workers.iter().enumerate() {
            if let WorkerState::Ready { events, .. } = &slot.state {
                while let Ok(event) = events.try_recv() {
                    pending.push((index, event));
                }
            }
        }
        for (index, event) in pending {
            match event {
                WorkerEvent::Message(data) => self.workers[index].messages.push(data),
                WorkerEvent::Fetch { reference, reply } => {
                    let context = self.workers[index].context.clone();
                    let response =
                        match self.fetcher.fetch_reference(&reference, &context, &FetchInit::default()) {
                            Ok(response) => response,
                            Err(err) => Response {
                                status: 502,
                                status_text: err.to_string(),
                                body: Vec::new(),
                            },
                        };
                    let _ = reply.send(response);
                }
            }
        }
    }

    /// Closes a worker's inbox so its next blocking receive returns `None`.
    pub fn close_worker(&mut self, worker: WorkerId) {
        if let Some(slot) = self.workers.get_mut(worker.0) {
            if let WorkerState::Ready { inbox, .. } = &mut slot.state {
                *inbox = None;
            }
        }
    }

    /// Shuts every worker down: closes inboxes, keeps servicing fetch
    /// round-trips until the threads exit, then collects their final
    /// messages. A worker that ignores shutdown is detached after a grace
    /// period.
    pub fn join_workers(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            self.pump_workers();
            for slot in &mut self.workers {
                if let WorkerState::Ready { inbox, .. } = &mut slot.state {
                    *inbox = None;
                }
            }
            let busy = self.workers.iter().any(|slot| {
                matches!(&slot.state, WorkerState::Ready { handle, .. } if !handle.is_finished())
            });
            if !busy || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        for index in 0..self.workers.len() {
            if !matches!(self.workers[index].state, WorkerState::Ready { .. }) {
                continue;
            }
            let state = std::mem::replace(&mut self.workers[index].state, WorkerState::Done);
            if let WorkerState::Ready { events, handle, .. } = state {
                if handle.is_finished() {
                    let _ = handle.join();
                } else {
                    tracing::warn!(worker = index, "worker did not shut down, detaching");
                }
                while let Ok(event) = events.try_recv() {
                    match event {
                        WorkerEvent::Message(data) => self.workers[index].messages.push(data),
                        WorkerEvent::Fetch { reply, .. } => {
                            let _ = reply.send(Response::not_found());
                        }
                    }
                }
            }
        }
    }
}

fn is_resource_attr(tag: &str, name: &str) -> bool {
    matches!((tag, name), ("img", "src") | ("script", "src") | ("link", "href"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn replayer_with(pairs: &[(&str, &str)]) -> Replayer {
        replayer_with_config(pairs, ReplayConfig::default())
    }

    fn replayer_with_config(pairs: &[(&str, &str)], config: ReplayConfig) -> Replayer {
        let mut resolver = UrlResolver::new();
        resolver.set_proxy_hook(Box::new(|url| {
            let host = url.host_str()?;
            if url.scheme() == "ws" || url.scheme() == "wss" {
                return None;
            }
            Url::parse(&format!("zip:/{host}{}", url.path())).ok()
        }));
        Replayer::new(
            ContentFetcher::new(resolver, ResourceMap::from_pairs(pairs)),
            config,
        )
    }

    #[test]
    fn attach_patches_the_bootstrap_frame() -> Result<()> {
        let mut r = replayer_with(&[("example.com/index.html", "<h1>Hi</h1>")]);
        let frame = r.attach("http://example.com/index.html")?;
        assert_eq!(r.patch_state(frame), PatchState::Patched);
        assert_eq!(r.get_attribute(ElementId(frame.0), "patched"), Some("true".into()));
        assert_eq!(
            r.get_attribute(ElementId(frame.0), "patched-src"),
            Some("http://example.com/index.html".into())
        );
        assert!(r.frame_html(frame).unwrap().contains("<h1>Hi</h1>"));
        Ok(())
    }

    #[test]
    fn repeated_patch_with_unchanged_srcdoc_is_a_noop() -> Result<()> {
        let calls = Rc::new(RefCell::new(0usize));
        let seen = calls.clone();
        let config = ReplayConfig {
            on_iframe_patch: Some(Box::new(move |_, _| {
                *seen.borrow_mut() += 1;
                Ok(())
            })),
            ..ReplayConfig::default()
        };
        let mut r = replayer_with_config(&[("example.com/index.html", "<h1>Hi</h1>")], config);
        let frame = r.attach("http://example.com/index.html")?;
        assert_eq!(*calls.borrow(), 1);
        let observers = r.observed_tree_count();

        r.patch_iframe(frame)?;
        assert_eq!(*calls.borrow(), 1, "patch hook must not fire again");
        assert_eq!(r.observed_tree_count(), observers);
        Ok(())
    }

    #[test]
    fn drain_after_covered_src_write_patches_only_once() -> Result<()> {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = calls.clone();
        let config = ReplayConfig {
            on_iframe_patch: Some(Box::new(move |r, frame| {
                let src = r.get_attribute(ElementId(frame.0), "src").unwrap_or_default();
                seen.borrow_mut().push(src);
                Ok(())
            })),
            ..ReplayConfig::default()
        };
        let mut r = replayer_with_config(
            &[
                ("example.com/one.html", "<p>one</p>"),
                ("example.com/two.html", "<p>two</p>"),
            ],
            config,
        );
        let frame = r.attach("http://example.com/one.html")?;
        r.set_attribute(ElementId(frame.0), "src", "http://example.com/two.html")?;
        assert_eq!(
            *calls.borrow(),
            vec![
                "http://example.com/one.html".to_string(),
                "http://example.com/two.html".to_string(),
            ]
        );

        // The intercepted write already ran the sequence; the drain must not
        // run it again for the same change.
        r.drain_mutations();
        assert_eq!(calls.borrow().len(), 2, "drain re-patched an unchanged frame");
        assert!(r.frame_html(frame).unwrap().contains("<p>two</p>"));
        Ok(())
    }

    #[test]
    fn missing_archive_page_degrades_to_empty_document() -> Result<()> {
        let mut r = replayer_with(&[]);
        let frame = r.attach("http://example.com/missing.html")?;
        assert_eq!(r.patch_state(frame), PatchState::Patched);
        assert_eq!(r.frame_html(frame).unwrap(), "");
        Ok(())
    }

    #[test]
    fn setting_src_forces_repatch_without_native_write() -> Result<()> {
        let mut r = replayer_with(&[
            ("example.com/one.html", "<p>one</p>"),
            ("example.com/two.html", "<p>two</p>"),
        ]);
        let frame = r.attach("http://example.com/one.html")?;
        r.set_attribute(ElementId(frame.0), "src", "http://example.com/two.html")?;
        assert_eq!(r.dom.attr(frame.0, "src"), None, "native src must stay unset");
        assert_eq!(
            r.dom.attr(frame.0, "patched-src"),
            Some("http://example.com/two.html")
        );
        assert!(r.frame_html(frame).unwrap().contains("<p>two</p>"));
        Ok(())
    }

    #[test]
    fn create_element_strategy_leaves_uncovered_writes_raw() -> Result<()> {
        let config = ReplayConfig {
            tag_patch_strategy: TagPatchStrategy::CreateElement,
            ..ReplayConfig::default()
        };
        let mut r = replayer_with_config(
            &[
                ("example.com/one.html", "<p>one</p>"),
                ("example.com/two.html", "<p>two</p>"),
            ],
            config,
        );
        let frame = r.attach("http://example.com/one.html")?;

        // The bootstrap frame was not created through create_element, so the
        // write is not intercepted.
        r.set_attribute(ElementId(frame.0), "src", "http://example.com/two.html")?;
        assert_eq!(
            r.dom.attr(frame.0, "src"),
            Some("http://example.com/two.html"),
            "uncovered write goes through raw"
        );
        assert!(r.frame_html(frame).unwrap().contains("<p>one</p>"));

        // The mutation tracker is the safety net for the coverage gap.
        r.drain_mutations();
        assert_eq!(r.dom.attr(frame.0, "src"), None);
        assert!(r.frame_html(frame).unwrap().contains("<p>two</p>"));
        Ok(())
    }

    #[test]
    fn created_elements_are_covered_and_read_transparent() -> Result<()> {
        let config = ReplayConfig {
            tag_patch_strategy: TagPatchStrategy::CreateElement,
            ..ReplayConfig::default()
        };
        let mut r = replayer_with_config(
            &[
                ("example.com/index.html", "<h1>Hi</h1>"),
                ("example.com/a.png", "png"),
            ],
            config,
        );
        let frame = r.attach("http://example.com/index.html")?;
        let img = r.create_element(frame, "img")?;
        r.set_attribute(img, "src", "a.png")?;
        assert!(r.dom.attr(img.0, "src").unwrap().starts_with("local:"));
        assert_eq!(r.dom.attr(img.0, "patched-src"), Some("a.png"));
        assert_eq!(r.get_attribute(img, "src"), Some("a.png".into()));
        Ok(())
    }

    #[test]
    fn query_selector_matches_original_references() -> Result<()> {
        let mut r = replayer_with(&[
            ("example.com/index.html", "<img src=\"a.png\">"),
            ("example.com/a.png", "png"),
        ]);
        let frame = r.attach("http://example.com/index.html")?;
        let hits = r.query_selector(frame, "img[src='a.png']")?;
        assert_eq!(hits.len(), 1);
        assert_eq!(r.get_attribute(hits[0], "src"), Some("a.png".into()));
        Ok(())
    }

    #[test]
    fn nested_iframes_patch_recursively() -> Result<()> {
        let mut r = replayer_with(&[
            (
                "example.com/index.html",
                "<iframe src=\"http://example.com/inner.html\"></iframe>",
            ),
            ("example.com/inner.html", "<p>inner</p>"),
        ]);
        let frame = r.attach("http://example.com/index.html")?;
        let nested = r.query_selector(frame, "iframe")?;
        assert_eq!(nested.len(), 1);
        let nested = r.as_frame(nested[0]).unwrap();
        assert_eq!(r.patch_state(nested), PatchState::Patched);
        assert!(r.frame_html(nested).unwrap().contains("<p>inner</p>"));
        Ok(())
    }

    #[test]
    fn srcdoc_frames_inherit_context_and_repatch_on_change() -> Result<()> {
        let mut r = replayer_with(&[("example.com/index.html", "<h1>Hi</h1>")]);
        let frame = r.attach("http://example.com/index.html")?;
        let scope = r.document_scope(frame).unwrap();

        let child = r.create_element(frame, "iframe")?;
        r.set_attribute(child, "srcdoc", "<p>first</p>")?;
        r.append_element(scope, child);
        r.drain_mutations();

        let child_frame = r.as_frame(child).unwrap();
        assert_eq!(r.patch_state(child_frame), PatchState::Patched);
        assert!(r.frame_html(child_frame).unwrap().contains("<p>first</p>"));
        assert_eq!(
            r.frame_location(child_frame).unwrap().as_str(),
            "http://example.com/index.html"
        );

        r.set_attribute(child, "srcdoc", "<p>second</p>")?;
        r.drain_mutations();
        assert!(r.frame_html(child_frame).unwrap().contains("<p>second</p>"));
        Ok(())
    }

    #[test]
    fn mutation_added_stylesheet_link_is_inlined() -> Result<()> {
        let mut r = replayer_with(&[
            ("example.com/index.html", "<h1>Hi</h1>"),
            ("example.com/s.css", "body{color:red}"),
        ]);
        let frame = r.attach("http://example.com/index.html")?;
        let scope = r.document_scope(frame).unwrap();

        let link = r.create_element(frame, "link")?;
        r.set_attribute(link, "rel", "stylesheet")?;
        r.set_attribute(link, "href", "s.css")?;
        r.append_element(scope, link);
        r.drain_mutations();

        assert!(r.frame_html(frame).unwrap().contains("<style>body{color:red}</style>"));
        Ok(())
    }

    #[test]
    fn shadow_tree_mutations_are_tracked() -> Result<()> {
        let mut r = replayer_with(&[
            ("example.com/index.html", "<div id=\"host\"></div>"),
            ("example.com/s.css", "p{margin:0}"),
        ]);
        let frame = r.attach("http://example.com/index.html")?;
        let host = r.query_selector(frame, "#host")?[0];
        let shadow = r.attach_shadow(host)?;

        let link = r.create_element(frame, "link")?;
        r.set_attribute(link, "rel", "stylesheet")?;
        r.set_attribute(link, "href", "s.css")?;
        r.append_element(shadow, link);
        r.drain_mutations();

        assert!(r.dom.to_html(shadow.0).contains("<style>p{margin:0}</style>"));
        Ok(())
    }

    #[test]
    fn fragment_in_the_address_lands_in_the_location() -> Result<()> {
        let mut r = replayer_with(&[("example.com/index.html", "<h1>Hi</h1>")]);
        let frame = r.attach("http://example.com/index.html#section-2")?;
        assert_eq!(
            r.frame_location(frame).unwrap().fragment(),
            Some("section-2")
        );
        Ok(())
    }

    #[test]
    fn post_message_routes_to_top_with_forced_wildcard() -> Result<()> {
        let mut r = replayer_with(&[("example.com/index.html", "<h1>Hi</h1>")]);
        let frame = r.attach("http://example.com/index.html")?;
        r.post_message(frame, "ping", "https://example.com");
        let posted = r.take_posted_messages();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].origin, "*");
        assert_eq!(posted[0].to, r.host_frame());
        Ok(())
    }

    #[test]
    fn disabled_post_message_strategy_drops_and_counts() -> Result<()> {
        let config = ReplayConfig {
            post_message_strategy: PostMessageStrategy::Disabled,
            ..ReplayConfig::default()
        };
        let mut r =
            replayer_with_config(&[("example.com/index.html", "<h1>Hi</h1>")], config);
        let frame = r.attach("http://example.com/index.html")?;
        r.post_message(frame, "ping", "*");
        assert!(r.take_posted_messages().is_empty());
        assert_eq!(r.dropped_message_count(), 1);
        Ok(())
    }

    #[test]
    fn console_output_is_suppressed_and_counted() -> Result<()> {
        let mut r = replayer_with(&[("example.com/index.html", "<h1>Hi</h1>")]);
        let frame = r.attach("http://example.com/index.html")?;
        r.console(frame, ConsoleLevel::Warn, "loud");
        r.console(frame, ConsoleLevel::Warn, "louder");
        r.console(frame, ConsoleLevel::Log, "fine");
        assert_eq!(r.suppressed_console_count(frame, ConsoleLevel::Warn), 2);
        assert_eq!(r.suppressed_console_count(frame, ConsoleLevel::Log), 1);
        assert_eq!(r.suppressed_console_count(frame, ConsoleLevel::Error), 0);
        Ok(())
    }

    #[test]
    fn default_socket_endpoint_answers_identity() -> Result<()> {
        let mut r = replayer_with(&[("example.com/index.html", "<h1>Hi</h1>")]);
        let frame = r.attach("http://example.com/index.html")?;
        let socket = r.web_socket_connect(frame, DEFAULT_ANNOTATION_ENDPOINT)?;
        r.socket_send(socket, r#"{"type":"whoami","id":1}"#);
        let received = r.socket_take_received(socket);
        assert_eq!(received, vec![ANNOTATION_IDENTITY_REPLY.to_string()]);
        assert!(r.socket_take_received(socket).is_empty());
        Ok(())
    }

    #[test]
    fn xhr_uses_archive_and_honors_custom_handlers() -> Result<()> {
        let mut r = replayer_with(&[
            ("example.com/index.html", "<h1>Hi</h1>"),
            ("example.com/data.json", "{\"k\":1}"),
        ]);
        let frame = r.attach("http://example.com/index.html")?;

        let outcome = r.xhr_request(frame, "get", "data.json", XhrResponseType::Text)?;
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.response_text.as_deref(), Some("{\"k\":1}"));

        let missing = r.xhr_request(frame, "GET", "absent.json", XhrResponseType::Text)?;
        assert_eq!(missing.status, 404);

        r.add_xhr_handler(
            r"/data\.json$",
            Box::new(|_, _| Some(Response::ok_with(b"handled".to_vec()))),
        )?;
        let handled =
            r.xhr_request(frame, "GET", "data.json", XhrResponseType::ArrayBuffer)?;
        assert_eq!(handled.response_bytes.as_deref(), Some(b"handled".as_slice()));
        Ok(())
    }

    #[test]
    fn fetch_proxy_overrides_selected_requests() -> Result<()> {
        let config = ReplayConfig {
            fetch_proxy: Some(Box::new(|request, _| {
                request
                    .url
                    .path()
                    .ends_with("special")
                    .then(|| Ok(Response::ok_with(b"override".to_vec())))
            })),
            ..ReplayConfig::default()
        };
        let mut r = replayer_with_config(
            &[
                ("example.com/index.html", "<h1>Hi</h1>"),
                ("example.com/plain", "archived"),
            ],
            config,
        );
        let frame = r.attach("http://example.com/index.html")?;
        let special = r.patched_fetch(frame, "special", FetchInit::default())?;
        assert_eq!(special.text(), "override");
        let plain = r.patched_fetch(frame, "plain", FetchInit::default())?;
        assert_eq!(plain.text(), "archived");
        Ok(())
    }

    #[test]
    fn html_post_process_runs_on_frame_content() -> Result<()> {
        let config = ReplayConfig {
            html_post_process: Some(Box::new(|html| html.replace("Hi", "Hello"))),
            ..ReplayConfig::default()
        };
        let mut r =
            replayer_with_config(&[("example.com/index.html", "<h1>Hi</h1>")], config);
        let frame = r.attach("http://example.com/index.html")?;
        assert!(r.frame_html(frame).unwrap().contains("<h1>Hello</h1>"));
        Ok(())
    }

    struct EchoWorker;

    impl WorkerBody for EchoWorker {
        fn run(self: Box<Self>, ctx: WorkerContext) {
            ctx.post_message(&format!("script:{}", ctx.script_source()));
            while let Some(message) = ctx.recv() {
                if message == "load" {
                    match ctx.fetch("data.json") {
                        Ok(response) => ctx.post_message(&response.text()),
                        Err(err) => ctx.post_message(&err),
                    }
                } else {
                    ctx.post_message(&format!("echo:{message}"));
                }
            }
        }
    }

    #[test]
    fn worker_queues_messages_until_ready_and_fetches_through_the_engine() -> Result<()> {
        let mut r = replayer_with(&[
            ("example.com/index.html", "<h1>Hi</h1>"),
            ("example.com/worker.js", "onmessage=handle"),
            ("example.com/data.json", "{\"n\":2}"),
        ]);
        let frame = r.attach("http://example.com/index.html")?;
        let worker = r.create_worker(frame, "worker.js", Box::new(EchoWorker))?;
        assert_eq!(r.worker_source(worker), Some("onmessage=handle"));

        // Posted while still initializing; must be queued, not lost.
        r.worker_post_message(worker, "a");
        r.worker_post_message(worker, "load");
        r.pump_workers();
        r.join_workers();

        let messages = r.worker_take_messages(worker);
        assert_eq!(
            messages,
            vec![
                "script:onmessage=handle".to_string(),
                "echo:a".to_string(),
                "{\"n\":2}".to_string(),
            ]
        );
        Ok(())
    }
}
