use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(pub(crate) usize);

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) kind: NodeKind,
}

/// Attribute order is preserved so serialization stays deterministic.
#[derive(Debug, Clone)]
pub(crate) struct Element {
    pub(crate) tag_name: String,
    pub(crate) attrs: Vec<(String, String)>,
    /// Content document tree of an `<iframe>`. Not a child edge: the frame's
    /// document is a separate tree in the same arena.
    pub(crate) content_document: Option<NodeId>,
    /// Shadow tree root of a shadow host, likewise a separate tree.
    pub(crate) shadow_root: Option<NodeId>,
}

impl Element {
    pub(crate) fn new(tag_name: String, attrs: Vec<(String, String)>) -> Self {
        Self {
            tag_name,
            attrs,
            content_document: None,
            shadow_root: None,
        }
    }

    pub(crate) fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.attrs.iter_mut().find(|(key, _)| key == name) {
            slot.1 = value.to_string();
        } else {
            self.attrs.push((name.to_string(), value.to_string()));
        }
    }

    pub(crate) fn remove_attr(&mut self, name: &str) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|(key, _)| key != name);
        self.attrs.len() != before
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Dom {
    pub(crate) nodes: Vec<Node>,
}

impl Dom {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create_document(&mut self) -> NodeId {
        self.push_node(None, NodeKind::Document)
    }

    fn push_node(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            kind,
        });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    pub(crate) fn create_element(
        &mut self,
        parent: NodeId,
        tag_name: String,
        attrs: Vec<(String, String)>,
    ) -> NodeId {
        self.push_node(Some(parent), NodeKind::Element(Element::new(tag_name, attrs)))
    }

    pub(crate) fn create_detached_element(&mut self, tag_name: &str) -> NodeId {
        self.push_node(
            None,
            NodeKind::Element(Element::new(tag_name.to_string(), Vec::new())),
        )
    }

    pub(crate) fn create_text(&mut self, parent: NodeId, text: String) -> NodeId {
        self.push_node(Some(parent), NodeKind::Text(text))
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub(crate) fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id.0].kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    pub(crate) fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[id.0].kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    pub(crate) fn tag_name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|element| element.tag_name.as_str())
    }

    pub(crate) fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|element| element.attr(name))
    }

    pub(crate) fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(element) = self.element_mut(id) {
            element.set_attr(name, value);
        }
    }

    pub(crate) fn remove_attr(&mut self, id: NodeId, name: &str) -> bool {
        self.element_mut(id)
            .map(|element| element.remove_attr(name))
            .unwrap_or(false)
    }

    pub(crate) fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub(crate) fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent {
            self.nodes[parent.0].children.retain(|child| *child != id);
            self.nodes[id.0].parent = None;
        }
    }

    pub(crate) fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Replaces `old` with `new` at the same position under `old`'s parent.
    /// The detached subtree stays in the arena unused.
    pub(crate) fn replace_node(&mut self, old: NodeId, new: NodeId) {
        let Some(parent) = self.nodes[old.0].parent else {
            return;
        };
        self.detach(new);
        let children = &mut self.nodes[parent.0].children;
        if let Some(pos) = children.iter().position(|child| *child == old) {
            children[pos] = new;
            self.nodes[old.0].parent = None;
            self.nodes[new.0].parent = Some(parent);
        }
    }

    /// Root of the tree containing `id`. Content documents and shadow trees
    /// are separate trees, so this never crosses a frame boundary.
    pub(crate) fn tree_root(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.nodes[current.0].parent {
            current = parent;
        }
        current
    }

    /// Pre-order descendants of `root`, excluding `root` itself.
    pub(crate) fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[root.0].children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            for child in self.nodes[id.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    pub(crate) fn elements_by_tag(&self, root: NodeId, tag: &str) -> Vec<NodeId> {
        self.descendants(root)
            .into_iter()
            .filter(|id| {
                self.tag_name(*id)
                    .map(|name| name.eq_ignore_ascii_case(tag))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub(crate) fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        if let NodeKind::Text(text) = &self.nodes[id.0].kind {
            out.push_str(text);
        }
        for child in self.descendants(id) {
            if let NodeKind::Text(text) = &self.nodes[child.0].kind {
                out.push_str(text);
            }
        }
        out
    }

    pub(crate) fn set_text(&mut self, id: NodeId, text: String) {
        let children = std::mem::take(&mut self.nodes[id.0].children);
        for child in children {
            self.nodes[child.0].parent = None;
        }
        self.create_text(id, text);
    }

    /// First `<base href>` in the tree, if any.
    pub(crate) fn base_href(&self, root: NodeId) -> Option<String> {
        self.elements_by_tag(root, "base")
            .into_iter()
            .find_map(|id| self.attr(id, "href").map(ToOwned::to_owned))
    }

    /// Parses `html` into a fresh document tree inside this arena and
    /// returns the document node.
    pub(crate) fn parse_document(&mut self, html: &str) -> Result<NodeId> {
        let root = self.create_document();
        let mut stack = vec![root];
        let bytes = html.as_bytes();
        let mut i = 0usize;

        while i < bytes.len() {
            if starts_with_at(bytes, i, b"<!--") {
                if let Some(end) = find_subslice(bytes, i + 4, b"-->") {
                    i = end + 3;
                } else {
                    return Err(Error::HtmlParse("unclosed HTML comment".into()));
                }
                continue;
            }

            if starts_with_at(bytes, i, b"<!") {
                // Doctype or other markup declaration.
                while i < bytes.len() && bytes[i] != b'>' {
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(Error::HtmlParse("unclosed markup declaration".into()));
                }
                i += 1;
                continue;
            }

            if bytes[i] == b'<' && starts_with_at(bytes, i, b"</") {
                let (tag, next) = parse_end_tag(html, i)?;
                i = next;

                while stack.len() > 1 {
                    let top = *stack
                        .last()
                        .ok_or_else(|| Error::HtmlParse("invalid stack state".into()))?;
                    let top_tag = self.tag_name(top).unwrap_or("");
                    let matched = top_tag.eq_ignore_ascii_case(&tag);
                    stack.pop();
                    if matched {
                        break;
                    }
                }
                continue;
            }

            if bytes[i] == b'<' && is_tag_start(bytes, i) {
                let (tag, attrs, self_closing, next) = parse_start_tag(html, i)?;
                i = next;

                let parent = *stack
                    .last()
                    .ok_or_else(|| Error::HtmlParse("missing parent element".into()))?;
                let node = self.create_element(parent, tag.clone(), attrs);

                if is_raw_text_tag(&tag) {
                    let close = find_case_insensitive_end_tag(bytes, i, tag.as_bytes())
                        .ok_or_else(|| Error::HtmlParse(format!("unclosed <{tag}>")))?;
                    if let Some(body) = html.get(i..close) {
                        if !body.is_empty() {
                            self.create_text(node, body.to_string());
                        }
                    }
                    i = close;
                    let (_, after_end) = parse_end_tag(html, i)?;
                    i = after_end;
                    continue;
                }

                if !self_closing && !is_void_tag(&tag) {
                    stack.push(node);
                }
                continue;
            }

            let text_start = i;
            i += 1;
            while i < bytes.len() && !(bytes[i] == b'<' && is_markup_start(bytes, i)) {
                i += 1;
            }

            if let Some(text) = html.get(text_start..i) {
                if !text.is_empty() {
                    let parent = *stack
                        .last()
                        .ok_or_else(|| Error::HtmlParse("missing parent element".into()))?;
                    self.create_text(parent, unescape_html_text(text));
                }
            }
        }

        Ok(root)
    }

    pub(crate) fn to_html(&self, root: NodeId) -> String {
        let mut out = String::new();
        match &self.nodes[root.0].kind {
            NodeKind::Document => {
                for child in self.children(root) {
                    self.serialize_node(*child, &mut out);
                }
            }
            _ => self.serialize_node(root, &mut out),
        }
        out
    }

    fn serialize_node(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id.0].kind {
            NodeKind::Document => {
                for child in &self.nodes[id.0].children {
                    self.serialize_node(*child, out);
                }
            }
            NodeKind::Text(text) => out.push_str(&escape_html_text(text)),
            NodeKind::Element(element) => {
                out.push('<');
                out.push_str(&element.tag_name);
                for (name, value) in &element.attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&escape_html_attr(value));
                    out.push('"');
                }
                out.push('>');
                if is_void_tag(&element.tag_name) {
                    return;
                }
                if is_raw_text_tag(&element.tag_name) {
                    for child in &self.nodes[id.0].children {
                        if let NodeKind::Text(text) = &self.nodes[child.0].kind {
                            out.push_str(text);
                        }
                    }
                } else {
                    for child in &self.nodes[id.0].children {
                        self.serialize_node(*child, out);
                    }
                }
                out.push_str("</");
                out.push_str(&element.tag_name);
                out.push('>');
            }
        }
    }
}

pub(crate) fn is_void_tag(tag: &str) -> bool {
    matches!(
        tag,
        "area"
            | "base"
            | "br"
            | "col"
            | "embed"
            | "hr"
            | "img"
            | "input"
            | "link"
            | "meta"
            | "param"
            | "source"
            | "track"
            | "wbr"
    )
}

pub(crate) fn is_raw_text_tag(tag: &str) -> bool {
    tag.eq_ignore_ascii_case("script") || tag.eq_ignore_ascii_case("style")
}

fn is_markup_start(bytes: &[u8], at: usize) -> bool {
    starts_with_at(bytes, at, b"</") || starts_with_at(bytes, at, b"<!") || is_tag_start(bytes, at)
}

fn is_tag_start(bytes: &[u8], at: usize) -> bool {
    bytes
        .get(at + 1)
        .map(|b| b.is_ascii_alphabetic())
        .unwrap_or(false)
}

fn parse_start_tag(html: &str, at: usize) -> Result<(String, Vec<(String, String)>, bool, usize)> {
    let bytes = html.as_bytes();
    let mut i = at;
    if bytes.get(i) != Some(&b'<') {
        return Err(Error::HtmlParse("expected '<'".into()));
    }
    i += 1;

    skip_ws(bytes, &mut i);
    let tag_start = i;
    while i < bytes.len() && is_tag_char(bytes[i]) {
        i += 1;
    }

    let tag = html
        .get(tag_start..i)
        .ok_or_else(|| Error::HtmlParse("invalid tag name".into()))?
        .to_ascii_lowercase();

    if tag.is_empty() {
        return Err(Error::HtmlParse("empty tag name".into()));
    }

    let mut attrs: Vec<(String, String)> = Vec::new();
    let mut self_closing = false;

    loop {
        skip_ws(bytes, &mut i);
        if i >= bytes.len() {
            return Err(Error::HtmlParse("unclosed start tag".into()));
        }

        if bytes[i] == b'>' {
            i += 1;
            break;
        }

        if bytes[i] == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'>' {
            self_closing = true;
            i += 2;
            break;
        }

        let name_start = i;
        while i < bytes.len() && is_attr_name_char(bytes[i]) {
            i += 1;
        }

        let name = html
            .get(name_start..i)
            .ok_or_else(|| Error::HtmlParse("invalid attribute name".into()))?
            .to_ascii_lowercase();

        if name.is_empty() {
            return Err(Error::HtmlParse("invalid attribute name".into()));
        }

        skip_ws(bytes, &mut i);

        let value = if i < bytes.len() && bytes[i] == b'=' {
            i += 1;
            skip_ws(bytes, &mut i);
            parse_attr_value(html, bytes, &mut i)?
        } else {
            String::new()
        };

        if !attrs.iter().any(|(existing, _)| existing == &name) {
            attrs.push((name, value));
        }
    }

    Ok((tag, attrs, self_closing, i))
}

fn parse_end_tag(html: &str, at: usize) -> Result<(String, usize)> {
    let bytes = html.as_bytes();
    let mut i = at;

    if !(bytes.get(i) == Some(&b'<') && bytes.get(i + 1) == Some(&b'/')) {
        return Err(Error::HtmlParse("expected end tag".into()));
    }
    i += 2;
    skip_ws(bytes, &mut i);

    let tag_start = i;
    while i < bytes.len() && is_tag_char(bytes[i]) {
        i += 1;
    }

    let tag = html
        .get(tag_start..i)
        .ok_or_else(|| Error::HtmlParse("invalid end tag".into()))?
        .to_ascii_lowercase();

    skip_ws(bytes, &mut i);
    if bytes.get(i) != Some(&b'>') {
        return Err(Error::HtmlParse("unclosed end tag".into()));
    }

    Ok((tag, i + 1))
}

fn parse_attr_value(html: &str, bytes: &[u8], i: &mut usize) -> Result<String> {
    if *i >= bytes.len() {
        return Err(Error::HtmlParse("missing attribute value".into()));
    }

    if bytes[*i] == b'"' || bytes[*i] == b'\'' {
        let quote = bytes[*i];
        *i += 1;
        let start = *i;
        while *i < bytes.len() && bytes[*i] != quote {
            *i += 1;
        }
        if *i >= bytes.len() {
            return Err(Error::HtmlParse("unclosed attribute value".into()));
        }
        let value = html
            .get(start..*i)
            .ok_or_else(|| Error::HtmlParse("invalid attribute value".into()))?
            .to_string();
        *i += 1;
        return Ok(unescape_html_text(&value));
    }

    let start = *i;
    while *i < bytes.len() && !bytes[*i].is_ascii_whitespace() && bytes[*i] != b'>' {
        *i += 1;
    }
    let value = html
        .get(start..*i)
        .ok_or_else(|| Error::HtmlParse("invalid attribute value".into()))?
        .to_string();
    Ok(unescape_html_text(&value))
}

fn skip_ws(bytes: &[u8], i: &mut usize) {
    while *i < bytes.len() && bytes[*i].is_ascii_whitespace() {
        *i += 1;
    }
}

fn is_tag_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':'
}

fn is_attr_name_char(b: u8) -> bool {
    !b.is_ascii_whitespace() && !matches!(b, b'=' | b'>' | b'/' | b'"' | b'\'')
}

fn starts_with_at(bytes: &[u8], at: usize, needle: &[u8]) -> bool {
    bytes.len() >= at + needle.len() && &bytes[at..at + needle.len()] == needle
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || bytes.len() < needle.len() {
        return None;
    }
    (from..=bytes.len() - needle.len()).find(|&i| &bytes[i..i + needle.len()] == needle)
}

fn find_case_insensitive_end_tag(bytes: &[u8], from: usize, tag: &[u8]) -> Option<usize> {
    let mut i = from;
    while i + tag.len() + 2 <= bytes.len() {
        if bytes[i] == b'<' && bytes[i + 1] == b'/' {
            let candidate = &bytes[i + 2..i + 2 + tag.len()];
            if candidate.eq_ignore_ascii_case(tag) {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

pub(crate) fn escape_html_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

pub(crate) fn escape_html_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

pub(crate) fn unescape_html_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'&' {
            let rest = &value[i..];
            let replacement = [
                ("&amp;", '&'),
                ("&lt;", '<'),
                ("&gt;", '>'),
                ("&quot;", '"'),
                ("&#39;", '\''),
            ]
            .iter()
            .find(|(entity, _)| rest.starts_with(entity));
            if let Some((entity, ch)) = replacement {
                out.push(*ch);
                i += entity.len();
                continue;
            }
        }
        let ch = value[i..].chars().next().unwrap_or_default();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_and_text() -> Result<()> {
        let mut dom = Dom::new();
        let root = dom.parse_document("<div id='a'><p>hello</p></div>")?;
        let divs = dom.elements_by_tag(root, "div");
        assert_eq!(divs.len(), 1);
        assert_eq!(dom.attr(divs[0], "id"), Some("a"));
        let paragraphs = dom.elements_by_tag(root, "p");
        assert_eq!(dom.text_content(paragraphs[0]), "hello");
        Ok(())
    }

    #[test]
    fn doctype_and_comments_are_skipped() -> Result<()> {
        let mut dom = Dom::new();
        let root = dom.parse_document("<!DOCTYPE html><!-- note --><html><body></body></html>")?;
        assert_eq!(dom.elements_by_tag(root, "html").len(), 1);
        assert_eq!(dom.elements_by_tag(root, "body").len(), 1);
        Ok(())
    }

    #[test]
    fn style_and_script_bodies_stay_raw() -> Result<()> {
        let mut dom = Dom::new();
        let root =
            dom.parse_document("<style>div>a{color:red}</style><script>if(a<b){}</script>")?;
        let style = dom.elements_by_tag(root, "style")[0];
        assert_eq!(dom.text_content(style), "div>a{color:red}");
        let script = dom.elements_by_tag(root, "script")[0];
        assert_eq!(dom.text_content(script), "if(a<b){}");
        Ok(())
    }

    #[test]
    fn serialization_round_trips_structure() -> Result<()> {
        let mut dom = Dom::new();
        let root = dom.parse_document("<div class=\"x\"><img src=\"a.png\"><p>t</p></div>")?;
        let html = dom.to_html(root);
        assert_eq!(
            html,
            "<div class=\"x\"><img src=\"a.png\"><p>t</p></div>"
        );
        Ok(())
    }

    #[test]
    fn replace_node_keeps_position() -> Result<()> {
        let mut dom = Dom::new();
        let root = dom.parse_document("<div><a></a><b></b></div>")?;
        let div = dom.elements_by_tag(root, "div")[0];
        let a = dom.elements_by_tag(root, "a")[0];
        let style = dom.create_detached_element("style");
        dom.replace_node(a, style);
        let children = dom.children(div).to_vec();
        assert_eq!(dom.tag_name(children[0]), Some("style"));
        assert_eq!(dom.tag_name(children[1]), Some("b"));
        Ok(())
    }

    #[test]
    fn unclosed_comment_is_a_parse_error() {
        let mut dom = Dom::new();
        let err = dom.parse_document("<div><!-- oops").unwrap_err();
        assert!(matches!(err, Error::HtmlParse(_)));
    }

    #[test]
    fn base_href_is_discovered() -> Result<()> {
        let mut dom = Dom::new();
        let root = dom.parse_document(
            "<html><head><base href=\"http://cdn.example.com/\"></head><body></body></html>",
        )?;
        assert_eq!(
            dom.base_href(root).as_deref(),
            Some("http://cdn.example.com/")
        );
        Ok(())
    }
}
