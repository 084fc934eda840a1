use super::*;

/// Output of one rewrite pass: serialized HTML plus the context URL the
/// document's content should resolve against.
#[derive(Debug, Clone)]
pub struct RewrittenDocument {
    pub html: String,
    pub context_url: Url,
}

/// Rewrites every resource-bearing construct of `html` to route through the
/// resource locator. Step order matters: stylesheet inlining replaces tags
/// that later steps must not see again.
pub(crate) fn rewrite_document(
    fetcher: &mut ContentFetcher,
    html: &str,
    context: &Url,
) -> Result<RewrittenDocument> {
    let mut dom = Dom::new();
    let root = dom.parse_document(html)?;
    let context = resolved_context(&dom, root, context);

    rewrite_img_tags(&mut dom, fetcher, root, &context);
    rewrite_style_tags(&mut dom, fetcher, root, &context);
    rewrite_link_tags(&mut dom, fetcher, root, &context);
    rewrite_script_tags(&mut dom, fetcher, root, &context);
    neutralize_iframe_tags(&mut dom, root);

    Ok(RewrittenDocument {
        html: format!("<!DOCTYPE html>{}", dom.to_html(root)),
        context_url: context,
    })
}

/// A `<base href>` overrides the inherited context for everything the
/// document references.
fn resolved_context(dom: &Dom, root: NodeId, context: &Url) -> Url {
    if let Some(href) = dom.base_href(root) {
        if let Ok(base) = context.join(&href) {
            return base;
        }
    }
    context.clone()
}

fn rewrite_img_tags(dom: &mut Dom, fetcher: &mut ContentFetcher, root: NodeId, context: &Url) {
    for img in dom.elements_by_tag(root, "img") {
        let Some(src) = dom.attr(img, "src").map(ToOwned::to_owned) else {
            continue;
        };
        let local = fetcher.resource_url(&src, context);
        dom.set_attr(img, "src", &local);
        dom.set_attr(img, "patched-src", &src);
    }
}

fn rewrite_style_tags(dom: &mut Dom, fetcher: &mut ContentFetcher, root: NodeId, context: &Url) {
    for style in dom.elements_by_tag(root, "style") {
        let css = dom.text_content(style);
        let rewritten = rewrite_css_urls(fetcher, &css, context);
        dom.set_text(style, rewritten);
    }
}

fn rewrite_link_tags(dom: &mut Dom, fetcher: &mut ContentFetcher, root: NodeId, context: &Url) {
    for link in dom.elements_by_tag(root, "link") {
        patch_link_element(dom, fetcher, link, context);
    }
}

/// Stylesheet links are fetched and inlined as `<style>`; a fetch error
/// leaves the tag untouched. Other relations are rewritten in place with the
/// original preserved in the shadow attribute.
pub(crate) fn patch_link_element(
    dom: &mut Dom,
    fetcher: &mut ContentFetcher,
    link: NodeId,
    context: &Url,
) {
    let rel = dom.attr(link, "rel").unwrap_or("").to_ascii_lowercase();
    // A link touched once already carries its original reference in the
    // shadow attribute; use that, not the localized href.
    let Some(href) = dom
        .attr(link, "patched-href")
        .or_else(|| dom.attr(link, "href"))
        .map(ToOwned::to_owned)
    else {
        return;
    };

    if rel == "stylesheet" {
        let Ok(href_context) = context.join(&href) else {
            tracing::debug!(href, "stylesheet href does not resolve, leaving tag");
            return;
        };
        match fetcher.fetch_url(&href_context, &FetchInit::default()) {
            Ok(response) => {
                let css = rewrite_css_urls(fetcher, &response.text(), &href_context);
                let style = dom.create_detached_element("style");
                dom.set_text(style, css);
                dom.replace_node(link, style);
            }
            Err(err) => {
                tracing::debug!(href, error = %err, "stylesheet inline failed, leaving tag");
            }
        }
        return;
    }

    let local = fetcher.resource_url(&href, context);
    dom.set_attr(link, "href", &local);
    dom.set_attr(link, "patched-href", &href);
}

fn rewrite_script_tags(dom: &mut Dom, fetcher: &mut ContentFetcher, root: NodeId, context: &Url) {
    for script in dom.elements_by_tag(root, "script") {
        let Some(src) = dom.attr(script, "src").map(ToOwned::to_owned) else {
            continue;
        };
        let local = fetcher.resource_url(&src, context);
        dom.set_attr(script, "src", &local);
        dom.set_attr(script, "patched-src", &src);
    }
}

/// Nested iframes must not load on their own; the patcher picks them up from
/// the shadow attribute on demand.
fn neutralize_iframe_tags(dom: &mut Dom, root: NodeId) {
    for iframe in dom.elements_by_tag(root, "iframe") {
        let Some(src) = dom.attr(iframe, "src").map(ToOwned::to_owned) else {
            continue;
        };
        dom.remove_attr(iframe, "src");
        dom.set_attr(iframe, "patched-src", &src);
    }
}

/// Rewrites `url(...)` references in CSS text, tolerant of single, double,
/// or absent quoting.
pub(crate) fn rewrite_css_urls(fetcher: &mut ContentFetcher, css: &str, context: &Url) -> String {
    let Ok(pattern) = fancy_regex::Regex::new(r#"url\(["']?(.*?)["']?\)"#) else {
        return css.to_string();
    };

    let mut out = String::with_capacity(css.len());
    let mut last = 0usize;
    for captures in pattern.captures_iter(css) {
        let Ok(captures) = captures else {
            continue;
        };
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let reference = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        out.push_str(&css[last..whole.start()]);
        out.push_str("url(\"");
        out.push_str(&fetcher.resource_url(reference, context));
        out.push_str("\")");
        last = whole.end();
    }
    out.push_str(&css[last..]);
    out
}
