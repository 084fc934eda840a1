use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SelectorAttrCondition {
    Exists { key: String },
    Eq { key: String, value: String },
    StartsWith { key: String, value: String },
    EndsWith { key: String, value: String },
    Contains { key: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SelectorStep {
    pub(crate) tag: Option<String>,
    pub(crate) universal: bool,
    pub(crate) id: Option<String>,
    pub(crate) classes: Vec<String>,
    pub(crate) attrs: Vec<SelectorAttrCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SelectorCombinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SelectorPart {
    pub(crate) step: SelectorStep,
    // Relation to previous (left) selector part.
    pub(crate) combinator: Option<SelectorCombinator>,
}

pub(crate) fn parse_selector_groups(selector: &str) -> Result<Vec<Vec<SelectorPart>>> {
    let mut groups = Vec::new();
    for group in selector.split(',') {
        groups.push(parse_selector_chain(group)?);
    }
    Ok(groups)
}

pub(crate) fn parse_selector_chain(selector: &str) -> Result<Vec<SelectorPart>> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }

    let tokens = tokenize_selector(selector)?;
    let mut parts: Vec<SelectorPart> = Vec::new();
    let mut pending_combinator: Option<SelectorCombinator> = None;

    for token in tokens {
        if token == ">" {
            if pending_combinator.is_some() || parts.is_empty() {
                return Err(Error::UnsupportedSelector(selector.into()));
            }
            pending_combinator = Some(SelectorCombinator::Child);
            continue;
        }

        let step = parse_selector_step(&token, selector)?;
        let combinator = if parts.is_empty() {
            None
        } else {
            Some(
                pending_combinator
                    .take()
                    .unwrap_or(SelectorCombinator::Descendant),
            )
        };
        parts.push(SelectorPart { step, combinator });
    }

    if pending_combinator.is_some() || parts.is_empty() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }

    Ok(parts)
}

fn tokenize_selector(selector: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0usize;
    let mut quote: Option<char> = None;

    for ch in selector.chars() {
        match (quote, ch) {
            (Some(q), _) if ch == q => {
                quote = None;
                current.push(ch);
            }
            (Some(_), _) => current.push(ch),
            (None, '\'') | (None, '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, '[') => {
                bracket_depth += 1;
                current.push(ch);
            }
            (None, ']') => {
                if bracket_depth == 0 {
                    return Err(Error::UnsupportedSelector(selector.into()));
                }
                bracket_depth -= 1;
                current.push(ch);
            }
            (None, '>') if bracket_depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(">".to_string());
            }
            (None, ch) if ch.is_whitespace() && bracket_depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            (None, ch) => current.push(ch),
        }
    }

    if quote.is_some() || bracket_depth != 0 {
        return Err(Error::UnsupportedSelector(selector.into()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_selector_step(token: &str, selector: &str) -> Result<SelectorStep> {
    let mut step = SelectorStep::default();
    let bytes = token.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                step.universal = true;
                i += 1;
            }
            b'#' => {
                let (name, next) = read_identifier(token, i + 1);
                if name.is_empty() {
                    return Err(Error::UnsupportedSelector(selector.into()));
                }
                step.id = Some(name);
                i = next;
            }
            b'.' => {
                let (name, next) = read_identifier(token, i + 1);
                if name.is_empty() {
                    return Err(Error::UnsupportedSelector(selector.into()));
                }
                step.classes.push(name);
                i = next;
            }
            b'[' => {
                let close = token[i..]
                    .find(']')
                    .map(|offset| i + offset)
                    .ok_or_else(|| Error::UnsupportedSelector(selector.into()))?;
                let condition = parse_attr_condition(&token[i + 1..close], selector)?;
                step.attrs.push(condition);
                i = close + 1;
            }
            _ => {
                let (name, next) = read_identifier(token, i);
                if name.is_empty() {
                    return Err(Error::UnsupportedSelector(selector.into()));
                }
                step.tag = Some(name.to_ascii_lowercase());
                i = next;
            }
        }
    }

    Ok(step)
}

fn parse_attr_condition(body: &str, selector: &str) -> Result<SelectorAttrCondition> {
    let body = body.trim();
    if body.is_empty() {
        return Err(Error::UnsupportedSelector(selector.into()));
    }

    type Make = fn(String, String) -> SelectorAttrCondition;
    let ops: [(&str, Make); 4] = [
        ("^=", |key, value| SelectorAttrCondition::StartsWith {
            key,
            value,
        }),
        ("$=", |key, value| SelectorAttrCondition::EndsWith {
            key,
            value,
        }),
        ("*=", |key, value| SelectorAttrCondition::Contains {
            key,
            value,
        }),
        ("=", |key, value| SelectorAttrCondition::Eq { key, value }),
    ];

    for (op, make) in ops {
        if let Some((raw_key, raw_value)) = body.split_once(op) {
            let key = raw_key.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(Error::UnsupportedSelector(selector.into()));
            }
            return Ok(make(key, unquote(raw_value.trim())));
        }
    }

    Ok(SelectorAttrCondition::Exists {
        key: body.to_ascii_lowercase(),
    })
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

fn read_identifier(token: &str, from: usize) -> (String, usize) {
    let bytes = token.as_bytes();
    let mut i = from;
    while i < bytes.len()
        && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'-' | b'_' | b':'))
    {
        i += 1;
    }
    (token[from..i].to_string(), i)
}

pub(crate) fn select_all_parsed(dom: &Dom, scope: NodeId, groups: &[Vec<SelectorPart>]) -> Vec<NodeId> {
    let mut out = Vec::new();
    for id in dom.descendants(scope) {
        if dom.element(id).is_none() {
            continue;
        }
        if groups
            .iter()
            .any(|chain| matches_chain(dom, scope, id, chain))
        {
            out.push(id);
        }
    }
    out
}

fn matches_chain(dom: &Dom, scope: NodeId, id: NodeId, chain: &[SelectorPart]) -> bool {
    let Some((last, rest)) = chain.split_last() else {
        return false;
    };
    if !matches_step(dom, id, &last.step) {
        return false;
    }
    matches_ancestry(dom, scope, id, rest, last.combinator)
}

fn matches_ancestry(
    dom: &Dom,
    scope: NodeId,
    id: NodeId,
    rest: &[SelectorPart],
    combinator: Option<SelectorCombinator>,
) -> bool {
    let Some((part, earlier)) = rest.split_last() else {
        return true;
    };

    let mut candidate = dom.node(id).parent;
    while let Some(ancestor) = candidate {
        if matches_step(dom, ancestor, &part.step)
            && matches_ancestry(dom, scope, ancestor, earlier, part.combinator)
        {
            return true;
        }
        if combinator == Some(SelectorCombinator::Child) || ancestor == scope {
            return false;
        }
        candidate = dom.node(ancestor).parent;
    }
    false
}

fn matches_step(dom: &Dom, id: NodeId, step: &SelectorStep) -> bool {
    let Some(element) = dom.element(id) else {
        return false;
    };

    if let Some(tag) = &step.tag {
        if !element.tag_name.eq_ignore_ascii_case(tag) {
            return false;
        }
    }
    if let Some(wanted) = &step.id {
        if element.attr("id") != Some(wanted.as_str()) {
            return false;
        }
    }
    for class in &step.classes {
        let has = element
            .attr("class")
            .map(|classes| classes.split_whitespace().any(|c| c == class))
            .unwrap_or(false);
        if !has {
            return false;
        }
    }
    step.attrs
        .iter()
        .all(|condition| matches_attr_condition(element, condition))
}

fn matches_attr_condition(element: &Element, condition: &SelectorAttrCondition) -> bool {
    match condition {
        SelectorAttrCondition::Exists { key } => element.attr(key).is_some(),
        SelectorAttrCondition::Eq { key, value } => element.attr(key) == Some(value.as_str()),
        SelectorAttrCondition::StartsWith { key, value } => element
            .attr(key)
            .map(|attr| attr.starts_with(value.as_str()))
            .unwrap_or(false),
        SelectorAttrCondition::EndsWith { key, value } => element
            .attr(key)
            .map(|attr| attr.ends_with(value.as_str()))
            .unwrap_or(false),
        SelectorAttrCondition::Contains { key, value } => element
            .attr(key)
            .map(|attr| attr.contains(value.as_str()))
            .unwrap_or(false),
    }
}
