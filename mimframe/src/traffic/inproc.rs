use crate::{server::Registry, traffic::ResponseHandle};

/// The in-process interception surface is a wire-protocol obligation: the
/// messages are parsed, described, recorded and replay-matched, but there is
/// no foreign object runtime behind them to forward to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InProcKind {
    Import,
    Attribute { cached: bool },
    SetAttribute,
    Call,
}

pub struct InProcMessage {
    kind: InProcKind,
    marker: String,
    text: String,
    handle: ResponseHandle,
}

impl InProcMessage {
    pub fn import(module: String, handle: ResponseHandle) -> Self {
        Self {
            kind: InProcKind::Import,
            text: format!("import {}", module),
            marker: module,
            handle,
        }
    }

    /// Attribute reads are recorded at most once, and only when they return
    /// something in their own right; the registry remembers which ones have
    /// been asked before
    pub fn attribute(target: String, attr: String, handle: ResponseHandle, registry: &Registry) -> Self {
        let text = format!("{}.{}", target, attr);
        let cached = registry.attribute_seen(&text);
        Self {
            kind: InProcKind::Attribute { cached },
            marker: text.clone(),
            text,
            handle,
        }
    }

    pub fn set_attribute(target: String, attr: String, value: String, handle: ResponseHandle) -> Self {
        Self {
            kind: InProcKind::SetAttribute,
            marker: format!("{}.{}", target, attr),
            text: format!("{}.{} = {}", target, attr, value),
            handle,
        }
    }

    pub fn call(
        target: String,
        attr: String,
        args_expr: String,
        kwargs_expr: String,
        handle: ResponseHandle,
    ) -> Self {
        let mut rendered = split_call_args(&args_expr);
        rendered.extend(render_kwargs(&kwargs_expr));
        Self {
            kind: InProcKind::Call,
            marker: format!("{}.{}", target, attr),
            text: format!("{}.{}({})", target, attr, rendered.join(", ")),
            handle,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn handle(&self) -> ResponseHandle {
        self.handle.clone()
    }

    pub fn enquiry_only(&self, no_responses: bool) -> bool {
        match self.kind {
            InProcKind::Attribute { cached } => no_responses || cached,
            _ => false,
        }
    }

    /// Replay items may name a module (exact or dotted prefix) or a
    /// `target.attr` marker
    pub fn marked_for_replay(&self, items: &[String]) -> bool {
        match self.kind {
            InProcKind::Import => items.iter().any(|item| item == &self.marker),
            _ => items.iter().any(|item| {
                item == &self.marker || self.marker.starts_with(&format!("{}.", item))
            }),
        }
    }
}

/// Renders the wire tuple expression of positional arguments back into the
/// argument list text, e.g. `('a', 1, [2, 3])` becomes `'a', 1, [2, 3]`
fn split_call_args(expr: &str) -> Vec<String> {
    let trimmed = expr.trim();
    let inner = strip_brackets(trimmed, '(', ')')
        .or_else(|| strip_brackets(trimmed, '[', ']'))
        .unwrap_or(trimmed);
    split_top_level(inner)
}

/// Renders the wire dict expression of keyword arguments as `key=value`
/// pairs, sorted by key for a stable record
fn render_kwargs(expr: &str) -> Vec<String> {
    let trimmed = expr.trim();
    let inner = strip_brackets(trimmed, '{', '}').unwrap_or(trimmed);

    let mut pairs: Vec<(String, String)> = split_top_level(inner)
        .into_iter()
        .filter_map(|element| {
            let (key, value) = split_key_value(&element)?;
            Some((key, value))
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

fn strip_brackets(text: &str, open: char, close: char) -> Option<&str> {
    if text.starts_with(open) && text.ends_with(close) && text.len() >= 2 {
        Some(&text[open.len_utf8()..text.len() - close.len_utf8()])
    } else {
        None
    }
}

/// Splits `'key': value` on the first colon outside the quoted key, dropping
/// the key's quotes
fn split_key_value(element: &str) -> Option<(String, String)> {
    let trimmed = element.trim();
    let (key_end, stripped) = match trimmed.chars().next()? {
        quote @ '\'' | quote @ '"' => {
            let rest = &trimmed[1..];
            let end = find_unescaped(rest, quote)?;
            (1 + end + 1, Some(&rest[..end]))
        }
        _ => (trimmed.find(':')?, None),
    };
    let key = stripped
        .map(String::from)
        .unwrap_or_else(|| trimmed[..key_end].to_string());
    let after = trimmed[key_end..].trim_start();
    let value = after.strip_prefix(':')?.trim();
    Some((key, value.to_string()))
}

fn find_unescaped(text: &str, quote: char) -> Option<usize> {
    let mut escaped = false;
    for (offset, c) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some(offset);
        }
    }
    None
}

/// Top-level comma split: brackets and quoted strings hide their commas
fn split_top_level(inner: &str) -> Vec<String> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for c in inner.chars() {
        if let Some(quote) = in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                in_string = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                elements.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        elements.push(current.trim().to_string());
    }
    elements.retain(|element| !element.is_empty());
    elements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_text_renders_args_and_sorted_kwargs() {
        let message = InProcMessage::call(
            "db1".into(),
            "query".into(),
            "('select', 10)".into(),
            "{'timeout': 5, 'batch': [1, 2]}".into(),
            ResponseHandle::sink(),
        );
        assert_eq!(message.text(), "db1.query('select', 10, batch=[1, 2], timeout=5)");
    }

    #[test]
    fn empty_arg_tuples_render_empty() {
        let message = InProcMessage::call(
            "mod".into(),
            "ping".into(),
            "()".into(),
            "{}".into(),
            ResponseHandle::sink(),
        );
        assert_eq!(message.text(), "mod.ping()");

        let one = InProcMessage::call(
            "mod".into(),
            "ping".into(),
            "('x',)".into(),
            "{}".into(),
            ResponseHandle::sink(),
        );
        assert_eq!(one.text(), "mod.ping('x')");
    }

    #[test]
    fn nested_commas_stay_inside_their_argument() {
        assert_eq!(
            split_call_args("([1, 2], {'a': (3, 4)}, 'x,y')"),
            vec!["[1, 2]", "{'a': (3, 4)}", "'x,y'"]
        );
    }

    #[test]
    fn set_attribute_text_reads_like_an_assignment() {
        let message = InProcMessage::set_attribute(
            "config".into(),
            "mode".into(),
            "'fast'".into(),
            ResponseHandle::sink(),
        );
        assert_eq!(message.text(), "config.mode = 'fast'");
    }

    #[test]
    fn attribute_reads_cache_by_description() {
        let registry = Registry::new();
        let first = InProcMessage::attribute(
            "config".into(),
            "cache_dir".into(),
            ResponseHandle::sink(),
            &registry,
        );
        let second = InProcMessage::attribute(
            "config".into(),
            "cache_dir".into(),
            ResponseHandle::sink(),
            &registry,
        );

        // a fresh read is enquiry-only iff it produced nothing
        assert!(!first.enquiry_only(false));
        assert!(first.enquiry_only(true));
        // the repeat is always enquiry-only
        assert!(second.enquiry_only(false));
    }

    #[test]
    fn replay_items_match_markers_by_prefix() {
        let call = InProcMessage::call(
            "store.backend".into(),
            "flush".into(),
            "()".into(),
            "{}".into(),
            ResponseHandle::sink(),
        );
        assert!(call.marked_for_replay(&["store".to_string()]));
        assert!(call.marked_for_replay(&["store.backend.flush".to_string()]));
        assert!(!call.marked_for_replay(&["other".to_string()]));

        let import = InProcMessage::import("store".into(), ResponseHandle::sink());
        assert!(import.marked_for_replay(&["store".to_string()]));
        assert!(!import.marked_for_replay(&["store.backend".to_string()]));
    }
}
