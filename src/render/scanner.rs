//! The tokenizer and control-flow parser that drives `RenderContext`'s
//! callback surface from template text. This is internal, from-scratch
//! application code: no off-the-shelf template crate exposes the
//! lazy, callback-driven section-stack walk the render engine is built
//! around, so the section syntax (`{{name}}`, `{{#name}}...{{/name}}`,
//! `{{.}}`) is parsed and interpreted here directly.

use super::RenderContext;

#[derive(Debug)]
enum Node<'a> {
    Text(&'a str),
    Var(&'a str),
    Section(&'a str, Vec<Node<'a>>),
}

const EINVAL: i32 = -22;

/// Parses `template` and walks it against `ctx`, returning the rendered
/// bytes. Any negative-errno result from the engine (or a malformed
/// template) aborts the whole render.
pub fn expand(template: &[u8], ctx: &mut RenderContext) -> Result<Vec<u8>, i32> {
    let text = String::from_utf8_lossy(template);
    let nodes = parse(&text)?;
    let mut out = Vec::with_capacity(template.len());
    render_nodes(&nodes, ctx, &mut out)?;
    Ok(out)
}

fn parse(text: &str) -> Result<Vec<Node<'_>>, i32> {
    let mut pos = 0;
    let (nodes, _) = parse_until(text, &mut pos, None)?;
    Ok(nodes)
}

/// Parses nodes until either the input runs out (`closing == None`) or the
/// matching `{{/name}}` for `closing` is consumed. Returns the parsed
/// nodes and whether a closing tag terminated the call.
fn parse_until<'a>(
    text: &'a str,
    pos: &mut usize,
    closing: Option<&str>,
) -> Result<(Vec<Node<'a>>, bool), i32> {
    let mut nodes = Vec::new();
    loop {
        match text[*pos..].find("{{") {
            None => {
                if closing.is_some() {
                    return Err(EINVAL);
                }
                if *pos < text.len() {
                    nodes.push(Node::Text(&text[*pos..]));
                }
                *pos = text.len();
                return Ok((nodes, false));
            }
            Some(rel) => {
                let tag_start = *pos + rel;
                if tag_start > *pos {
                    nodes.push(Node::Text(&text[*pos..tag_start]));
                }
                let after_open = tag_start + 2;
                let end_rel = text[after_open..].find("}}").ok_or(EINVAL)?;
                let tag_content = text[after_open..after_open + end_rel].trim();
                *pos = after_open + end_rel + 2;

                if let Some(name) = tag_content.strip_prefix('#') {
                    let name = name.trim();
                    let (body, closed) = parse_until(text, pos, Some(name))?;
                    if !closed {
                        return Err(EINVAL);
                    }
                    nodes.push(Node::Section(name, body));
                } else if let Some(name) = tag_content.strip_prefix('/') {
                    let name = name.trim();
                    if closing == Some(name) {
                        return Ok((nodes, true));
                    }
                    return Err(EINVAL);
                } else {
                    nodes.push(Node::Var(tag_content));
                }
            }
        }
    }
}

fn render_nodes(nodes: &[Node<'_>], ctx: &mut RenderContext, out: &mut Vec<u8>) -> Result<(), i32> {
    for node in nodes {
        match node {
            Node::Text(s) => out.extend_from_slice(s.as_bytes()),
            Node::Var(name) => render_var(name, ctx, out)?,
            Node::Section(name, body) => render_section(name, body, ctx, out)?,
        }
    }
    Ok(())
}

fn render_var(name: &str, ctx: &mut RenderContext, out: &mut Vec<u8>) -> Result<(), i32> {
    if name != "." {
        let r = ctx.sel(name);
        if r < 0 {
            return Err(r);
        }
    }
    if let Some(bytes) = ctx.get(0)? {
        out.extend_from_slice(&bytes);
    }
    Ok(())
}

fn render_section(
    name: &str,
    body: &[Node<'_>],
    ctx: &mut RenderContext,
    out: &mut Vec<u8>,
) -> Result<(), i32> {
    let r = ctx.sel(name);
    if r < 0 {
        return Err(r);
    }
    ctx.enter(0);

    let render_result = (|| -> Result<(), i32> {
        if ctx.is_array() {
            loop {
                render_nodes(body, ctx, out)?;
                if ctx.next() == 0 {
                    break;
                }
            }
        } else if ctx.key_exists() {
            render_nodes(body, ctx, out)?;
        }
        Ok(())
    })();

    let leave_result = ctx.leave();
    render_result?;
    if leave_result < 0 {
        return Err(leave_result);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TomlConfigStore;
    use crate::render::render;

    #[test]
    fn unterminated_section_is_rejected() {
        let store = TomlConfigStore::empty();
        let err = render(b"{{#items}}no close", &store).unwrap_err();
        assert_eq!(err, EINVAL);
    }

    #[test]
    fn mismatched_close_tag_is_rejected() {
        let store = TomlConfigStore::empty();
        let err = render(b"{{#items}}x{{/other}}", &store).unwrap_err();
        assert_eq!(err, EINVAL);
    }

    #[test]
    fn nested_sections_parse_independently() {
        let store = TomlConfigStore::from_str(
            "[[outer]]\n[[outer.inner]]\nname = \"a\"\n[[outer.inner]]\nname = \"b\"\n",
        )
        .unwrap();
        let out = render(b"{{#outer}}{{#inner}}{{name}}{{/inner}}{{/outer}}", &store).unwrap();
        assert_eq!(out, b"ab");
    }
}
