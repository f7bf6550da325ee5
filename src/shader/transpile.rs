// Layout qualifier rewriting for GLSL targets without descriptor sets
//
// Desktop GLSL 4.10 rejects `layout(set = .., binding = ..)`. Cross-compiled
// sources are rewritten clause by clause:
//
//   1. declarations carrying `in`/`out` keep their clause
//   2. sampler or vector declarations lose the clause entirely
//   3. clauses with a `set` or `binding` key become `layout(std140)`
//   4. anything else is left alone
//
// The rewrite works on tokens so comments and identifiers that merely contain
// "layout" are never touched, and running it twice changes nothing.

use std::ops::Range;

const SHARED_LAYOUT: &str = "layout(std140)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Ident,
    Number,
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    span: Range<usize>,
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if c.is_whitespace() {
            continue;
        }

        if c == '/' {
            match chars.peek() {
                Some((_, '/')) => {
                    for (_, c) in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                    continue;
                }
                Some((_, '*')) => {
                    chars.next();
                    let mut previous = '\0';
                    for (_, c) in chars.by_ref() {
                        if previous == '*' && c == '/' {
                            break;
                        }
                        previous = c;
                    }
                    continue;
                }
                _ => {}
            }
        }

        let kind = if c.is_alphabetic() || c == '_' {
            TokenKind::Ident
        } else if c.is_ascii_digit() {
            TokenKind::Number
        } else {
            tokens.push(Token {
                kind: TokenKind::Punct(c),
                span: start..start + c.len_utf8(),
            });
            continue;
        };

        let mut end = start + c.len_utf8();
        while let Some(&(i, next)) = chars.peek() {
            let continues = next.is_alphanumeric()
                || next == '_'
                || (kind == TokenKind::Number && next == '.');
            if !continues {
                break;
            }
            end = i + next.len_utf8();
            chars.next();
        }

        tokens.push(Token {
            kind,
            span: start..end,
        });
    }

    tokens
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewrite {
    Keep,
    Remove,
    Replace,
}

fn is_vector_type(name: &str) -> bool {
    let rest = name
        .strip_prefix(['i', 'u', 'b', 'd'])
        .filter(|r| r.starts_with("vec"))
        .unwrap_or(name);
    matches!(rest, "vec2" | "vec3" | "vec4")
}

fn is_sampler_type(name: &str) -> bool {
    name.contains("sampler")
}

fn classify(head: &[&str], keys: &[&str]) -> Rewrite {
    if head.iter().any(|t| *t == "in" || *t == "out") {
        Rewrite::Keep
    } else if head.iter().any(|t| is_sampler_type(t) || is_vector_type(t)) {
        Rewrite::Remove
    } else if keys.iter().any(|k| *k == "set" || *k == "binding") {
        Rewrite::Replace
    } else {
        Rewrite::Keep
    }
}

fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            TokenKind::Punct('(') => depth += 1,
            TokenKind::Punct(')') => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Rewrites `layout(...)` clauses so the source compiles without descriptor sets.
pub fn strip_layout_qualifiers(source: &str) -> String {
    let tokens = tokenize(source);
    let text = |t: &Token| &source[t.span.clone()];

    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    let mut i = 0;

    while i < tokens.len() {
        let is_clause = tokens[i].kind == TokenKind::Ident
            && text(&tokens[i]) == "layout"
            && matches!(tokens.get(i + 1), Some(t) if t.kind == TokenKind::Punct('('));
        if !is_clause {
            i += 1;
            continue;
        }

        let Some(close) = matching_paren(&tokens, i + 1) else {
            break;
        };

        let mut keys = Vec::new();
        let mut expect_key = true;
        for token in &tokens[i + 2..close] {
            match token.kind {
                TokenKind::Punct(',') => expect_key = true,
                TokenKind::Ident if expect_key => {
                    keys.push(text(token));
                    expect_key = false;
                }
                _ => expect_key = false,
            }
        }

        let head: Vec<&str> = tokens[close + 1..]
            .iter()
            .take_while(|t| !matches!(t.kind, TokenKind::Punct(';') | TokenKind::Punct('{')))
            .filter(|t| t.kind == TokenKind::Ident)
            .map(text)
            .collect();

        let clause = tokens[i].span.start..tokens[close].span.end;
        match classify(&head, &keys) {
            Rewrite::Keep => {
                log::trace!("Keeping {}", &source[clause.clone()]);
            }
            Rewrite::Remove => {
                log::debug!("Dropping {} from {}", &source[clause.clone()], head.join(" "));
                out.push_str(&source[cursor..clause.start]);
                let trailing = source[clause.end..].len() - source[clause.end..].trim_start().len();
                cursor = clause.end + trailing;
            }
            Rewrite::Replace => {
                log::debug!("Replacing {} with {}", &source[clause.clone()], SHARED_LAYOUT);
                out.push_str(&source[cursor..clause.start]);
                out.push_str(SHARED_LAYOUT);
                cursor = clause.end;
            }
        }

        i = close + 1;
    }

    out.push_str(&source[cursor..]);
    out
}
