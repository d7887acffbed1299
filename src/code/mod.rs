//! The embedded code sublanguage: a small Python-flavoured grammar used by
//! `${}` expressions, `<% %>` blocks, control lines and tag attributes.

mod lexer;
mod parser;
pub(crate) mod syntax;

pub(crate) use lexer::CodeError;
pub(crate) use parser::{parse_arguments, parse_expression, parse_module, parse_params, parse_signature};

/// Re-bases a code block on the indentation of its lines.
///
/// A block whose first line is blank is de-dented by the common indentation
/// of its lines. When code starts on the first line, that line sits at
/// `first_column`, the template column right after the opening delimiter.
/// Continuation lines aligned at or right of it are shifted left by the same
/// amount. Otherwise the first line is stripped and the continuation lines
/// are de-dented by their own common indentation, unless the first line
/// opens a suite that they belong to.
pub(crate) fn dedent(code: &str, first_column: usize) -> String {
    let lines: Vec<&str> = code
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .collect();
    let Some((first, rest)) = lines.split_first() else {
        return String::new();
    };

    if first.trim().is_empty() {
        let indent = common_indent(&lines);
        return join_dedented(&lines, indent);
    }

    let first_code = first.trim_start();
    let column = first_column.saturating_sub(1) + (first.len() - first_code.len());
    let indent = common_indent(rest);
    let shift = if indent >= column {
        column
    } else if opens_suite(first_code) {
        0
    } else {
        indent
    };
    let mut out = first_code.to_string();
    if !rest.is_empty() {
        out.push('\n');
        out.push_str(&join_dedented(rest, shift));
    }
    out
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn common_indent(lines: &[&str]) -> usize {
    lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| indent_of(line))
        .min()
        .unwrap_or(0)
}

fn opens_suite(line: &str) -> bool {
    let code = line.split_once('#').map_or(line, |(code, _)| code);
    code.trim_end().ends_with(':')
}

fn join_dedented(lines: &[&str], indent: usize) -> String {
    lines
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                line.get(indent..).unwrap_or_else(|| line.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
