//! Token-level source rewriting for sugar forms
//!
//! `offline function M:name(...) ... end` is expanded before parsing: the
//! `offline` marker token is removed and two statements are appended after
//! the function's `end` that register the API name in the module table's
//! `__offline_apis` list. Every synthetic token carries the line number of
//! the `end` token, so the line numbers of all other statements are
//! unchanged.

use crate::lexer::{SyntaxError, Token, TokenKind, TokenStream};

/// The runtime-visible list the rewrite appends into
pub const OFFLINE_LIST_FIELD: &str = "__offline_apis";

/// Expand all `offline` markers, returning the rewritten stream and the
/// collected offline API names in source order
pub fn expand_offline_markers(
    stream: &TokenStream,
) -> Result<(TokenStream, Vec<String>), SyntaxError> {
    let mut current = stream.clone();
    let mut names = Vec::new();
    loop {
        let marker = current
            .tokens()
            .iter()
            .position(|t| t.is_keyword("offline"));
        let index = match marker {
            Some(index) => index,
            None => break,
        };
        let (table, api, end_index) = locate_offline_function(&current, index)?;
        names.push(api.clone());

        // drop the marker token first; the function shifts left by one
        let without_marker = current.replace_range(index, index + 1, Vec::new());
        let end_index = end_index - 1;
        let end_line = without_marker.tokens()[end_index].line;
        let inserted = offline_registration_tokens(&table, &api, end_line);
        current = without_marker.replace_range(end_index + 1, end_index + 1, inserted);
    }
    Ok((current, names))
}

/// Validate the marker position and find the function's matching `end`
fn locate_offline_function(
    stream: &TokenStream,
    marker: usize,
) -> Result<(String, String, usize), SyntaxError> {
    let tokens = stream.tokens();
    let line = tokens[marker].line;
    let err = |msg: &str| SyntaxError::new(line, msg);

    if !tokens.get(marker + 1).map_or(false, |t| t.is_keyword("function")) {
        return Err(err("'offline' must be followed by a function declaration"));
    }
    let table = tokens
        .get(marker + 2)
        .filter(|t| t.kind == TokenKind::Name)
        .ok_or_else(|| err("'offline' function must be declared on a module table"))?
        .text
        .clone();
    let sep = tokens.get(marker + 3);
    if !sep.map_or(false, |t| t.is_operator(":") || t.is_operator(".")) {
        return Err(err("'offline' function must be declared on a module table"));
    }
    let api = tokens
        .get(marker + 4)
        .filter(|t| t.kind == TokenKind::Name)
        .ok_or_else(|| err("'offline' function is missing an api name"))?
        .text
        .clone();

    // find the matching `end`; `function`, `if` and `do` open nested blocks
    // (`while`/`for` close through their own `do`)
    let mut depth = 1usize;
    let mut i = marker + 5;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.kind == TokenKind::Keyword {
            match tok.text.as_str() {
                "function" | "if" | "do" => depth += 1,
                "end" => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok((table, api, i));
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    Err(err("unterminated 'offline' function declaration"))
}

/// `M["__offline_apis"] = M["__offline_apis"] or {}` followed by
/// `M["__offline_apis"][#M["__offline_apis"] + 1] = "api"`
fn offline_registration_tokens(table: &str, api: &str, line: usize) -> Vec<Token> {
    let name = |text: &str| Token::new(TokenKind::Name, text, line, 1);
    let op = |text: &str| Token::new(TokenKind::Operator, text, line, 1);
    let kw = |text: &str| Token::new(TokenKind::Keyword, text, line, 1);
    let string = |text: &str| Token::new(TokenKind::Str, text, line, 1);
    let int = |text: &str| Token::new(TokenKind::Int, text, line, 1);

    let list = |tokens: &mut Vec<Token>| {
        tokens.push(name(table));
        tokens.push(op("["));
        tokens.push(string(OFFLINE_LIST_FIELD));
        tokens.push(op("]"));
    };

    let mut tokens = Vec::new();
    // first statement: ensure the list exists
    list(&mut tokens);
    tokens.push(op("="));
    list(&mut tokens);
    tokens.push(kw("or"));
    tokens.push(op("{"));
    tokens.push(op("}"));
    tokens.push(op(";"));
    // second statement: append the api name
    list(&mut tokens);
    tokens.push(op("["));
    tokens.push(op("#"));
    list(&mut tokens);
    tokens.push(op("+"));
    tokens.push(int("1"));
    tokens.push(op("]"));
    tokens.push(op("="));
    tokens.push(string(api));
    tokens.push(op(";"));
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_syntax;

    #[test]
    fn test_marker_removed_and_name_collected() {
        let source = "var M = {}\noffline function M:query(arg: string)\nreturn \"ok\"\nend\nreturn M";
        let stream = tokenize(source).unwrap();
        let (rewritten, names) = expand_offline_markers(&stream).unwrap();
        assert_eq!(names, vec!["query"]);
        assert!(!rewritten.tokens().iter().any(|t| t.is_keyword("offline")));
        // the rewritten stream must parse cleanly
        parse_syntax(&rewritten).unwrap();
    }

    #[test]
    fn test_other_statement_lines_unchanged() {
        let source = "var M = {}\noffline function M:query()\nreturn \"ok\"\nend\nlet after = 1";
        let stream = tokenize(source).unwrap();
        let (rewritten, _) = expand_offline_markers(&stream).unwrap();
        let after = rewritten
            .tokens()
            .iter()
            .find(|t| t.text == "after")
            .expect("token after");
        assert_eq!(after.line, 5);
        // synthetic tokens sit on the line of the closing `end`
        let synthetic = rewritten
            .tokens()
            .iter()
            .find(|t| t.text == OFFLINE_LIST_FIELD)
            .expect("synthetic token");
        assert_eq!(synthetic.line, 4);
    }

    #[test]
    fn test_multiple_markers() {
        let source = "var M = {}\n\
                      offline function M:a()\nend\n\
                      function M:b()\nend\n\
                      offline function M:c()\nend";
        let stream = tokenize(source).unwrap();
        let (rewritten, names) = expand_offline_markers(&stream).unwrap();
        assert_eq!(names, vec!["a", "c"]);
        parse_syntax(&rewritten).unwrap();
    }

    #[test]
    fn test_nested_blocks_inside_offline_function() {
        let source = "var M = {}\n\
                      offline function M:q()\n\
                      if true then\nfor i = 1, 2 do\nprint(i)\nend\nend\n\
                      end\n\
                      return M";
        let stream = tokenize(source).unwrap();
        let (rewritten, names) = expand_offline_markers(&stream).unwrap();
        assert_eq!(names, vec!["q"]);
        parse_syntax(&rewritten).unwrap();
    }

    #[test]
    fn test_marker_without_function_rejected() {
        let stream = tokenize("offline let x = 1").unwrap();
        let err = expand_offline_markers(&stream).unwrap_err();
        assert!(err.message.contains("must be followed by a function"));
    }

    #[test]
    fn test_marker_on_plain_function_rejected() {
        let stream = tokenize("offline function f()\nend").unwrap();
        let err = expand_offline_markers(&stream).unwrap_err();
        assert!(err.message.contains("module table"));
    }
}
