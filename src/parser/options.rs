use crate::ast::{
    ComputeItem, ExpandLevels, ExpandNode, OrderByItem, QueryOptions, SearchExpr, SelectItem,
};
use crate::error::{Error, Result};
use crate::parser::apply::parse_apply;
use crate::parser::filter::parse_expression;

/// Recognized dollar-prefixed option names (case-sensitive).
const KNOWN_OPTIONS: &[&str] = &[
    "$filter",
    "$select",
    "$expand",
    "$orderby",
    "$top",
    "$skip",
    "$count",
    "$search",
    "$apply",
    "$compute",
    "$format",
    "$skiptoken",
    "$deltatoken",
];

/// Parse decoded `(name, value)` query pairs into a `QueryOptions` record.
/// `max_expand_depth` bounds `$expand` nesting and `$levels`.
pub fn parse_query_options(
    pairs: &[(String, String)],
    max_expand_depth: u32,
) -> Result<QueryOptions> {
    let mut options = QueryOptions::default();
    for (name, value) in pairs {
        if let Some(alias) = name.strip_prefix('@') {
            let expr = parse_expression(value)?;
            options.aliases.insert(alias.to_string(), expr);
            continue;
        }
        if !name.starts_with('$') {
            // Custom options are ignored.
            continue;
        }
        if !KNOWN_OPTIONS.contains(&name.as_str()) {
            return Err(Error::validation(format!("unknown query option {name}")));
        }
        apply_option(&mut options, name, value, max_expand_depth)?;
    }
    Ok(options)
}

fn apply_option(
    options: &mut QueryOptions,
    name: &str,
    value: &str,
    max_expand_depth: u32,
) -> Result<()> {
    match name {
        "$filter" => options.filter = Some(parse_expression(value)?),
        "$select" => options.select = parse_select(value)?,
        "$expand" => options.expand = parse_expand(value, max_expand_depth, 1)?,
        "$orderby" => options.order_by = parse_orderby(value)?,
        "$top" => options.top = Some(parse_non_negative(name, value)?),
        "$skip" => options.skip = Some(parse_non_negative(name, value)?),
        "$count" => {
            options.count = Some(match value {
                "true" => true,
                "false" => false,
                other => {
                    return Err(Error::validation(format!(
                        "$count must be true or false, got {other}"
                    )));
                }
            })
        }
        "$search" => options.search = Some(parse_search(value)?),
        "$apply" => options.apply = parse_apply(value)?,
        "$compute" => options.compute = parse_compute(value)?,
        "$format" => options.format = Some(value.to_string()),
        "$skiptoken" => options.skip_token = Some(value.to_string()),
        "$deltatoken" => options.delta_token = Some(value.to_string()),
        _ => unreachable!("filtered by KNOWN_OPTIONS"),
    }
    Ok(())
}

fn parse_non_negative(name: &str, value: &str) -> Result<u64> {
    let n: i64 = value
        .parse()
        .map_err(|_| Error::validation(format!("{name} must be an integer, got {value}")))?;
    u64::try_from(n).map_err(|_| Error::validation(format!("{name} must not be negative")))
}

/// Split on `sep` at nesting depth zero; commas inside quotes or parentheses
/// are not separators.
pub(crate) fn split_top_level(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;
    let mut in_quote = false;
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quote {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    current.push(c);
                    current.push(chars.next().unwrap());
                    continue;
                }
                in_quote = false;
            }
            current.push(c);
            continue;
        }
        match c {
            '\'' => {
                in_quote = true;
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || !parts.is_empty() {
        parts.push(current);
    }
    parts
}

fn parse_select(value: &str) -> Result<Vec<SelectItem>> {
    let mut items = Vec::new();
    for raw in split_top_level(value, ',') {
        let item = raw.trim();
        if item.is_empty() {
            return Err(Error::validation("$select contains an empty item"));
        }
        if item == "*" {
            items.push(SelectItem::Wildcard);
        } else {
            items.push(SelectItem::Path(
                item.split('/').map(|s| s.trim().to_string()).collect(),
            ));
        }
    }
    Ok(items)
}

fn parse_orderby(value: &str) -> Result<Vec<OrderByItem>> {
    let mut items = Vec::new();
    for raw in split_top_level(value, ',') {
        let item = raw.trim();
        let mut words = item.split_whitespace();
        let path = words
            .next()
            .ok_or_else(|| Error::validation("$orderby contains an empty item"))?;
        let descending = match words.next() {
            None => false,
            Some("asc") => false,
            Some("desc") => true,
            Some(other) => {
                return Err(Error::validation(format!(
                    "invalid $orderby direction: {other}"
                )));
            }
        };
        if let Some(extra) = words.next() {
            return Err(Error::validation(format!(
                "unexpected token after $orderby direction: {extra}"
            )));
        }
        items.push(OrderByItem {
            path: path.split('/').map(str::to_string).collect(),
            descending,
        });
    }
    Ok(items)
}

fn parse_compute(value: &str) -> Result<Vec<ComputeItem>> {
    let mut items = Vec::new();
    for raw in split_top_level(value, ',') {
        let item = raw.trim();
        let (expr_text, alias) = item.rsplit_once(" as ").ok_or_else(|| {
            Error::validation(format!("$compute item must be `expr as Alias`: {item}"))
        })?;
        let alias = alias.trim();
        if alias.is_empty() || alias.contains(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
            return Err(Error::validation(format!("invalid compute alias: {alias}")));
        }
        items.push(ComputeItem {
            expr: parse_expression(expr_text.trim())?,
            alias: alias.to_string(),
        });
    }
    Ok(items)
}

/// Parse a `$expand` list. `depth` is the current nesting level, 1-based.
pub(crate) fn parse_expand(
    value: &str,
    max_depth: u32,
    depth: u32,
) -> Result<Vec<ExpandNode>> {
    if depth > max_depth {
        return Err(Error::validation(format!(
            "$expand nesting exceeds the maximum depth of {max_depth}"
        )));
    }
    let mut nodes = Vec::new();
    for raw in split_top_level(value, ',') {
        let item = raw.trim();
        if item.is_empty() {
            return Err(Error::validation("$expand contains an empty item"));
        }
        let (path_text, nested) = match item.find('(') {
            Some(open) if item.ends_with(')') => {
                (&item[..open], Some(&item[open + 1..item.len() - 1]))
            }
            Some(_) => {
                return Err(Error::validation(format!(
                    "unbalanced parentheses in $expand item: {item}"
                )));
            }
            None => (item, None),
        };
        let path: Vec<String> = path_text
            .trim()
            .split('/')
            .map(|s| s.trim().to_string())
            .collect();
        if path.iter().any(String::is_empty) {
            return Err(Error::validation(format!(
                "invalid $expand path: {path_text}"
            )));
        }
        let mut node = ExpandNode {
            path,
            options: Box::default(),
            levels: None,
        };
        if let Some(nested) = nested {
            parse_expand_options(&mut node, nested, max_depth, depth)?;
        }
        nodes.push(node);
    }
    Ok(nodes)
}

/// Nested expand options use `;` separators inside the parentheses.
fn parse_expand_options(
    node: &mut ExpandNode,
    nested: &str,
    max_depth: u32,
    depth: u32,
) -> Result<()> {
    for raw in split_top_level(nested, ';') {
        let part = raw.trim();
        if part.is_empty() {
            continue;
        }
        let (name, value) = part
            .split_once('=')
            .ok_or_else(|| Error::validation(format!("malformed expand option: {part}")))?;
        let (name, value) = (name.trim(), value.trim());
        match name {
            "$levels" => {
                node.levels = Some(if value == "max" {
                    ExpandLevels::Max
                } else {
                    let n: u32 = value.parse().map_err(|_| {
                        Error::validation(format!("$levels must be an integer or max: {value}"))
                    })?;
                    // Values beyond the server cap clamp silently.
                    ExpandLevels::Depth(n.min(max_depth))
                });
            }
            "$expand" => {
                node.options.expand = parse_expand(value, max_depth, depth + 1)?;
            }
            _ if KNOWN_OPTIONS.contains(&name) => {
                apply_option(&mut node.options, name, value, max_depth)?;
            }
            _ => {
                return Err(Error::validation(format!(
                    "unknown expand option {name}"
                )));
            }
        }
    }
    Ok(())
}

/// `$search` grammar: terms and quoted phrases, NOT / AND / OR (in decreasing
/// binding order), parentheses, implicit AND between adjacent terms.
fn parse_search(value: &str) -> Result<SearchExpr> {
    let tokens = search_tokens(value)?;
    let mut parser = SearchParser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(Error::validation("trailing input in $search expression"));
    }
    Ok(expr)
}

#[derive(Debug, PartialEq)]
enum SearchToken {
    Term(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn search_tokens(input: &str) -> Result<Vec<SearchToken>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(SearchToken::Open);
            }
            ')' => {
                chars.next();
                tokens.push(SearchToken::Close);
            }
            '"' => {
                chars.next();
                let mut phrase = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => phrase.push(c),
                        None => {
                            return Err(Error::validation("unterminated phrase in $search"));
                        }
                    }
                }
                tokens.push(SearchToken::Term(phrase));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(match word.as_str() {
                    "AND" => SearchToken::And,
                    "OR" => SearchToken::Or,
                    "NOT" => SearchToken::Not,
                    _ => SearchToken::Term(word),
                });
            }
        }
    }
    Ok(tokens)
}

struct SearchParser {
    tokens: Vec<SearchToken>,
    pos: usize,
}

impl SearchParser {
    fn parse_or(&mut self) -> Result<SearchExpr> {
        let mut left = self.parse_and()?;
        while self.tokens.get(self.pos) == Some(&SearchToken::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = SearchExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<SearchExpr> {
        let mut left = self.parse_not()?;
        loop {
            match self.tokens.get(self.pos) {
                Some(SearchToken::And) => {
                    self.pos += 1;
                }
                // Adjacent terms imply AND.
                Some(SearchToken::Term(_) | SearchToken::Not | SearchToken::Open) => {}
                _ => break,
            }
            let right = self.parse_not()?;
            left = SearchExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<SearchExpr> {
        if self.tokens.get(self.pos) == Some(&SearchToken::Not) {
            self.pos += 1;
            return Ok(SearchExpr::Not(Box::new(self.parse_not()?)));
        }
        match self.tokens.get(self.pos) {
            Some(SearchToken::Term(t)) => {
                let t = t.clone();
                self.pos += 1;
                Ok(SearchExpr::Term(t))
            }
            Some(SearchToken::Open) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.tokens.get(self.pos) != Some(&SearchToken::Close) {
                    return Err(Error::validation("expected ) in $search expression"));
                }
                self.pos += 1;
                Ok(inner)
            }
            _ => Err(Error::validation("expected a term in $search expression")),
        }
    }
}
