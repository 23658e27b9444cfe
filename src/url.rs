use crate::error::{Error, Result};
use crate::metadata::EntityMetadata;
use crate::parser::options::split_top_level;
use crate::store::Row;
use crate::value::Value;

/// One parsed key predicate: `(5)`, `('EN')` or `(ID=5,LanguageKey='EN')`.
pub type KeySpec = Vec<(Option<String>, Value)>;

/// A path segment after the entity set: a navigation or property name with
/// optional key and typecast.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    pub key: Option<KeySpec>,
}

/// The decomposed request path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UrlComponents {
    pub entity_set: String,
    pub key: Option<KeySpec>,
    pub type_cast: Option<String>,
    pub segments: Vec<Segment>,
    pub is_count: bool,
    pub is_ref: bool,
    pub is_value: bool,
}

/// Parse an OData resource path (base path already stripped, no query
/// string). Segments are percent-decoded here.
pub fn parse_path(path: &str) -> Result<UrlComponents> {
    let mut components = UrlComponents::default();
    let mut segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .map(|d| d.into_owned())
                .map_err(|_| Error::validation(format!("malformed path segment: {s}")))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .peekable();

    let first = segments
        .next()
        .ok_or_else(|| Error::validation("empty resource path"))?;
    let (name, key) = split_key(&first)?;
    components.entity_set = name;
    components.key = key;

    while let Some(segment) = segments.next() {
        match segment.as_str() {
            "$count" => {
                components.is_count = true;
                if segments.peek().is_some() {
                    return Err(Error::validation("$count must be the final segment"));
                }
            }
            "$ref" => {
                components.is_ref = true;
                if segments.peek().is_some() {
                    return Err(Error::validation("$ref must be the final segment"));
                }
            }
            "$value" => {
                components.is_value = true;
                if segments.peek().is_some() {
                    return Err(Error::validation("$value must be the final segment"));
                }
            }
            _ if is_typecast(&segment) => {
                if components.segments.is_empty() {
                    components.type_cast = Some(segment);
                } else {
                    return Err(Error::validation(
                        "typecasts below the first navigation are not supported",
                    ));
                }
            }
            _ => {
                let (name, key) = split_key(&segment)?;
                components.segments.push(Segment { name, key });
            }
        }
    }
    Ok(components)
}

/// A dotted segment that is not a system segment is a qualified typecast.
fn is_typecast(segment: &str) -> bool {
    !segment.starts_with('$') && segment.contains('.') && !segment.contains('(')
}

/// Split `Name(<key>)` into the name and its parsed key.
fn split_key(segment: &str) -> Result<(String, Option<KeySpec>)> {
    let Some(open) = segment.find('(') else {
        return Ok((segment.to_string(), None));
    };
    if !segment.ends_with(')') {
        return Err(Error::validation(format!(
            "unbalanced key parentheses: {segment}"
        )));
    }
    let name = segment[..open].to_string();
    let inner = &segment[open + 1..segment.len() - 1];
    if inner.is_empty() {
        return Err(Error::validation(format!("empty key in {segment}")));
    }
    let mut key = Vec::new();
    for part in split_top_level(inner, ',') {
        let part = part.trim();
        // `name=value` only when the `=` sits outside quotes.
        let named = match part.split_once('=') {
            Some((n, v)) if !n.starts_with('\'') => Some((n.trim(), v.trim())),
            _ => None,
        };
        match named {
            Some((n, v)) => key.push((Some(n.to_string()), parse_key_value(v)?)),
            None => key.push((None, parse_key_value(part)?)),
        }
    }
    Ok((name, Some(key)))
}

fn parse_key_value(text: &str) -> Result<Value> {
    if let Some(stripped) = text.strip_prefix('\'') {
        let stripped = stripped
            .strip_suffix('\'')
            .ok_or_else(|| Error::validation(format!("unterminated key literal: {text}")))?;
        return Ok(Value::String(stripped.replace("''", "'")));
    }
    if text == "true" || text == "false" {
        return Ok(Value::Boolean(text == "true"));
    }
    if let Ok(guid) = text.parse::<uuid::Uuid>() {
        return Ok(Value::Guid(guid));
    }
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::Int(n));
    }
    if let Ok(d) = text.parse::<f64>() {
        return Ok(Value::Double(d));
    }
    Err(Error::validation(format!("invalid key literal: {text}")))
}

/// Resolve a parsed key against the declared key properties, in declaration
/// order. Positional keys are only valid for single-property keys.
pub fn resolve_key(meta: &EntityMetadata, key: &KeySpec) -> Result<Row> {
    let declared = meta.keys();
    let mut row = Row::new();
    if key.len() == 1 && key[0].0.is_none() {
        let prop = declared.first().ok_or_else(|| {
            Error::validation(format!("{} has no key properties", meta.set_name))
        })?;
        if declared.len() > 1 {
            return Err(Error::validation(format!(
                "{} requires a named composite key",
                meta.set_name
            )));
        }
        row.insert(prop.column.clone(), key[0].1.clone());
        return Ok(row);
    }
    for (name, value) in key {
        let name = name.as_deref().ok_or_else(|| {
            Error::validation("composite keys require name=value components")
        })?;
        let prop = declared
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::validation(format!("{name} is not a key property")))?;
        row.insert(prop.column.clone(), value.clone());
    }
    if row.len() != declared.len() {
        return Err(Error::validation(format!(
            "key for {} must name every key property",
            meta.set_name
        )));
    }
    Ok(row)
}

/// The `(k)` portion of a canonical URL: numeric keys bare, string keys
/// quoted with `''` escaping, composite keys in declaration order.
pub fn canonical_key(meta: &EntityMetadata, row: &Row) -> Result<String> {
    let keys = meta.keys();
    let mut parts = Vec::new();
    for key in &keys {
        let value = row.get(&key.column).ok_or_else(|| {
            Error::internal(format!(
                "row for {} is missing key column {}",
                meta.set_name, key.column
            ))
        })?;
        let literal = encode_key_literal(value);
        if keys.len() == 1 {
            parts.push(literal);
        } else {
            parts.push(format!("{}={literal}", key.name));
        }
    }
    Ok(format!("({})", parts.join(",")))
}

fn encode_key_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!(
            "'{}'",
            urlencoding::encode(&s.replace('\'', "''")).into_owned()
        ),
        other => other.key_literal(),
    }
}

/// Canonical URL of an entity (the `@odata.id` form).
pub fn canonical_url(base: &str, meta: &EntityMetadata, row: &Row) -> Result<String> {
    if meta.is_singleton {
        return Ok(format!("{base}/{}", meta.set_name));
    }
    Ok(format!(
        "{base}/{}{}",
        meta.set_name,
        canonical_key(meta, row)?
    ))
}

/// Decode a raw query string into (name, value) pairs. `+` means space.
pub fn parse_query_pairs(raw: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    if raw.is_empty() {
        return Ok(pairs);
    }
    for item in raw.split('&') {
        if item.is_empty() {
            continue;
        }
        let (name, value) = item.split_once('=').unwrap_or((item, ""));
        let decode = |s: &str| {
            urlencoding::decode(&s.replace('+', " "))
                .map(|d| d.into_owned())
                .map_err(|_| Error::validation(format!("malformed query component: {s}")))
        };
        pairs.push((decode(name)?, decode(value)?));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyMetadata;
    use crate::value::EdmType;

    fn products() -> EntityMetadata {
        EntityMetadata::new("Products", "Product", "products")
            .property(PropertyMetadata::new("ID", EdmType::Int32).key())
            .property(PropertyMetadata::new("Name", EdmType::String))
    }

    fn descriptions() -> EntityMetadata {
        EntityMetadata::new("Descriptions", "Description", "descriptions")
            .property(PropertyMetadata::new("ProductID", EdmType::Int32).key())
            .property(PropertyMetadata::new("LanguageKey", EdmType::String).key())
    }

    #[test]
    fn parses_set_and_key_forms() {
        let c = parse_path("/Products").unwrap();
        assert_eq!(c.entity_set, "Products");
        assert!(c.key.is_none());

        let c = parse_path("/Products(5)").unwrap();
        assert_eq!(c.key, Some(vec![(None, Value::Int(5))]));

        let c = parse_path("/Products(ID=5)").unwrap();
        assert_eq!(c.key, Some(vec![(Some("ID".into()), Value::Int(5))]));

        let c = parse_path("/Descriptions(ProductID=1,LanguageKey='EN')").unwrap();
        assert_eq!(
            c.key,
            Some(vec![
                (Some("ProductID".into()), Value::Int(1)),
                (Some("LanguageKey".into()), Value::String("EN".into())),
            ])
        );
    }

    #[test]
    fn quoted_keys_unescape() {
        let c = parse_path("/Products('O''Brien')").unwrap();
        assert_eq!(c.key, Some(vec![(None, Value::String("O'Brien".into()))]));
    }

    #[test]
    fn system_segments_and_navigation() {
        let c = parse_path("/Products/$count").unwrap();
        assert!(c.is_count);

        let c = parse_path("/Products(1)/Descriptions").unwrap();
        assert_eq!(c.segments.len(), 1);
        assert_eq!(c.segments[0].name, "Descriptions");

        let c = parse_path("/Products(1)/Name/$value").unwrap();
        assert!(c.is_value);
        assert_eq!(c.segments[0].name, "Name");

        let c = parse_path("/Products(1)/Category/$ref").unwrap();
        assert!(c.is_ref);

        assert!(parse_path("/Products/$count/Name").is_err());
    }

    #[test]
    fn typecast_segment() {
        let c = parse_path("/Products/Shop.PremiumProduct").unwrap();
        assert_eq!(c.type_cast.as_deref(), Some("Shop.PremiumProduct"));
    }

    #[test]
    fn resolve_key_checks_coverage() {
        let meta = products();
        let row = resolve_key(&meta, &vec![(None, Value::Int(5))]).unwrap();
        assert_eq!(row.get("ID"), Some(&Value::Int(5)));

        let composite = descriptions();
        assert!(resolve_key(&composite, &vec![(None, Value::Int(5))]).is_err());
        let row = resolve_key(
            &composite,
            &vec![
                (Some("ProductID".into()), Value::Int(1)),
                (Some("LanguageKey".into()), Value::String("EN".into())),
            ],
        )
        .unwrap();
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn canonical_urls_round_trip() {
        let meta = products();
        let mut row = Row::new();
        row.insert("ID".into(), Value::Int(6));
        assert_eq!(
            canonical_url("http://host/odata", &meta, &row).unwrap(),
            "http://host/odata/Products(6)"
        );

        let composite = descriptions();
        let mut row = Row::new();
        row.insert("ProductID".into(), Value::Int(1));
        row.insert("LanguageKey".into(), Value::String("EN".into()));
        assert_eq!(
            canonical_url("http://host", &composite, &row).unwrap(),
            "http://host/Descriptions(ProductID=1,LanguageKey='EN')"
        );
    }

    #[test]
    fn query_pairs_decode() {
        let pairs = parse_query_pairs("$filter=Price%20gt%20500&$top=2").unwrap();
        assert_eq!(pairs[0], ("$filter".into(), "Price gt 500".into()));
        assert_eq!(pairs[1], ("$top".into(), "2".into()));
    }
}
