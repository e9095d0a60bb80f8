//! Split a Markdown note into YAML frontmatter and body, and put it back
//! together after the frontmatter has been rewritten.

use anyhow::{bail, Result};
use serde_yaml::{Mapping, Value};

/// Parse `content` into its frontmatter mapping and body.
///
/// The first line must be `---` and a later line must be `---`. A document
/// without delimiters, or whose YAML is not a mapping, is an error. An
/// empty block yields an empty mapping.
pub fn parse(content: &str) -> Result<(Mapping, String)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut lines = content.split_inclusive('\n');
    let first = lines.next().unwrap_or("");
    if first.trim_end() != "---" {
        bail!("the note must start with a '---' frontmatter block");
    }

    let mut offset = first.len();
    let yaml_start = offset;
    let mut yaml_end = None;
    for line in lines {
        if line.trim_end() == "---" {
            yaml_end = Some((offset, offset + line.len()));
            break;
        }
        offset += line.len();
    }

    let Some((yaml_end, body_start)) = yaml_end else {
        bail!("the frontmatter block is not closed with '---'");
    };

    let yaml = &content[yaml_start..yaml_end];
    let body = content[body_start..].to_string();

    let value: Value = if yaml.trim().is_empty() {
        Value::Null
    } else {
        serde_yaml::from_str(yaml).map_err(|e| anyhow::anyhow!("invalid YAML frontmatter: {}", e))?
    };

    match value {
        Value::Mapping(m) => Ok((m, body)),
        Value::Null => Ok((Mapping::new(), body)),
        _ => bail!("the frontmatter must be a YAML mapping"),
    }
}

/// Serialize a frontmatter mapping and a body back into Markdown text.
pub fn render(frontmatter: &Mapping, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(frontmatter)?;
    let mut out = String::with_capacity(yaml.len() + body.len() + 8);
    out.push_str("---\n");
    out.push_str(&yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("---\n");
    out.push_str(body);
    Ok(out)
}

pub fn get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(Value::String(key.to_string()))
}

/// First present key among `keys`.
pub fn get_any<'a>(map: &'a Mapping, keys: &[&str]) -> Option<(&'a Value, usize)> {
    keys.iter()
        .enumerate()
        .find_map(|(i, k)| get(map, k).map(|v| (v, i)))
}

pub fn get_str<'a>(map: &'a Mapping, key: &str) -> Option<&'a str> {
    get(map, key).and_then(Value::as_str)
}

pub fn set(map: &mut Mapping, key: &str, value: Value) {
    map.insert(Value::String(key.to_string()), value);
}

pub fn set_str(map: &mut Mapping, key: &str, value: impl Into<String>) {
    set(map, key, Value::String(value.into()));
}

/// Convert YAML to JSON for API responses. Non-string keys are stringified.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Sequence(seq) => serde_json::Value::Array(seq.iter().map(to_json).collect()),
        Value::Mapping(m) => mapping_to_json(m),
        Value::Tagged(tagged) => to_json(&tagged.value),
    }
}

pub fn mapping_to_json(map: &Mapping) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for (k, v) in map {
        let key = match k {
            Value::String(s) => s.clone(),
            other => serde_yaml::to_string(other)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        };
        obj.insert(key, to_json(v));
    }
    serde_json::Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mapping_and_body() {
        let text = "---\nbookTitle: Dune\ntags: [sf, classic]\n---\n\n# Notes\nBody.\n";
        let (fm, body) = parse(text).unwrap();
        assert_eq!(get_str(&fm, "bookTitle"), Some("Dune"));
        assert_eq!(body, "\n# Notes\nBody.\n");
    }

    #[test]
    fn crlf_delimiters_are_accepted() {
        let text = "---\r\ntitle: X\r\n---\r\nbody";
        let (fm, body) = parse(text).unwrap();
        assert_eq!(get_str(&fm, "title"), Some("X"));
        assert_eq!(body, "body");
    }

    #[test]
    fn missing_delimiters_fail() {
        assert!(parse("just a body").is_err());
        assert!(parse("---\ntitle: open\nno end").is_err());
    }

    #[test]
    fn empty_block_gives_empty_mapping() {
        let (fm, body) = parse("---\n---\nbody").unwrap();
        assert!(fm.is_empty());
        assert_eq!(body, "body");
    }

    #[test]
    fn scalar_frontmatter_is_rejected() {
        assert!(parse("---\njust a string\n---\n").is_err());
    }

    #[test]
    fn render_then_parse_keeps_rewritten_fields() {
        let (mut fm, body) = parse("---\nbookTitle: Dune\n---\nText\n").unwrap();
        set_str(&mut fm, "contributor", "Ada");
        let text = render(&fm, &body).unwrap();
        assert!(text.starts_with("---\n"));
        let (again, again_body) = parse(&text).unwrap();
        assert_eq!(get_str(&again, "contributor"), Some("Ada"));
        assert_eq!(again_body, "Text\n");
    }

    #[test]
    fn get_any_reports_which_alias_matched() {
        let (fm, _) = parse("---\ntitle: Alias\n---\n").unwrap();
        let (value, idx) = get_any(&fm, &["bookTitle", "title"]).unwrap();
        assert_eq!(value.as_str(), Some("Alias"));
        assert_eq!(idx, 1);
    }

    #[test]
    fn converts_to_json() {
        let (fm, _) = parse("---\nyear: 1965\ntags: [a]\nimage:\n  url: /x.png\n---\n").unwrap();
        let json = mapping_to_json(&fm);
        assert_eq!(json["year"], 1965);
        assert_eq!(json["tags"][0], "a");
        assert_eq!(json["image"]["url"], "/x.png");
    }
}
