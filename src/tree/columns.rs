//! Column projection parsing.
//!
//! A projected column is either a plain column name or a JSON-path
//! expression over a JSON column: `col->key`, `col->key->0`, or
//! `col#>{a,b,c}->0`. Paths compile to native `->` accessors later; here
//! they are only parsed and validated.

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    Key(String),
    Index(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedColumn {
    /// Base column name as present in reflection.
    pub column: String,
    /// JSON path below the column; empty for plain columns.
    pub path: Vec<PathSeg>,
    /// Output key in the document.
    pub key: String,
}

impl ProjectedColumn {
    pub fn plain(column: &str) -> Self {
        Self {
            column: column.to_string(),
            path: Vec::new(),
            key: column.to_string(),
        }
    }
}

/// Parse one `columns` entry.
pub fn parse(raw: &str) -> Result<ProjectedColumn, ConfigError> {
    let invalid = || ConfigError::InvalidSchema(format!("unsupported column expression: {raw}"));

    let raw = raw.trim();
    if raw.is_empty() {
        return Err(invalid());
    }

    let (head, rest) = match raw.split_once("#>") {
        Some((column, path)) => {
            // col#>{a,b,c} optionally followed by ->i segments.
            let (braced, tail) = match path.split_once("->") {
                Some((braced, tail)) => (braced, Some(tail)),
                None => (path, None),
            };
            let inner = braced
                .trim()
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or_else(invalid)?;
            let mut segs: Vec<PathSeg> = Vec::new();
            for part in inner.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    return Err(invalid());
                }
                segs.push(PathSeg::Key(part.to_string()));
            }
            if let Some(tail) = tail {
                segs.extend(parse_arrow_segments(tail).ok_or_else(invalid)?);
            }
            (column, segs)
        }
        None => match raw.split_once("->") {
            Some((column, tail)) => (column, parse_arrow_segments(tail).ok_or_else(invalid)?),
            None => (raw, Vec::new()),
        },
    };

    let column = head.trim();
    if column.is_empty() || column.contains(['{', '}', '>', ' ']) {
        return Err(invalid());
    }

    // The output key defaults to the deepest object key, falling back to
    // the column itself for pure index paths.
    let key = rest
        .iter()
        .rev()
        .find_map(|seg| match seg {
            PathSeg::Key(k) => Some(k.clone()),
            PathSeg::Index(_) => None,
        })
        .unwrap_or_else(|| column.to_string());

    Ok(ProjectedColumn {
        column: column.to_string(),
        path: rest,
        key,
    })
}

fn parse_arrow_segments(tail: &str) -> Option<Vec<PathSeg>> {
    let mut segs = Vec::new();
    for part in tail.split("->") {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        match part.parse::<i64>() {
            Ok(i) => segs.push(PathSeg::Index(i)),
            Err(_) => segs.push(PathSeg::Key(part.to_string())),
        }
    }
    Some(segs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_plain_column() {
        let c = parse("isbn").unwrap();
        assert_eq!(c.column, "isbn");
        assert!(c.path.is_empty());
        assert_eq!(c.key, "isbn");
    }

    #[test]
    fn test_arrow_key() {
        let c = parse("meta->publisher").unwrap();
        assert_eq!(c.column, "meta");
        assert_eq!(c.path, vec![PathSeg::Key("publisher".into())]);
        assert_eq!(c.key, "publisher");
    }

    #[test]
    fn test_arrow_key_index() {
        let c = parse("meta->tags->0").unwrap();
        assert_eq!(
            c.path,
            vec![PathSeg::Key("tags".into()), PathSeg::Index(0)]
        );
        assert_eq!(c.key, "tags");
    }

    #[test]
    fn test_braced_path_with_index() {
        let c = parse("meta#>{a,b,c}->1").unwrap();
        assert_eq!(c.column, "meta");
        assert_eq!(
            c.path,
            vec![
                PathSeg::Key("a".into()),
                PathSeg::Key("b".into()),
                PathSeg::Key("c".into()),
                PathSeg::Index(1)
            ]
        );
        assert_eq!(c.key, "c");
    }

    #[rstest]
    #[case("")]
    #[case("meta#>a,b")]
    #[case("meta#>{}")]
    #[case("meta#>{a,,b}")]
    #[case("meta->")]
    #[case("->key")]
    fn test_invalid_expressions(#[case] raw: &str) {
        assert!(parse(raw).is_err());
    }
}
