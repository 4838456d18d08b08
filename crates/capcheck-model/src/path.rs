//! Mutation paths for addressing sub-fields of a reflected value
//!
//! Provides [`MutationPath`], the parsed form of strings such as
//! `.translation.x`, `.children[0]` or `.0` (tuple element). The empty
//! string addresses the root value.

use crate::error::ModelError;
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// One step within a mutation path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Named struct field (`.name`) or tuple element (`.0`)
    Field(String),
    /// Array / list element (`[3]`)
    Index(usize),
}

/// Parsed mutation path
///
/// # Examples
/// - `""` → root
/// - `.translation.x` → `[Field(translation), Field(x)]`
/// - `.points[2].0` → `[Field(points), Index(2), Field(0)]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MutationPath(Vec<PathSegment>);

impl MutationPath {
    /// Root path (whole value)
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Check if this addresses the root value
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Get path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Resolve the path against a JSON value
    ///
    /// Tuple elements (`.0`) are looked up as array indices when the
    /// container is an array and as object keys otherwise. Returns `None`
    /// when any step is missing.
    #[must_use]
    pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(value, |current, segment| match segment {
            PathSegment::Field(name) => match current {
                Value::Object(map) => map.get(name),
                Value::Array(items) => name.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            },
            PathSegment::Index(i) => current.as_array().and_then(|items| items.get(*i)),
        })
    }

    /// Mutable counterpart of [`resolve`](Self::resolve)
    #[must_use]
    pub fn resolve_mut<'a>(&self, value: &'a mut Value) -> Option<&'a mut Value> {
        self.0.iter().try_fold(value, |current, segment| match segment {
            PathSegment::Field(name) => match current {
                Value::Object(map) => map.get_mut(name),
                Value::Array(items) => name.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
                _ => None,
            },
            PathSegment::Index(i) => current.as_array_mut().and_then(|items| items.get_mut(*i)),
        })
    }
}

impl FromStr for MutationPath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ModelError::InvalidPath {
            path: s.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    let mut name = String::new();
                    while let Some(&next) = chars.peek() {
                        if next == '.' || next == '[' {
                            break;
                        }
                        name.push(next);
                        chars.next();
                    }
                    if name.is_empty() {
                        return Err(invalid("empty field name"));
                    }
                    segments.push(PathSegment::Field(name));
                }
                '[' => {
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(d) => digits.push(d),
                            None => return Err(invalid("unterminated index")),
                        }
                    }
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| invalid("index is not an unsigned integer"))?;
                    segments.push(PathSegment::Index(index));
                }
                _ => return Err(invalid("expected `.` or `[`")),
            }
        }

        Ok(Self(segments))
    }
}

impl Display for MutationPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            match segment {
                PathSegment::Field(name) => write!(f, ".{name}")?,
                PathSegment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn parse_root() {
        let path = MutationPath::from_str("").unwrap();
        assert!(path.is_root());
    }

    #[test]
    fn parse_nested_fields_and_indices() {
        let path = MutationPath::from_str(".points[2].0").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Field("points".into()),
                PathSegment::Index(2),
                PathSegment::Field("0".into()),
            ]
        );
        assert_eq!(path.to_string(), ".points[2].0");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(MutationPath::from_str("translation").is_err());
        assert!(MutationPath::from_str(".a[").is_err());
        assert!(MutationPath::from_str(".a[x]").is_err());
        assert!(MutationPath::from_str("..a").is_err());
    }

    #[test]
    fn resolve_struct_and_tuple_fields() {
        let value = json!({"translation": [1.0, 2.0, 3.0], "scale": {"x": 4.0}});
        let path = MutationPath::from_str(".translation.1").unwrap();
        assert_eq!(path.resolve(&value), Some(&json!(2.0)));

        let path = MutationPath::from_str(".scale.x").unwrap();
        assert_eq!(path.resolve(&value), Some(&json!(4.0)));

        let path = MutationPath::from_str(".missing").unwrap();
        assert_eq!(path.resolve(&value), None);
    }

    #[test]
    fn resolve_mut_writes_in_place() {
        let mut value = json!({"points": [[0, 1], [2, 3]]});
        let path = MutationPath::from_str(".points[1].0").unwrap();
        *path.resolve_mut(&mut value).unwrap() = json!(9);
        assert_eq!(value, json!({"points": [[0, 1], [9, 3]]}));
    }

    fn segment() -> impl Strategy<Value = PathSegment> {
        prop_oneof![
            "[a-z_][a-z0-9_]{0,8}".prop_map(PathSegment::Field),
            (0usize..4).prop_map(PathSegment::Index),
        ]
    }

    /// Wrap `leaf` so that `segments` lead to it
    fn nest(segments: &[PathSegment], leaf: Value) -> Value {
        segments.iter().rev().fold(leaf, |inner, segment| match segment {
            PathSegment::Field(name) => json!({ name.clone(): inner }),
            PathSegment::Index(i) => {
                let mut items = vec![Value::Null; *i];
                items.push(inner);
                Value::Array(items)
            }
        })
    }

    proptest! {
        #[test]
        fn nested_leaf_is_found_through_rendered_path(
            segments in proptest::collection::vec(segment(), 0..6),
            leaf in any::<i64>(),
        ) {
            let value = nest(&segments, json!(leaf));
            let path: MutationPath = MutationPath(segments).to_string().parse().unwrap();
            prop_assert_eq!(path.resolve(&value), Some(&json!(leaf)));
        }
    }
}
