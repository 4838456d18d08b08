//! Declarative allow-list of anticipated changes
//!
//! Rules are data, loaded from TOML or JSON, so new known-benign change
//! patterns can be added without touching the comparator.
//!
//! A rule applies to a change when every selector it sets matches:
//! - `location`: regex over the JSON pointer of the changed leaf
//! - `type_name`: regex over the type's fully-qualified name
//! - `kinds`: allowed [`ChangeKind`]s (empty means any)
//! - `when`: a [`Condition`] over the baseline and current values
//!
//! ```toml
//! [[rules]]
//! id = "enum-variant-qualified"
//! description = "Enum variants gained their type prefix"
//! kinds = ["value_changed"]
//! when = { op = "equal_after_replace", side = "current", pattern = "^(?:[A-Za-z_][A-Za-z0-9_]*::)+", replacement = "" }
//! ```

use crate::error::DiffError;
use crate::report::{ChangeKind, FieldChange};
use capcheck_model::TypeName;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Id of the rule shipped with the comparator
pub const ENUM_VARIANT_QUALIFIED: &str = "enum-variant-qualified";

const QUALIFIED_PREFIX: &str = "^(?:[A-Za-z_][A-Za-z0-9_]*::)+";

/// Which value of a change a condition inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Baseline,
    Current,
}

impl Side {
    fn pick<'a>(self, change: &'a FieldChange) -> Option<&'a Value> {
        match self {
            Side::Baseline => change.baseline.as_ref(),
            Side::Current => change.current.as_ref(),
        }
    }

    fn other(self) -> Self {
        match self {
            Side::Baseline => Side::Current,
            Side::Current => Side::Baseline,
        }
    }
}

/// JSON value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonType {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonType::Null,
            Value::Bool(_) => JsonType::Bool,
            Value::Number(_) => JsonType::Number,
            Value::String(_) => JsonType::String,
            Value::Array(_) => JsonType::Array,
            Value::Object(_) => JsonType::Object,
        }
    }
}

/// Predicate over a change's values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Every sub-condition holds
    All { of: Vec<Condition> },
    /// At least one sub-condition holds
    Any { of: Vec<Condition> },
    Not { cond: Box<Condition> },
    /// The side's value matches a regex (strings as-is, other values as JSON text)
    Matches { side: Side, pattern: String },
    /// The side's value equals a literal
    Equals { side: Side, value: Value },
    IsType { side: Side, json_type: JsonType },
    /// After a regex replacement on `side`, both sides are equal strings
    EqualAfterReplace {
        side: Side,
        pattern: String,
        replacement: String,
    },
}

/// One declarative rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<ChangeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

impl AllowRule {
    /// The shipped rule: a bare enum variant became fully qualified
    #[must_use]
    pub fn enum_variant_qualified() -> Self {
        Self {
            id: ENUM_VARIANT_QUALIFIED.to_string(),
            description: "Enum variant names gained their type path prefix".to_string(),
            location: None,
            type_name: None,
            kinds: vec![ChangeKind::ValueChanged],
            when: Some(Condition::All {
                of: vec![
                    Condition::IsType {
                        side: Side::Baseline,
                        json_type: JsonType::String,
                    },
                    Condition::EqualAfterReplace {
                        side: Side::Current,
                        pattern: QUALIFIED_PREFIX.to_string(),
                        replacement: String::new(),
                    },
                ],
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<AllowRule>,
}

#[derive(Debug)]
enum Compiled {
    All(Vec<Compiled>),
    Any(Vec<Compiled>),
    Not(Box<Compiled>),
    Matches(Side, Regex),
    Equals(Side, Value),
    IsType(Side, JsonType),
    EqualAfterReplace(Side, Regex, String),
}

impl Compiled {
    fn eval(&self, change: &FieldChange) -> bool {
        match self {
            Compiled::All(of) => of.iter().all(|c| c.eval(change)),
            Compiled::Any(of) => of.iter().any(|c| c.eval(change)),
            Compiled::Not(inner) => !inner.eval(change),
            Compiled::Matches(side, re) => match side.pick(change) {
                Some(Value::String(s)) => re.is_match(s),
                Some(other) => re.is_match(&other.to_string()),
                None => false,
            },
            Compiled::Equals(side, value) => side.pick(change) == Some(value),
            Compiled::IsType(side, ty) => side.pick(change).is_some_and(|v| JsonType::of(v) == *ty),
            Compiled::EqualAfterReplace(side, re, replacement) => {
                match (side.pick(change), side.other().pick(change)) {
                    (Some(Value::String(this)), Some(Value::String(that))) => {
                        re.replace_all(this, replacement.as_str()) == that.as_str()
                    }
                    _ => false,
                }
            }
        }
    }
}

fn compile_regex(rule: &str, pattern: &str) -> Result<Regex, DiffError> {
    Regex::new(pattern).map_err(|source| DiffError::InvalidPattern {
        rule: rule.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

fn compile(rule: &str, condition: &Condition) -> Result<Compiled, DiffError> {
    Ok(match condition {
        Condition::All { of } => Compiled::All(
            of.iter()
                .map(|c| compile(rule, c))
                .collect::<Result<_, _>>()?,
        ),
        Condition::Any { of } => Compiled::Any(
            of.iter()
                .map(|c| compile(rule, c))
                .collect::<Result<_, _>>()?,
        ),
        Condition::Not { cond } => Compiled::Not(Box::new(compile(rule, cond)?)),
        Condition::Matches { side, pattern } => {
            Compiled::Matches(*side, compile_regex(rule, pattern)?)
        }
        Condition::Equals { side, value } => Compiled::Equals(*side, value.clone()),
        Condition::IsType { side, json_type } => Compiled::IsType(*side, *json_type),
        Condition::EqualAfterReplace {
            side,
            pattern,
            replacement,
        } => Compiled::EqualAfterReplace(*side, compile_regex(rule, pattern)?, replacement.clone()),
    })
}

#[derive(Debug)]
struct CompiledRule {
    rule: AllowRule,
    location: Option<Regex>,
    type_name: Option<Regex>,
    when: Option<Compiled>,
}

impl CompiledRule {
    fn new(rule: AllowRule) -> Result<Self, DiffError> {
        let location = rule
            .location
            .as_deref()
            .map(|p| compile_regex(&rule.id, p))
            .transpose()?;
        let type_name = rule
            .type_name
            .as_deref()
            .map(|p| compile_regex(&rule.id, p))
            .transpose()?;
        let when = rule.when.as_ref().map(|c| compile(&rule.id, c)).transpose()?;
        Ok(Self {
            rule,
            location,
            type_name,
            when,
        })
    }

    fn applies(&self, type_name: &TypeName, change: &FieldChange) -> bool {
        if !self.rule.kinds.is_empty() && !self.rule.kinds.contains(&change.kind) {
            return false;
        }
        if let Some(re) = &self.location {
            if !re.is_match(&change.location) {
                return false;
            }
        }
        if let Some(re) = &self.type_name {
            if !re.is_match(type_name.as_str()) {
                return false;
            }
        }
        self.when.as_ref().map_or(true, |c| c.eval(change))
    }
}

/// Compiled set of rules
#[derive(Debug, Default)]
pub struct AllowList {
    rules: Vec<CompiledRule>,
}

impl AllowList {
    /// Allow-list with no rules; every change needs review
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Allow-list with the shipped rules
    pub fn builtin() -> Result<Self, DiffError> {
        Self::from_rules([AllowRule::enum_variant_qualified()])
    }

    pub fn from_rules(rules: impl IntoIterator<Item = AllowRule>) -> Result<Self, DiffError> {
        let mut list = Self::empty();
        list.extend(rules)?;
        Ok(list)
    }

    /// Parse `[[rules]]` tables
    pub fn from_toml_str(input: &str) -> Result<Self, DiffError> {
        let file: RuleFile = toml::from_str(input)?;
        Self::from_rules(file.rules)
    }

    /// Parse `{"rules": [...]}`
    pub fn from_json_str(input: &str) -> Result<Self, DiffError> {
        let file: RuleFile = serde_json::from_str(input).map_err(|source| DiffError::Parse {
            what: "allow-list",
            source,
        })?;
        Self::from_rules(file.rules)
    }

    /// Add rules; ids must stay unique
    pub fn extend(&mut self, rules: impl IntoIterator<Item = AllowRule>) -> Result<(), DiffError> {
        let mut seen: HashSet<String> = self.rules.iter().map(|r| r.rule.id.clone()).collect();
        for rule in rules {
            if !seen.insert(rule.id.clone()) {
                return Err(DiffError::DuplicateRule(rule.id));
            }
            self.rules.push(CompiledRule::new(rule)?);
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &AllowRule> {
        self.rules.iter().map(|r| &r.rule)
    }

    /// Id of the first rule that anticipates `change`
    #[must_use]
    pub fn expected_by(&self, type_name: &TypeName, change: &FieldChange) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.applies(type_name, change))
            .map(|r| r.rule.id.as_str())
    }
}
