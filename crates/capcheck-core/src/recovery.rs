//! Error recovery engine
//!
//! A closed table of self-inflicted error signatures, each paired with the
//! repair that re-issues the call correctly. Anything not in the table is a
//! genuine failure. Each signature repairs a given call at most once.
//!
//! | signature | detected by | repair |
//! |---|---|---|
//! | primitive as string | `invalid type: string "x"` where `x` is a quoted primitive in the value | send `x` as native JSON |
//! | identifier double-quoted | a string value wrapped in an extra layer of quotes | strip the quotes |
//! | parameter order | invalid-params rejection naming a missing `path` or `value` | swap `path`/`value` order |

use crate::client::ArgumentOrder;
use crate::error::ClientError;
use capcheck_model::RetrySignature;
use serde_json::Value;

/// JSON-RPC "invalid params" code
pub const INVALID_PARAMS: i64 = -32602;

const INVALID_STRING: &str = "invalid type: string \"";

/// Rejections caused by argument order rather than content
const ORDER_MESSAGES: [&str; 3] = [
    "missing field `path`",
    "missing field `value`",
    "parameter order",
];

/// The failed call as the engine sees it
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    pub error: &'a ClientError,
    /// Value the call sent
    pub value: &'a Value,
    /// Argument order, for calls that take a path and a value
    pub order: Option<ArgumentOrder>,
}

/// Change to apply before re-issuing
#[derive(Debug, Clone, PartialEq)]
pub enum Fix {
    Value(Value),
    Order(ArgumentOrder),
}

/// Matched signature and its repair
#[derive(Debug, Clone, PartialEq)]
pub struct Repair {
    pub signature: RetrySignature,
    pub fix: Fix,
}

type Rule = fn(&Attempt<'_>) -> Option<Fix>;

const TABLE: [(RetrySignature, Rule); 3] = [
    (RetrySignature::PrimitiveAsString, primitive_as_string),
    (RetrySignature::IdentifierDoubleQuoted, identifier_double_quoted),
    (RetrySignature::ParameterOrder, parameter_order),
];

/// Classify a failure against the signature table
///
/// Returns `None` for genuine failures: transport and protocol errors,
/// unmatched RPC errors, and signatures already used on this call.
#[must_use]
pub fn diagnose(attempt: &Attempt<'_>, used: &[RetrySignature]) -> Option<Repair> {
    if !attempt.error.is_retryable() {
        return None;
    }
    TABLE
        .iter()
        .filter(|(signature, _)| !used.contains(signature))
        .find_map(|(signature, rule)| {
            rule(attempt).map(|fix| Repair {
                signature: *signature,
                fix,
            })
        })
}

fn primitive_as_string(attempt: &Attempt<'_>) -> Option<Fix> {
    let quoted = quoted_string(attempt.error.message())?;
    map_strings(attempt.value, &|s| {
        if s != quoted {
            return None;
        }
        match serde_json::from_str::<Value>(s.trim()) {
            Ok(Value::String(_)) | Err(_) => None,
            Ok(native) => Some(native),
        }
    })
    .map(Fix::Value)
}

/// The string a deserializer rejected: `invalid type: string "5", ...`
fn quoted_string(message: &str) -> Option<&str> {
    let start = message.find(INVALID_STRING)? + INVALID_STRING.len();
    let rest = &message[start..];
    rest.find('"').map(|end| &rest[..end])
}

fn identifier_double_quoted(attempt: &Attempt<'_>) -> Option<Fix> {
    map_strings(attempt.value, &|s| {
        if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
            match serde_json::from_str::<Value>(s) {
                Ok(inner @ Value::String(_)) => Some(inner),
                _ => None,
            }
        } else {
            None
        }
    })
    .map(Fix::Value)
}

fn parameter_order(attempt: &Attempt<'_>) -> Option<Fix> {
    let order = attempt.order?;
    let ClientError::Rpc { code, message, .. } = attempt.error else {
        return None;
    };
    let rejected = *code == INVALID_PARAMS && ORDER_MESSAGES.iter().any(|m| message.contains(m));
    rejected.then(|| Fix::Order(order.swapped()))
}

/// Rewrite every string leaf `f` maps; `None` if nothing changed
fn map_strings(value: &Value, f: &dyn Fn(&str) -> Option<Value>) -> Option<Value> {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => {
            let mut changed = false;
            let items = items
                .iter()
                .map(|item| match map_strings(item, f) {
                    Some(fixed) => {
                        changed = true;
                        fixed
                    }
                    None => item.clone(),
                })
                .collect();
            changed.then_some(Value::Array(items))
        }
        Value::Object(fields) => {
            let mut changed = false;
            let fields = fields
                .iter()
                .map(|(k, v)| match map_strings(v, f) {
                    Some(fixed) => {
                        changed = true;
                        (k.clone(), fixed)
                    }
                    None => (k.clone(), v.clone()),
                })
                .collect();
            changed.then_some(Value::Object(fields))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rpc(code: i64, message: &str) -> ClientError {
        ClientError::Rpc {
            code,
            message: message.to_string(),
            request: Value::Null,
            response: Value::Null,
        }
    }

    #[test]
    fn quoted_number_becomes_native() {
        let error = rpc(-23402, "invalid type: string \"5\", expected u32");
        let value = json!("5");
        let repair = diagnose(
            &Attempt {
                error: &error,
                value: &value,
                order: Some(ArgumentOrder::PathThenValue),
            },
            &[],
        )
        .unwrap();
        assert_eq!(repair.signature, RetrySignature::PrimitiveAsString);
        assert_eq!(repair.fix, Fix::Value(json!(5)));
    }

    #[test]
    fn only_the_rejected_string_is_rewritten() {
        let error = rpc(-23402, "invalid type: string \"true\", expected a boolean");
        let value = json!({"enabled": "true", "name": "42", "scale": ["1.0", 2.0]});
        let repair = diagnose(
            &Attempt {
                error: &error,
                value: &value,
                order: None,
            },
            &[],
        )
        .unwrap();
        assert_eq!(
            repair.fix,
            Fix::Value(json!({"enabled": true, "name": "42", "scale": ["1.0", 2.0]}))
        );
    }

    #[test]
    fn quoted_string_is_read_from_message() {
        assert_eq!(
            quoted_string("invalid type: string \"1.5\", expected f32"),
            Some("1.5")
        );
        assert_eq!(quoted_string("invalid type: map, expected f32"), None);
    }

    #[test]
    fn double_quoted_identifier_is_stripped() {
        let error = rpc(-23402, "unknown variant `\"Visible\"`");
        let value = json!("\"Visible\"");
        let repair = diagnose(
            &Attempt {
                error: &error,
                value: &value,
                order: None,
            },
            &[],
        )
        .unwrap();
        assert_eq!(repair.signature, RetrySignature::IdentifierDoubleQuoted);
        assert_eq!(repair.fix, Fix::Value(json!("Visible")));
    }

    #[test]
    fn parameter_order_swaps_once() {
        let error = rpc(INVALID_PARAMS, "Invalid params: missing field `path`");
        let value = json!(1);
        let attempt = Attempt {
            error: &error,
            value: &value,
            order: Some(ArgumentOrder::PathThenValue),
        };
        let repair = diagnose(&attempt, &[]).unwrap();
        assert_eq!(repair.fix, Fix::Order(ArgumentOrder::ValueThenPath));
        assert_eq!(diagnose(&attempt, &[RetrySignature::ParameterOrder]), None);

        // Spawn calls carry no order and cannot be reordered.
        let spawn = Attempt { order: None, ..attempt };
        assert_eq!(diagnose(&spawn, &[]), None);
    }

    #[test]
    fn content_rejection_with_invalid_params_is_not_reordered() {
        let value = json!(1);
        for message in [
            "Unknown component type: `game::Foo`",
            "Invalid params: expected a number at `.count`",
        ] {
            let error = rpc(INVALID_PARAMS, message);
            let attempt = Attempt {
                error: &error,
                value: &value,
                order: Some(ArgumentOrder::PathThenValue),
            };
            assert_eq!(diagnose(&attempt, &[]), None, "{message}");
        }

        // Order messages only count as an invalid-params rejection.
        let error = rpc(-23402, "missing field `path`");
        let attempt = Attempt {
            error: &error,
            value: &value,
            order: Some(ArgumentOrder::PathThenValue),
        };
        assert_eq!(diagnose(&attempt, &[]), None);
    }

    #[test]
    fn genuine_failures_are_not_retried() {
        let value = json!("5");
        let transport = ClientError::Transport {
            endpoint: "http://localhost:15702".into(),
            message: "invalid type: string".into(),
        };
        let attempts = [
            transport,
            rpc(-23402, "Component not present on entity"),
            ClientError::Protocol("invalid type: string".into()),
        ];
        for error in &attempts {
            let attempt = Attempt {
                error,
                value: &value,
                order: Some(ArgumentOrder::PathThenValue),
            };
            assert_eq!(diagnose(&attempt, &[]), None, "{error}");
        }

        // A plain string is not a quoted primitive.
        let error = rpc(-23402, "invalid type: string \"abc\", expected u32");
        let text = json!("abc");
        let attempt = Attempt {
            error: &error,
            value: &text,
            order: None,
        };
        assert_eq!(diagnose(&attempt, &[]), None);
    }
}
