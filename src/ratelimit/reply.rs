//! Defensive parsing of procedure replies.
//!
//! Anything other than the documented shape is a protocol error: it means
//! the store runs a different script than this crate expects, which retrying
//! will not fix.

use std::time::Duration;

use redis::Value;
use tracing::warn;

use crate::error::{RatekeeperError, Result};

/// A procedure reply in structured form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcedureReply {
    /// Server time at which the procedure ran
    pub observed_at: Duration,
    pub allowed: bool,
    pub retry_after: Duration,
    /// Inserted members; empty for procedures that insert none
    pub members: Vec<String>,
}

/// Parse `[now_us, allowed, retry_after_us]`, followed by a member list when
/// `with_members` is set.
pub(crate) fn parse_reply(procedure: &'static str, value: Value, with_members: bool) -> Result<ProcedureReply> {
    let expected = if with_members { 4 } else { 3 };
    let items = match value {
        Value::Array(items) if items.len() == expected => items,
        other => {
            return Err(violation(
                procedure,
                format!("expected an array of {} elements, got {:?}", expected, other),
            ))
        }
    };

    let mut items = items.into_iter();
    let observed_at = micros(procedure, "now", items.next())?;
    let allowed = match items.next() {
        Some(Value::Int(0)) => false,
        Some(Value::Int(1)) => true,
        other => {
            return Err(violation(
                procedure,
                format!("expected allowed flag 0 or 1, got {:?}", other),
            ))
        }
    };
    let retry_after = micros(procedure, "retry_after", items.next())?;

    let members = if with_members {
        match items.next() {
            Some(Value::Array(members)) => members
                .into_iter()
                .map(|m| member(procedure, m))
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(violation(
                    procedure,
                    format!("expected a member array, got {:?}", other),
                ))
            }
        }
    } else {
        Vec::new()
    };

    Ok(ProcedureReply {
        observed_at,
        allowed,
        retry_after,
        members,
    })
}

fn micros(procedure: &'static str, field: &str, value: Option<Value>) -> Result<Duration> {
    match value {
        Some(Value::Int(n)) if n >= 0 => Ok(Duration::from_micros(n as u64)),
        other => Err(violation(
            procedure,
            format!("expected non-negative integer {}, got {:?}", field, other),
        )),
    }
}

fn member(procedure: &'static str, value: Value) -> Result<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes)
            .map_err(|e| violation(procedure, format!("member is not UTF-8: {}", e))),
        Value::SimpleString(s) => Ok(s),
        other => Err(violation(procedure, format!("expected member string, got {:?}", other))),
    }
}

pub(crate) fn violation(procedure: &'static str, detail: String) -> RatekeeperError {
    warn!(procedure, detail = %detail, "Procedure reply violates contract");
    RatekeeperError::protocol(procedure, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcra_reply(allowed: i64, retry: i64) -> Value {
        Value::Array(vec![Value::Int(1_700_000_000_000_000), Value::Int(allowed), Value::Int(retry)])
    }

    #[test]
    fn test_parse_gcra_reply() {
        let reply = parse_reply("gcra", gcra_reply(0, 250_000), false).unwrap();
        assert!(!reply.allowed);
        assert_eq!(reply.retry_after, Duration::from_millis(250));
        assert_eq!(reply.observed_at, Duration::from_secs(1_700_000_000));
        assert!(reply.members.is_empty());
    }

    #[test]
    fn test_parse_member_reply() {
        let value = Value::Array(vec![
            Value::Int(5),
            Value::Int(1),
            Value::Int(0),
            Value::Array(vec![
                Value::BulkString(b"p:1".to_vec()),
                Value::SimpleString("p:2".to_string()),
            ]),
        ]);
        let reply = parse_reply("sliding_window", value, true).unwrap();
        assert!(reply.allowed);
        assert_eq!(reply.members, vec!["p:1", "p:2"]);
    }

    #[test]
    fn test_wrong_arity_is_protocol_error() {
        let err = parse_reply("gcra", Value::Array(vec![Value::Int(1)]), false).unwrap_err();
        assert!(matches!(err, RatekeeperError::Protocol { procedure: "gcra", .. }));
        assert!(!err.is_retryable());

        let err = parse_reply("sliding_window", gcra_reply(1, 0), true).unwrap_err();
        assert!(matches!(err, RatekeeperError::Protocol { .. }));
    }

    #[test]
    fn test_wrong_types_are_protocol_errors() {
        let err = parse_reply("gcra", Value::Nil, false).unwrap_err();
        assert!(err.to_string().contains("Nil"));

        let err = parse_reply("gcra", gcra_reply(2, 0), false).unwrap_err();
        assert!(err.to_string().contains("allowed flag"));

        let err = parse_reply("gcra", gcra_reply(0, -1), false).unwrap_err();
        assert!(err.to_string().contains("retry_after"));

        let value = Value::Array(vec![
            Value::Int(5),
            Value::Int(1),
            Value::Int(0),
            Value::Array(vec![Value::Int(3)]),
        ]);
        let err = parse_reply("sliding_window", value, true).unwrap_err();
        assert!(err.to_string().contains("member"));
    }
}
