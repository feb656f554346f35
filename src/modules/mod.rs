//! Backend module handlers addressed by the dispatcher's routing table.
//!
//! Every handler exposes the same narrow contract
//! (`handle(method, args) -> Result<Value, String>`) and reports invalid
//! methods or arguments as module-specific error strings.

pub mod filesystem;
pub mod kubectl;
pub mod shell;
pub mod terminal;

use serde_json::Value;

/// Positional string argument, required.
pub(crate) fn required_str<'a>(
    args: &'a [Value],
    index: usize,
    name: &str,
) -> Result<&'a str, String> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("argument {index} ({name}) must be a string"))
}

/// Positional unsigned integer argument, required.
pub(crate) fn required_u64(args: &[Value], index: usize, name: &str) -> Result<u64, String> {
    args.get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("argument {index} ({name}) must be a non-negative integer"))
}

/// Positional unsigned integer argument, optional.
pub(crate) fn optional_u64(args: &[Value], index: usize) -> Option<u64> {
    args.get(index).and_then(Value::as_u64)
}

/// String field of an optional positional options object.
pub(crate) fn object_str<'a>(args: &'a [Value], index: usize, key: &str) -> Option<&'a str> {
    args.get(index)
        .and_then(Value::as_object)
        .and_then(|o| o.get(key))
        .and_then(Value::as_str)
}

/// Unsigned integer field of an optional positional options object.
pub(crate) fn object_u64(args: &[Value], index: usize, key: &str) -> Option<u64> {
    args.get(index)
        .and_then(Value::as_object)
        .and_then(|o| o.get(key))
        .and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_str_rejects_wrong_type_and_missing() {
        let args = vec![json!(42)];
        assert!(required_str(&args, 0, "id").is_err());
        assert!(required_str(&args, 1, "id").is_err());
        assert_eq!(required_str(&[json!("x")], 0, "id").unwrap(), "x");
    }

    #[test]
    fn object_fields_tolerate_absent_options() {
        let args = vec![json!("positional")];
        assert!(object_str(&args, 1, "cwd").is_none());
        assert!(object_u64(&args, 1, "timeoutMs").is_none());

        let args = vec![json!("positional"), json!({"cwd": "/tmp", "timeoutMs": 5})];
        assert_eq!(object_str(&args, 1, "cwd").unwrap(), "/tmp");
        assert_eq!(object_u64(&args, 1, "timeoutMs").unwrap(), 5);
    }
}
