//! Return-message wire encoding.
//!
//! `"<n> <type_0> <value_0> <type_1> <value_1> ..."`, space-delimited.
//! COLLECTION values are base64-coded so embedded whitespace and quotes can
//! never break tokenization; decoding reproduces the original value.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{FatalError, ProtocolError, SerializationError};
use crate::task::spec::ParamType;

/// Wire token for a parameter with no new value to report.
pub const NULL_VALUE: &str = "null";

/// Encode (type, value) pairs into one response line.
///
/// A length mismatch is an internal invariant violation, never a user-facing
/// failure: the caller built both lists from the same task.
pub fn build_return_message(types: &[ParamType], values: &[String]) -> Result<String, FatalError> {
    if types.len() != values.len() {
        return Err(FatalError::ReturnArityMismatch {
            types: types.len(),
            values: values.len(),
        });
    }

    let mut message = types.len().to_string();
    for (ptype, value) in types.iter().zip(values) {
        message.push(' ');
        message.push_str(ptype.tag());
        message.push(' ');
        match ptype {
            ParamType::Collection => message.push_str(&BASE64.encode(value.as_bytes())),
            _ => message.push_str(value),
        }
    }
    Ok(message)
}

/// Parse a response line back into (type, value) pairs.
pub fn parse_return_message(line: &str) -> Result<Vec<(ParamType, String)>, ProtocolError> {
    let mut tokens = line.split_whitespace();
    let count: usize = tokens
        .next()
        .ok_or_else(|| ProtocolError::malformed("empty return message"))?
        .parse()
        .map_err(|_| ProtocolError::invalid_field("count", "not a number"))?;

    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = tokens
            .next()
            .ok_or_else(|| ProtocolError::malformed("truncated return message"))?;
        let ptype = ParamType::parse(tag)
            .ok_or_else(|| ProtocolError::invalid_field("type", format!("`{tag}`")))?;
        let raw = tokens
            .next()
            .ok_or_else(|| ProtocolError::malformed("truncated return message"))?;
        let value = match ptype {
            ParamType::Collection => {
                let bytes = BASE64
                    .decode(raw)
                    .map_err(|e| ProtocolError::invalid_field("value", e.to_string()))?;
                String::from_utf8(bytes)
                    .map_err(|e| ProtocolError::invalid_field("value", e.to_string()))?
            }
            _ => raw.to_string(),
        };
        pairs.push((ptype, value));
    }

    if tokens.next().is_some() {
        return Err(ProtocolError::malformed("trailing tokens in return message"));
    }
    Ok(pairs)
}

/// Encode a returned value as a single wire token (base64 of compact JSON).
pub fn encode_return_value(value: &serde_json::Value) -> Result<String, SerializationError> {
    let bytes = serde_json::to_vec(value).map_err(|e| SerializationError::Encode {
        reason: e.to_string(),
    })?;
    Ok(BASE64.encode(bytes))
}

/// Encode a failure message as a returned-value token. Infallible: a JSON
/// string always serializes.
pub fn encode_error_value(message: &str) -> String {
    let json = serde_json::Value::String(message.to_string()).to_string();
    BASE64.encode(json.as_bytes())
}

/// Decode a returned-value token produced by [`encode_return_value`].
pub fn decode_return_value(token: &str) -> Result<serde_json::Value, ProtocolError> {
    let bytes = BASE64
        .decode(token)
        .map_err(|e| ProtocolError::invalid_field("value", e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ProtocolError::invalid_field("value", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_collection_containing_spaces_and_quotes() {
        let types = vec![
            ParamType::Object,
            ParamType::Collection,
            ParamType::PersistentObject,
        ];
        let values = vec![
            NULL_VALUE.to_string(),
            r#"["a b", "c\"d", 3]"#.to_string(),
            "psco-0042".to_string(),
        ];

        let line = build_return_message(&types, &values).unwrap();
        // Tokenizable by whitespace: 1 count token + 2 per pair.
        assert_eq!(line.split_whitespace().count(), 1 + 2 * types.len());

        let pairs = parse_return_message(&line).unwrap();
        assert_eq!(pairs.len(), 3);
        for (i, (ptype, value)) in pairs.iter().enumerate() {
            assert_eq!(*ptype, types[i]);
            assert_eq!(*value, values[i]);
        }
    }

    #[test]
    fn empty_message_roundtrips() {
        let line = build_return_message(&[], &[]).unwrap();
        assert_eq!(line, "0");
        assert!(parse_return_message(&line).unwrap().is_empty());
    }

    #[test]
    fn arity_mismatch_is_fatal_not_truncated() {
        let err = build_return_message(&[ParamType::Object], &[]).unwrap_err();
        assert!(matches!(
            err,
            FatalError::ReturnArityMismatch { types: 1, values: 0 }
        ));
    }

    #[test]
    fn truncated_message_is_rejected() {
        assert!(parse_return_message("2 OBJECT null").is_err());
        assert!(parse_return_message("1 OBJECT null extra").is_err());
        assert!(parse_return_message("").is_err());
    }

    #[test]
    fn error_value_decodes_to_its_message() {
        let token = encode_error_value("user code error: boom");
        assert_eq!(
            decode_return_value(&token).unwrap(),
            serde_json::json!("user code error: boom")
        );
    }

    #[test]
    fn return_value_token_roundtrips() {
        let value = serde_json::json!({"msg": "two words", "n": 7});
        let token = encode_return_value(&value).unwrap();
        assert!(!token.contains(' '));
        assert_eq!(decode_return_value(&token).unwrap(), value);
    }
}
