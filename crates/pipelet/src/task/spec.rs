//! Task and parameter data model, parsed from EXECUTE_TASK fields.

use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::ProtocolError;
use crate::task::direction::{self, Direction};

/// Closed set of parameter type tags.
///
/// Each variant carries its own capability set: cacheable variants go
/// through the object cache, reference-only variants (files, streams) hand
/// their identifier to the task untouched, persistent objects report their
/// identifier back in the return message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ParamType {
    File,
    Object,
    Collection,
    /// Reference to an externally managed stream endpoint. The identifier is
    /// handed through like a file path; open/poll/close belong to the
    /// streaming layer the task talks to, not to this worker.
    Stream,
    PersistentObject,
}

impl ParamType {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "FILE" => Some(Self::File),
            "OBJECT" => Some(Self::Object),
            "COLLECTION" => Some(Self::Collection),
            "STREAM" => Some(Self::Stream),
            "PSCO" => Some(Self::PersistentObject),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::File => "FILE",
            Self::Object => "OBJECT",
            Self::Collection => "COLLECTION",
            Self::Stream => "STREAM",
            Self::PersistentObject => "PSCO",
        }
    }

    /// Whether deserialized values of this type live in the object cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Object | Self::Collection | Self::PersistentObject)
    }

    /// Whether the identifier itself (not the loaded value) is the argument.
    pub fn is_reference_only(&self) -> bool {
        matches!(self, Self::File | Self::Stream)
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::PersistentObject)
    }
}

/// Either an inline literal or a backing-store reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Stable backing-store identifier.
    Reference(String),
    /// Inline literal carried on the command line.
    Literal(serde_json::Value),
}

impl ParamValue {
    /// `@id` = reference, `#b64` = string literal, anything else = JSON scalar.
    fn parse(token: &str) -> Result<Self, ProtocolError> {
        if let Some(id) = token.strip_prefix('@') {
            if id.is_empty() {
                return Err(ProtocolError::invalid_field("value", "empty identifier"));
            }
            return Ok(Self::Reference(id.to_string()));
        }
        if let Some(encoded) = token.strip_prefix('#') {
            let bytes = BASE64
                .decode(encoded)
                .map_err(|e| ProtocolError::invalid_field("value", e.to_string()))?;
            let s = String::from_utf8(bytes)
                .map_err(|e| ProtocolError::invalid_field("value", e.to_string()))?;
            return Ok(Self::Literal(serde_json::Value::String(s)));
        }
        let value: serde_json::Value = serde_json::from_str(token)
            .map_err(|e| ProtocolError::invalid_field("value", e.to_string()))?;
        Ok(Self::Literal(value))
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::Reference(id) => Some(id),
            Self::Literal(_) => None,
        }
    }
}

/// One declared task parameter with its resolved direction.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub ptype: ParamType,
    pub direction: Direction,
    pub value: ParamValue,
}

impl Parameter {
    pub fn is_receiver(&self) -> bool {
        self.name == "self" || self.name == "cls"
    }
}

/// What to do when the task body fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    Fail,
    Ignore,
    Retry,
}

impl FailurePolicy {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "FAIL" => Some(Self::Fail),
            "IGNORE" => Some(Self::Ignore),
            "RETRY" => Some(Self::Retry),
            _ => None,
        }
    }
}

/// One EXECUTE_TASK command, fully validated.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub qualified_name: String,
    pub parameters: Vec<Parameter>,
    pub return_count: usize,
    pub working_dir: Option<PathBuf>,
    pub tracing: bool,
    pub retries: u32,
    pub on_failure: FailurePolicy,
    pub target_direction: Option<Direction>,
}

const OPCODE: &str = "EXECUTE_TASK";
const FIELDS_PER_PARAM: usize = 4;

impl TaskSpec {
    /// Parse the positional fields following the EXECUTE_TASK opcode.
    ///
    /// Grammar (trailing fields optional, `-` = absent):
    /// `name nparams {ptype mode pname value}* nreturns [workdir] [tracing] [retries] [on_failure] [target_dir]`
    pub fn from_fields(fields: &[&str]) -> Result<Self, ProtocolError> {
        let mut it = fields.iter();
        let qualified_name = next_field(&mut it, "qualified_name")?.to_string();
        if qualified_name.is_empty() {
            return Err(ProtocolError::invalid_field("qualified_name", "empty"));
        }

        let param_count: usize = parse_number(next_field(&mut it, "param_count")?, "param_count")?;

        // Raw parameter fields first; directions resolve once the trailing
        // target_dir is known.
        let mut raw: Vec<(ParamType, String, String, ParamValue)> =
            Vec::with_capacity(param_count);
        for _ in 0..param_count {
            let ptype_tok = next_field(&mut it, "param_type")?;
            let ptype = ParamType::parse(ptype_tok).ok_or_else(|| {
                ProtocolError::invalid_field("param_type", format!("`{ptype_tok}`"))
            })?;
            let mode = next_field(&mut it, "param_mode")?.to_string();
            let name = next_field(&mut it, "param_name")?.to_string();
            let value = ParamValue::parse(next_field(&mut it, "param_value")?)?;
            raw.push((ptype, mode, name, value));
        }

        let return_count: usize = parse_number(next_field(&mut it, "return_count")?, "return_count")?;

        let working_dir = match it.next() {
            None | Some(&"-") => None,
            Some(tok) => Some(PathBuf::from(tok)),
        };
        let tracing = match it.next() {
            None => false,
            Some(&"0") => false,
            Some(&"1") => true,
            Some(tok) => {
                return Err(ProtocolError::invalid_field("tracing", format!("`{tok}`")));
            }
        };
        let retries = match it.next() {
            None => 0,
            Some(tok) => parse_number(tok, "retries")?,
        };
        let on_failure = match it.next() {
            None => FailurePolicy::Fail,
            Some(tok) => FailurePolicy::parse(tok)
                .ok_or_else(|| ProtocolError::invalid_field("on_failure", format!("`{tok}`")))?,
        };
        let target_direction = match it.next() {
            None | Some(&"-") => None,
            Some(tok) => Some(Direction::parse_tag(tok).ok_or_else(|| {
                ProtocolError::invalid_field("target_dir", format!("`{tok}`"))
            })?),
        };

        if let Some(extra) = it.next() {
            return Err(ProtocolError::malformed(format!(
                "trailing field `{extra}` after {OPCODE}"
            )));
        }

        let parameters = raw
            .into_iter()
            .enumerate()
            .map(|(i, (ptype, mode, name, value))| {
                let is_receiver = i == 0 && (name == "self" || name == "cls");
                let dir = direction::resolve(&mode, is_receiver, target_direction);
                Parameter {
                    name,
                    ptype,
                    direction: dir,
                    value,
                }
            })
            .collect();

        Ok(Self {
            qualified_name,
            parameters,
            return_count,
            working_dir,
            tracing,
            retries,
            on_failure,
            target_direction,
        })
    }

    /// Backing-store identifiers of COMMUTATIVE parameters.
    pub fn commutative_identifiers(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter(|p| p.direction == Direction::Commutative)
            .filter_map(|p| p.value.reference().map(str::to_string))
            .collect()
    }
}

fn next_field<'a>(
    it: &mut std::slice::Iter<'a, &'a str>,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    it.next()
        .copied()
        .ok_or(ProtocolError::MissingField { opcode: OPCODE, field })
}

fn parse_number<T: std::str::FromStr>(tok: &str, field: &'static str) -> Result<T, ProtocolError> {
    tok.parse()
        .map_err(|_| ProtocolError::invalid_field(field, format!("`{tok}` is not a number")))
}

/// Encode an inline string literal as a wire token.
pub fn encode_string_literal(s: &str) -> String {
    format!("#{}", BASE64.encode(s.as_bytes()))
}
