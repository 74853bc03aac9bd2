//! Command parsing: first token is the opcode, the rest positional fields.

use crate::error::ProtocolError;
use crate::task::spec::TaskSpec;

pub const TAG_EXECUTE_TASK: &str = "EXECUTE_TASK";
pub const TAG_PING: &str = "PING";
pub const TAG_PONG: &str = "PONG";
pub const TAG_QUIT: &str = "QUIT";
pub const TAG_REMOVE: &str = "REMOVE";
pub const TAG_ACK: &str = "ACK";
pub const TAG_ERROR: &str = "ERROR";

/// One parsed command. Created on read, consumed by dispatch, not retained.
#[derive(Debug)]
pub enum Command {
    ExecuteTask(Box<TaskSpec>),
    Ping,
    Quit,
    Remove { identifier: String },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some((&opcode, rest)) = fields.split_first() else {
            return Err(ProtocolError::malformed("empty command line"));
        };

        match opcode {
            TAG_EXECUTE_TASK => Ok(Self::ExecuteTask(Box::new(TaskSpec::from_fields(rest)?))),
            TAG_PING => {
                expect_no_fields(TAG_PING, rest)?;
                Ok(Self::Ping)
            }
            TAG_QUIT => {
                expect_no_fields(TAG_QUIT, rest)?;
                Ok(Self::Quit)
            }
            TAG_REMOVE => match rest {
                [id] => Ok(Self::Remove {
                    identifier: (*id).to_string(),
                }),
                [] => Err(ProtocolError::MissingField {
                    opcode: "REMOVE",
                    field: "identifier",
                }),
                _ => Err(ProtocolError::malformed("REMOVE takes one identifier")),
            },
            other => Err(ProtocolError::UnknownOpcode(other.to_string())),
        }
    }
}

fn expect_no_fields(opcode: &str, rest: &[&str]) -> Result<(), ProtocolError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::malformed(format!(
            "{opcode} takes no fields"
        )))
    }
}

/// Single-token error response line: spaces become underscores so the peer
/// can tokenize by whitespace.
pub fn error_response(message: &str) -> String {
    let flat: String = message
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    format!("{TAG_ERROR} {flat}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_quit_parse() {
        assert!(matches!(Command::parse("PING").unwrap(), Command::Ping));
        assert!(matches!(Command::parse("QUIT").unwrap(), Command::Quit));
        assert!(Command::parse("PING extra").is_err());
    }

    #[test]
    fn remove_parses_identifier() {
        match Command::parse("REMOVE d3v2").unwrap() {
            Command::Remove { identifier } => assert_eq!(identifier, "d3v2"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(Command::parse("REMOVE").is_err());
        assert!(Command::parse("REMOVE a b").is_err());
    }

    #[test]
    fn execute_task_parses() {
        let cmd = Command::parse("EXECUTE_TASK demo.add 1 OBJECT r x @d1v1 1").unwrap();
        match cmd {
            Command::ExecuteTask(spec) => {
                assert_eq!(spec.qualified_name, "demo.add");
                assert_eq!(spec.parameters.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_is_not_recognized() {
        match Command::parse("FROBNICATE x y") {
            Err(ProtocolError::UnknownOpcode(op)) => assert_eq!(op, "FROBNICATE"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_line_is_malformed() {
        assert!(matches!(
            Command::parse("   "),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn error_response_is_tokenizable() {
        let line = error_response("opcode not recognized: FROBNICATE");
        assert_eq!(line, "ERROR opcode_not_recognized:_FROBNICATE");
        assert_eq!(line.split_whitespace().count(), 2);
    }
}
