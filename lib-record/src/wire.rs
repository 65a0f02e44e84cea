use {
    crate::{
        error::{Error, Result},
        literal,
    },
    std::collections::HashMap,
};

/// Joins the fields of a multi-field request payload
pub const FIELD_SEP: &str = ":SUT_SEP:";
/// Suffixes each stdout/stderr chunk returned to the command-line interceptor
pub const STREAM_SEP: &str = "|TT_CMD_SEP|";
/// A request whose raw bytes begin with this sentinel shuts the server down
pub const TERMINATE: &str = "TERMINATE_SERVER";

/// One inbound request, as decoded from the first line's literal prefix.
/// Payload text is preserved as sent; only numeric fields are trimmed
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ServerState {
        text: String,
    },
    CommandLine {
        argv: Vec<String>,
        env: HashMap<String, String>,
        cwd: String,
        proxy_pid: String,
    },
    CommandKill {
        signal: i32,
        proxy_pid: String,
    },
    InProcImport {
        module: String,
    },
    InProcAttribute {
        target: String,
        attr: String,
    },
    InProcSetAttribute {
        target: String,
        attr: String,
        value: String,
    },
    InProcCall {
        target: String,
        attr: String,
        args: String,
        kwargs: String,
    },
    ClientSocket {
        text: String,
    },
}

impl Request {
    /// Decodes a request payload. Unknown prefixes are raw client socket
    /// traffic; a recognised prefix with a malformed payload is an error the
    /// caller may downgrade however it sees fit
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(rest) = strip("SUT_SERVER:", text) {
            return Ok(Self::ServerState { text: rest.into() });
        }
        if let Some(rest) = strip("SUT_COMMAND_LINE:", text) {
            match fields(rest, "SUT_COMMAND_LINE", 4)?.as_slice() {
                [cmd, env, cwd, pid] => {
                    return Ok(Self::CommandLine {
                        argv: literal::parse_str_list(cmd)?,
                        env: literal::parse_str_map(env)?,
                        cwd: (*cwd).into(),
                        proxy_pid: pid.trim().into(),
                    })
                }
                _ => unreachable!(),
            }
        }
        if let Some(rest) = strip("SUT_COMMAND_KILL:", text) {
            match fields(rest, "SUT_COMMAND_KILL", 2)?.as_slice() {
                [signal, pid] => {
                    return Ok(Self::CommandKill {
                        signal: parse_num(signal)?,
                        proxy_pid: pid.trim().into(),
                    })
                }
                _ => unreachable!(),
            }
        }
        if let Some(rest) = strip("SUT_PYTHON_IMPORT:", text) {
            return Ok(Self::InProcImport {
                module: rest.trim_end().into(),
            });
        }
        if let Some(rest) = strip("SUT_PYTHON_ATTR:", text) {
            match fields(rest, "SUT_PYTHON_ATTR", 2)?.as_slice() {
                [target, attr] => {
                    return Ok(Self::InProcAttribute {
                        target: (*target).into(),
                        attr: attr.trim_end().into(),
                    })
                }
                _ => unreachable!(),
            }
        }
        if let Some(rest) = strip("SUT_PYTHON_SETATTR:", text) {
            match fields(rest, "SUT_PYTHON_SETATTR", 3)?.as_slice() {
                [target, attr, value] => {
                    return Ok(Self::InProcSetAttribute {
                        target: (*target).into(),
                        attr: (*attr).into(),
                        value: value.trim_end().into(),
                    })
                }
                _ => unreachable!(),
            }
        }
        if let Some(rest) = strip("SUT_PYTHON_CALL:", text) {
            match fields(rest, "SUT_PYTHON_CALL", 4)?.as_slice() {
                [target, attr, args, kwargs] => {
                    return Ok(Self::InProcCall {
                        target: (*target).into(),
                        attr: (*attr).into(),
                        args: (*args).into(),
                        kwargs: kwargs.trim_end().into(),
                    })
                }
                _ => unreachable!(),
            }
        }

        Ok(Self::ClientSocket { text: text.into() })
    }
}

fn strip<'t>(prefix: &str, text: &'t str) -> Option<&'t str> {
    if text.starts_with(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

fn fields<'t>(rest: &'t str, kind: &'static str, expected: usize) -> Result<Vec<&'t str>> {
    let parts: Vec<_> = rest.splitn(expected, FIELD_SEP).collect();
    if parts.len() == expected {
        Ok(parts)
    } else {
        Err(Error::FieldCount { kind, expected })
    }
}

fn parse_num(text: &str) -> Result<i32> {
    text.trim().parse().map_err(|_| Error::Number {
        text: text.trim().into(),
    })
}
