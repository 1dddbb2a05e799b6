//! msgpack-rpc framing for the embedded backend session.
//!
//! Three message kinds per the msgpack-rpc spec, each one top-level array:
//! `[0, msgid, method, params]`, `[1, msgid, error, result]` and
//! `[2, method, params]`. We only ever send requests and notifications;
//! the backend sends responses and notifications back.

use std::io::{self, Read, Write};

use rmpv::Value;

use crate::error::{Error, Result};

const REQUEST: u64 = 0;
const RESPONSE: u64 = 1;
const NOTIFICATION: u64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        msgid: u64,
        method: String,
        params: Vec<Value>,
    },
    Response {
        msgid: u64,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

pub fn write_request(
    writer: &mut impl Write,
    msgid: u64,
    method: &str,
    params: Vec<Value>,
) -> Result<()> {
    let message = Value::Array(vec![
        Value::from(REQUEST),
        Value::from(msgid),
        Value::from(method),
        Value::Array(params),
    ]);
    write_value(writer, &message)
}

pub fn write_notification(writer: &mut impl Write, method: &str, params: Vec<Value>) -> Result<()> {
    let message = Value::Array(vec![
        Value::from(NOTIFICATION),
        Value::from(method),
        Value::Array(params),
    ]);
    write_value(writer, &message)
}

fn write_value(writer: &mut impl Write, message: &Value) -> Result<()> {
    rmpv::encode::write_value(writer, message)
        .map_err(|err| Error::Transport(io::Error::other(err)))?;
    writer.flush()?;
    Ok(())
}

/// Decode one message from the stream. I/O failures (including EOF) come
/// back as `Transport`, structurally invalid payloads as `Protocol`.
pub fn read_message(reader: &mut impl Read) -> Result<Message> {
    let value = rmpv::decode::read_value(reader)
        .map_err(|err| Error::Transport(io::Error::other(err)))?;
    parse_message(value)
}

fn parse_message(value: Value) -> Result<Message> {
    let Value::Array(mut fields) = value else {
        return Err(Error::Protocol("rpc message is not an array".into()));
    };
    let kind = fields
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Protocol("rpc message has no kind tag".into()))?;
    match (kind, fields.len()) {
        (REQUEST, 4) => {
            let params = take_params(fields.pop())?;
            let method = take_str(fields.pop())?;
            let msgid = take_u64(fields.pop())?;
            Ok(Message::Request {
                msgid,
                method,
                params,
            })
        }
        (RESPONSE, 4) => {
            let result = fields.pop().unwrap_or(Value::Nil);
            let error = fields.pop().unwrap_or(Value::Nil);
            let msgid = take_u64(fields.pop())?;
            Ok(Message::Response {
                msgid,
                error,
                result,
            })
        }
        (NOTIFICATION, 3) => {
            let params = take_params(fields.pop())?;
            let method = take_str(fields.pop())?;
            Ok(Message::Notification { method, params })
        }
        (kind, len) => Err(Error::Protocol(format!(
            "unexpected rpc message shape: kind {kind}, {len} fields"
        ))),
    }
}

fn take_u64(value: Option<Value>) -> Result<u64> {
    value
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Protocol("expected unsigned integer field".into()))
}

fn take_str(value: Option<Value>) -> Result<String> {
    match value {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| Error::Protocol("method name is not utf-8".into())),
        _ => Err(Error::Protocol("expected string field".into())),
    }
}

fn take_params(value: Option<Value>) -> Result<Vec<Value>> {
    match value {
        Some(Value::Array(params)) => Ok(params),
        _ => Err(Error::Protocol("params is not an array".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trips() {
        let mut buf = Vec::new();
        write_request(
            &mut buf,
            7,
            "nvim_input",
            vec![Value::from("<C-a>")],
        )
        .unwrap();
        let message = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(
            message,
            Message::Request {
                msgid: 7,
                method: "nvim_input".into(),
                params: vec![Value::from("<C-a>")],
            }
        );
    }

    #[test]
    fn notification_round_trips() {
        let mut buf = Vec::new();
        write_notification(&mut buf, "redraw", vec![Value::Array(vec![])]).unwrap();
        let message = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(
            message,
            Message::Notification {
                method: "redraw".into(),
                params: vec![Value::Array(vec![])],
            }
        );
    }

    #[test]
    fn response_parses() {
        let encoded = Value::Array(vec![
            Value::from(1u64),
            Value::from(42u64),
            Value::Nil,
            Value::from("ok"),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &encoded).unwrap();
        let message = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(
            message,
            Message::Response {
                msgid: 42,
                error: Value::Nil,
                result: Value::from("ok"),
            }
        );
    }

    #[test]
    fn malformed_payload_is_a_protocol_error() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::from("not an rpc array")).unwrap();
        match read_message(&mut Cursor::new(buf)) {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_stream_is_a_transport_error() {
        match read_message(&mut Cursor::new(Vec::new())) {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
