use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::factory::FrameType;

pub const MAX_USERNAME_LEN: usize = 20;
pub const MAX_CHANNEL_ID_LEN: usize = 20;
pub const MAX_DISPLAY_NAME_LEN: usize = 20;
pub const MAX_SECRET_LEN: usize = 128;
pub const MAX_CONTENT_LEN: usize = 60000;

/// The protocol's closed message vocabulary. Values are immutable once
/// constructed, and the validating constructors below are the only way the
/// rest of the crate builds field-bearing variants - both for operator input
/// and for frames parsed off the wire.
///
/// [Message::Confirm] and [Message::Ping] exist only on the datagram
/// encoding's frame level; the text encoding still round-trips them as bare
/// keyword lines so that both codecs accept exactly what they produce.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    Auth { username: String, display_name: String, secret: String },
    Join { channel_id: String, display_name: String },
    Msg { display_name: String, content: String },
    Reply { success: bool, content: String, ref_message_id: u16 },
    Err { display_name: String, content: String },
    Bye { display_name: String },
    Confirm,
    Ping,
}

impl Message {
    pub fn auth(username: &str, display_name: &str, secret: &str) -> anyhow::Result<Message> {
        validate_id(username, MAX_USERNAME_LEN, "Username")?;
        validate_display_name(display_name)?;
        validate_id(secret, MAX_SECRET_LEN, "Secret")?;
        Ok(Message::Auth {
            username: username.to_string(),
            display_name: display_name.to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn join(channel_id: &str, display_name: &str) -> anyhow::Result<Message> {
        validate_id(channel_id, MAX_CHANNEL_ID_LEN, "ChannelID")?;
        validate_display_name(display_name)?;
        Ok(Message::Join {
            channel_id: channel_id.to_string(),
            display_name: display_name.to_string(),
        })
    }

    pub fn msg(display_name: &str, content: &str) -> anyhow::Result<Message> {
        validate_display_name(display_name)?;
        validate_content(content)?;
        Ok(Message::Msg {
            display_name: display_name.to_string(),
            content: content.to_string(),
        })
    }

    pub fn reply(success: bool, content: &str, ref_message_id: u16) -> anyhow::Result<Message> {
        validate_content(content)?;
        Ok(Message::Reply {
            success,
            content: content.to_string(),
            ref_message_id,
        })
    }

    pub fn err(display_name: &str, content: &str) -> anyhow::Result<Message> {
        validate_display_name(display_name)?;
        validate_content(content)?;
        Ok(Message::Err {
            display_name: display_name.to_string(),
            content: content.to_string(),
        })
    }

    pub fn bye(display_name: &str) -> anyhow::Result<Message> {
        validate_display_name(display_name)?;
        Ok(Message::Bye {
            display_name: display_name.to_string(),
        })
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Message::Auth { .. } => FrameType::Auth,
            Message::Join { .. } => FrameType::Join,
            Message::Msg { .. } => FrameType::Msg,
            Message::Reply { .. } => FrameType::Reply,
            Message::Err { .. } => FrameType::Err,
            Message::Bye { .. } => FrameType::Bye,
            Message::Confirm => FrameType::Confirm,
            Message::Ping => FrameType::Ping,
        }
    }

    /// Renders the CRLF-terminated text frame for the stream transport.
    pub fn serialize(&self) -> String {
        match self {
            Message::Auth { username, display_name, secret } => {
                format!("AUTH {} AS {} USING {}\r\n", username, display_name, secret)
            }
            Message::Join { channel_id, display_name } => {
                format!("JOIN {} AS {}\r\n", channel_id, display_name)
            }
            Message::Msg { display_name, content } => {
                format!("MSG FROM {} IS {}\r\n", display_name, content)
            }
            Message::Reply { success, content, .. } => {
                format!("REPLY {} IS {}\r\n", if *success { "OK" } else { "NOK" }, content)
            }
            Message::Err { display_name, content } => {
                format!("ERR FROM {} IS {}\r\n", display_name, content)
            }
            Message::Bye { display_name } => format!("BYE FROM {}\r\n", display_name),
            Message::Confirm => "CONFIRM\r\n".to_string(),
            Message::Ping => "PING\r\n".to_string(),
        }
    }

    /// Renders the binary frame for the datagram transport:
    /// `[type:1][message_id:2 BE]` followed by the per-type payload with
    /// null-terminated string fields.
    pub fn serialize_binary(&self, message_id: u16) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.frame_type().into());
        buf.put_u16(message_id);

        match self {
            Message::Auth { username, display_name, secret } => {
                put_cstr(&mut buf, username);
                put_cstr(&mut buf, display_name);
                put_cstr(&mut buf, secret);
            }
            Message::Join { channel_id, display_name } => {
                put_cstr(&mut buf, channel_id);
                put_cstr(&mut buf, display_name);
            }
            Message::Msg { display_name, content } => {
                put_cstr(&mut buf, display_name);
                put_cstr(&mut buf, content);
            }
            Message::Reply { success, content, ref_message_id } => {
                buf.put_u8(u8::from(*success));
                buf.put_u16(*ref_message_id);
                put_cstr(&mut buf, content);
            }
            Message::Err { display_name, content } => {
                put_cstr(&mut buf, display_name);
                put_cstr(&mut buf, content);
            }
            Message::Bye { display_name } => {
                put_cstr(&mut buf, display_name);
            }
            Message::Confirm | Message::Ping => {}
        }

        buf.freeze()
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Username, secret and channel ID share one restricted identifier charset.
fn validate_id(value: &str, max_len: usize, field: &str) -> anyhow::Result<()> {
    validate_len(value, max_len, field)?;
    if !value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        bail!("{} contains invalid characters", field);
    }
    Ok(())
}

/// Display names are any printable ASCII (0x21-0x7E), no spaces.
pub(crate) fn validate_display_name(value: &str) -> anyhow::Result<()> {
    validate_len(value, MAX_DISPLAY_NAME_LEN, "DisplayName")?;
    if !value.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
        bail!("DisplayName contains invalid characters");
    }
    Ok(())
}

/// Message content allows printable ASCII plus space and line feed.
fn validate_content(value: &str) -> anyhow::Result<()> {
    validate_len(value, MAX_CONTENT_LEN, "MessageContent")?;
    if !value.bytes().all(|b| b == 0x0a || (0x20..=0x7e).contains(&b)) {
        bail!("MessageContent contains invalid characters");
    }
    Ok(())
}

fn validate_len(value: &str, max_len: usize, field: &str) -> anyhow::Result<()> {
    if value.is_empty() {
        bail!("{} must not be empty", field);
    }
    if value.len() > max_len {
        bail!("{} exceeds maximum length of {}", field, max_len);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_serialize_auth() {
        let msg = Message::auth("alice", "Alice", "secretpw").unwrap();
        assert_eq!(msg.serialize(), "AUTH alice AS Alice USING secretpw\r\n");
    }

    #[rstest]
    #[case::join(Message::join("general", "Alice").unwrap(), "JOIN general AS Alice\r\n")]
    #[case::msg(Message::msg("Alice", "hi there").unwrap(), "MSG FROM Alice IS hi there\r\n")]
    #[case::reply_ok(Message::reply(true, "joined", 0).unwrap(), "REPLY OK IS joined\r\n")]
    #[case::reply_nok(Message::reply(false, "denied", 0).unwrap(), "REPLY NOK IS denied\r\n")]
    #[case::err(Message::err("Server", "oops").unwrap(), "ERR FROM Server IS oops\r\n")]
    #[case::bye(Message::bye("Alice").unwrap(), "BYE FROM Alice\r\n")]
    #[case::confirm(Message::Confirm, "CONFIRM\r\n")]
    #[case::ping(Message::Ping, "PING\r\n")]
    fn test_serialize_text(#[case] msg: Message, #[case] expected: &str) {
        assert_eq!(msg.serialize(), expected);
    }

    #[rstest]
    #[case::auth(
        Message::auth("al", "Al", "pw").unwrap(),
        5,
        b"\x02\x00\x05al\0Al\0pw\0".as_slice()
    )]
    #[case::join(
        Message::join("ch", "Al").unwrap(),
        0x0102,
        b"\x03\x01\x02ch\0Al\0".as_slice()
    )]
    #[case::msg(
        Message::msg("Al", "hi").unwrap(),
        1,
        b"\x04\x00\x01Al\0hi\0".as_slice()
    )]
    #[case::reply(
        Message::reply(true, "ok", 7).unwrap(),
        2,
        b"\x01\x00\x02\x01\x00\x07ok\0".as_slice()
    )]
    #[case::err(
        Message::err("Al", "bad").unwrap(),
        3,
        b"\xfe\x00\x03Al\0bad\0".as_slice()
    )]
    #[case::bye(Message::bye("Al").unwrap(), 4, b"\xff\x00\x04Al\0".as_slice())]
    #[case::confirm(Message::Confirm, 7, b"\x00\x00\x07".as_slice())]
    #[case::ping(Message::Ping, 9, b"\xfd\x00\x09".as_slice())]
    fn test_serialize_binary(#[case] msg: Message, #[case] id: u16, #[case] expected: &[u8]) {
        assert_eq!(msg.serialize_binary(id).as_ref(), expected);
    }

    #[rstest]
    #[case::username_too_long(Message::auth(&"a".repeat(21), "Al", "pw"))]
    #[case::username_bad_charset(Message::auth("al ice", "Al", "pw"))]
    #[case::secret_too_long(Message::auth("al", "Al", &"s".repeat(129)))]
    #[case::display_name_space(Message::auth("al", "A l", "pw"))]
    #[case::display_name_too_long(Message::bye(&"x".repeat(21)))]
    #[case::display_name_non_ascii(Message::bye("Ali\u{010d}ka"))]
    #[case::channel_bad_charset(Message::join("ch@nnel", "Al"))]
    #[case::content_too_long(Message::msg("Al", &"m".repeat(60001)))]
    #[case::content_control_char(Message::msg("Al", "hi\x07"))]
    #[case::empty_username(Message::auth("", "Al", "pw"))]
    fn test_validation_rejects(#[case] result: anyhow::Result<Message>) {
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_accepts_boundary_lengths() {
        assert!(Message::auth(&"a".repeat(20), &"!".repeat(20), &"s".repeat(128)).is_ok());
        assert!(Message::msg("Al", &"m".repeat(60000)).is_ok());
        assert!(Message::msg("Al", "line one\nline two").is_ok());
    }
}
