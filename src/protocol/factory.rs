use anyhow::{anyhow, bail};
use bytes::Buf;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::message::Message;
use crate::util::buf_ext::BufExt;

/// Type codes of the binary (datagram) encoding's fixed header.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Confirm = 0x00,
    Reply = 0x01,
    Auth = 0x02,
    Join = 0x03,
    Msg = 0x04,
    Ping = 0xFD,
    Err = 0xFE,
    Bye = 0xFF,
}

/// Parses one CRLF-terminated text frame (the terminator may already be
/// stripped). Accepts exactly the grammar the text encoder produces.
///
/// A text REPLY carries no Ref_MessageID, so the parsed variant gets 0 there.
pub fn parse_text(line: &str) -> anyhow::Result<Message> {
    let line = line.strip_suffix("\r\n").unwrap_or(line);

    let (keyword, rest) = match line.split_once(' ') {
        Some((k, r)) => (k, r),
        None => (line, ""),
    };

    match keyword {
        "AUTH" => {
            let (username, rest) = expect_field(rest, " AS ", "AUTH")?;
            let (display_name, secret) = expect_field(rest, " USING ", "AUTH")?;
            Message::auth(username, display_name, secret)
        }
        "JOIN" => {
            let (channel_id, display_name) = expect_field(rest, " AS ", "JOIN")?;
            Message::join(channel_id, display_name)
        }
        "MSG" => {
            let rest = rest
                .strip_prefix("FROM ")
                .ok_or_else(|| anyhow!("malformed MSG frame: missing FROM"))?;
            let (display_name, content) = expect_field(rest, " IS ", "MSG")?;
            Message::msg(display_name, content)
        }
        "REPLY" => {
            let (result, content) = expect_field(rest, " IS ", "REPLY")?;
            let success = match result {
                "OK" => true,
                "NOK" => false,
                other => bail!("malformed REPLY frame: unexpected result {:?}", other),
            };
            Message::reply(success, content, 0)
        }
        "ERR" => {
            let rest = rest
                .strip_prefix("FROM ")
                .ok_or_else(|| anyhow!("malformed ERR frame: missing FROM"))?;
            let (display_name, content) = expect_field(rest, " IS ", "ERR")?;
            Message::err(display_name, content)
        }
        "BYE" => {
            let display_name = rest
                .strip_prefix("FROM ")
                .ok_or_else(|| anyhow!("malformed BYE frame: missing FROM"))?;
            Message::bye(display_name)
        }
        "CONFIRM" if rest.is_empty() => Ok(Message::Confirm),
        "PING" if rest.is_empty() => Ok(Message::Ping),
        other => Err(anyhow!("unknown message type: {:?}", other)),
    }
}

fn expect_field<'a>(
    input: &'a str,
    separator: &str,
    frame: &str,
) -> anyhow::Result<(&'a str, &'a str)> {
    input
        .split_once(separator)
        .ok_or_else(|| anyhow!("malformed {} frame: missing {:?}", frame, separator.trim()))
}

/// Parses one binary datagram frame, returning the message ID from the fixed
/// header alongside the decoded message. The ID is needed by the datagram
/// transport for acknowledgment and duplicate tracking.
pub fn parse_binary(frame: &[u8]) -> anyhow::Result<(u16, Message)> {
    if frame.len() < 3 {
        bail!("binary frame too short: {} bytes", frame.len());
    }

    let mut buf = frame;
    let type_code = buf.get_u8();
    let message_id = buf.get_u16();
    let frame_type = FrameType::try_from(type_code)
        .map_err(|_| anyhow!("unknown frame type code 0x{:02x}", type_code))?;

    let msg = match frame_type {
        FrameType::Confirm => Message::Confirm,
        FrameType::Ping => Message::Ping,
        FrameType::Reply => {
            let success = buf.try_get_u8()? != 0;
            let ref_message_id = buf.try_get_u16()?;
            let content = buf.try_get_cstr()?;
            Message::reply(success, &content, ref_message_id)?
        }
        FrameType::Auth => {
            let username = buf.try_get_cstr()?;
            let display_name = buf.try_get_cstr()?;
            let secret = buf.try_get_cstr()?;
            Message::auth(&username, &display_name, &secret)?
        }
        FrameType::Join => {
            let channel_id = buf.try_get_cstr()?;
            let display_name = buf.try_get_cstr()?;
            Message::join(&channel_id, &display_name)?
        }
        FrameType::Msg => {
            let display_name = buf.try_get_cstr()?;
            let content = buf.try_get_cstr()?;
            Message::msg(&display_name, &content)?
        }
        FrameType::Err => {
            let display_name = buf.try_get_cstr()?;
            let content = buf.try_get_cstr()?;
            Message::err(&display_name, &content)?
        }
        FrameType::Bye => {
            let display_name = buf.try_get_cstr()?;
            Message::bye(&display_name)?
        }
    };

    if buf.has_remaining() {
        bail!("{} trailing bytes after {:?} frame", buf.remaining(), frame_type);
    }
    Ok((message_id, msg))
}
