//! Length-prefixed framer
//!
//! Wire format: `[4-byte big-endian length][1-byte flags][payload]`.
//! The length counts the flags byte plus the payload; flags bit 0 marks a
//! safely-replayable message and bit 1 a final message. Frames above 1 MiB
//! (or empty ones) are rejected with `InvalidMessageSize`, which closes the
//! channel.

use crate::framer::{Framer, FramingError, Result};
use async_trait::async_trait;
use tapestry_core::message::{Message, MessageContext};

/// Maximum value of the length field (flags + payload)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Maximum payload per frame
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - 1;

const FLAG_SAFELY_REPLAYABLE: u8 = 0x01;
const FLAG_FINAL: u8 = 0x02;

const HEADER_LEN: usize = 4;

/// Built-in length-prefixed framer
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixFramer;

impl LengthPrefixFramer {
    pub fn new() -> Self {
        Self
    }

    fn encode_flags(context: &MessageContext) -> u8 {
        let mut flags = 0;
        if context.safely_replayable {
            flags |= FLAG_SAFELY_REPLAYABLE;
        }
        if context.final_message {
            flags |= FLAG_FINAL;
        }
        flags
    }

    fn decode_flags(flags: u8) -> MessageContext {
        MessageContext {
            safely_replayable: flags & FLAG_SAFELY_REPLAYABLE != 0,
            final_message: flags & FLAG_FINAL != 0,
            lifetime: None,
            priority: None,
        }
    }
}

#[async_trait]
impl Framer for LengthPrefixFramer {
    fn name(&self) -> &'static str {
        "length-prefix"
    }

    fn frame_outbound(&self, message: &Message) -> Result<Vec<Vec<u8>>> {
        if message.data.len() > MAX_PAYLOAD_LEN {
            return Err(FramingError::InvalidMessageSize(message.data.len()));
        }

        let length = (message.data.len() + 1) as u32;
        let mut frame = Vec::with_capacity(HEADER_LEN + 1 + message.data.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(Self::encode_flags(&message.context));
        frame.extend_from_slice(&message.data);
        Ok(vec![frame])
    }

    fn parse_inbound(&self, buf: &mut Vec<u8>) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        loop {
            if buf.len() < HEADER_LEN {
                break;
            }

            let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if length == 0 || length > MAX_FRAME_LEN {
                return Err(FramingError::InvalidMessageSize(length));
            }
            if buf.len() < HEADER_LEN + length {
                break;
            }

            let flags = buf[HEADER_LEN];
            let payload = buf[HEADER_LEN + 1..HEADER_LEN + length].to_vec();
            buf.drain(..HEADER_LEN + length);
            messages.push(Message::with_context(payload, Self::decode_flags(flags)));
        }
        Ok(messages)
    }
}
