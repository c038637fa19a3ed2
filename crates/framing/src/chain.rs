//! Ordered framer chain
//!
//! The chain owns the per-connection parse state: one remainder buffer per
//! framer. Outbound, a message traverses first-to-last, each chunk becoming
//! the next framer's message with the context inherited. Inbound, raw bytes
//! enter the last framer; its messages feed the preceding framer, down to the
//! first. With no framers, every raw read is one message.

use crate::framer::{ConnectionInfo, Framer, Result};
use std::sync::Arc;
use tapestry_core::message::Message;
use tracing::warn;

/// An ordered chain of framers plus its per-connection parse state
pub struct FramerChain {
    framers: Vec<Arc<dyn Framer>>,
    /// One inbound remainder buffer per framer
    buffers: Vec<Vec<u8>>,
}

impl FramerChain {
    /// Chain over the given framers (may be empty)
    pub fn new(framers: Vec<Arc<dyn Framer>>) -> Self {
        let buffers = framers.iter().map(|_| Vec::new()).collect();
        Self { framers, buffers }
    }

    /// Chain with no framers: raw bytes pass through one message per read
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.framers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.framers.len()
    }

    /// Encode one application message into transport byte chunks
    pub fn outbound(&self, message: &Message) -> Result<Vec<Vec<u8>>> {
        if self.framers.is_empty() {
            return Ok(vec![message.data.clone()]);
        }

        let mut current = vec![message.clone()];
        for framer in &self.framers {
            let mut next = Vec::new();
            for msg in &current {
                for chunk in framer.frame_outbound(msg)? {
                    next.push(Message::with_context(chunk, msg.context.clone()));
                }
            }
            current = next;
        }
        Ok(current.into_iter().map(|msg| msg.data).collect())
    }

    /// Decode transport bytes into complete application messages
    ///
    /// Incomplete frames stay buffered until the next call.
    pub fn inbound(&mut self, bytes: &[u8]) -> Result<Vec<Message>> {
        if self.framers.is_empty() {
            if bytes.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![Message::new(bytes.to_vec())]);
        }

        // Bytes enter at the transport end of the chain.
        let last = self.framers.len() - 1;
        self.buffers[last].extend_from_slice(bytes);
        let mut messages = self.framers[last].parse_inbound(&mut self.buffers[last])?;

        for i in (0..last).rev() {
            let mut next = Vec::new();
            for msg in &messages {
                self.buffers[i].extend_from_slice(&msg.data);
                next.extend(self.framers[i].parse_inbound(&mut self.buffers[i])?);
            }
            messages = next;
        }
        Ok(messages)
    }

    /// Run every framer's open hook in chain order
    ///
    /// A hook failure is logged and does not skip the remaining hooks.
    pub async fn connection_did_open(&self, info: &ConnectionInfo) {
        for framer in &self.framers {
            if let Err(e) = framer.connection_did_open(info).await {
                warn!(framer = framer.name(), error = %e, "framer open hook failed");
            }
        }
    }

    /// Run every framer's close hook in chain order
    pub async fn connection_did_close(&self, info: &ConnectionInfo) {
        for framer in &self.framers {
            if let Err(e) = framer.connection_did_close(info).await {
                warn!(framer = framer.name(), error = %e, "framer close hook failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::FramingError;
    use crate::length_prefix::LengthPrefixFramer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_chain_passthrough() {
        let mut chain = FramerChain::empty();
        assert!(chain.is_empty());

        let out = chain.outbound(&Message::new(b"raw".as_slice())).unwrap();
        assert_eq!(out, vec![b"raw".to_vec()]);

        let messages = chain.inbound(b"raw").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, b"raw");

        assert!(chain.inbound(b"").unwrap().is_empty());
    }

    #[test]
    fn test_single_framer_round_trip() {
        let mut chain = FramerChain::new(vec![Arc::new(LengthPrefixFramer::new())]);
        assert_eq!(chain.len(), 1);

        let msg = Message::new(b"ping".as_slice());
        let chunks = chain.outbound(&msg).unwrap();
        assert_eq!(chunks.len(), 1);

        let decoded = chain.inbound(&chunks[0]).unwrap();
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn test_remainder_preserved_across_reads() {
        let mut chain = FramerChain::new(vec![Arc::new(LengthPrefixFramer::new())]);

        let chunks = chain.outbound(&Message::new(b"hello".as_slice())).unwrap();
        let wire = &chunks[0];

        // First half yields nothing; second half completes the frame.
        let split = wire.len() / 2;
        assert!(chain.inbound(&wire[..split]).unwrap().is_empty());
        let decoded = chain.inbound(&wire[split..]).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].data, b"hello");
    }

    struct FailingHookFramer {
        open_calls: AtomicUsize,
    }

    #[async_trait]
    impl Framer for FailingHookFramer {
        fn name(&self) -> &'static str {
            "failing-hook"
        }

        fn frame_outbound(&self, message: &Message) -> crate::framer::Result<Vec<Vec<u8>>> {
            Ok(vec![message.data.clone()])
        }

        fn parse_inbound(&self, buf: &mut Vec<u8>) -> crate::framer::Result<Vec<Message>> {
            let data = std::mem::take(buf);
            Ok(vec![Message::new(data)])
        }

        async fn connection_did_open(&self, _info: &ConnectionInfo) -> crate::framer::Result<()> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            Err(FramingError::Hook("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_hook_failure_does_not_skip_others() {
        let first = Arc::new(FailingHookFramer {
            open_calls: AtomicUsize::new(0),
        });
        let second = Arc::new(FailingHookFramer {
            open_calls: AtomicUsize::new(0),
        });
        let chain = FramerChain::new(vec![first.clone(), second.clone()]);

        let info = ConnectionInfo {
            connection_id: uuid::Uuid::now_v7(),
            local_addr: None,
            remote_addr: None,
        };
        chain.connection_did_open(&info).await;

        assert_eq!(first.open_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.open_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_two_framer_chain_traversal() {
        // Outer framer just passes bytes through; the inner one length-prefixes.
        let mut chain = FramerChain::new(vec![
            Arc::new(LengthPrefixFramer::new()),
            Arc::new(PassThroughFramer),
        ]);

        let msg = Message::new(b"nested".as_slice());
        let chunks = chain.outbound(&msg).unwrap();
        let decoded = chain.inbound(&chunks[0]).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].data, b"nested");
    }

    struct PassThroughFramer;

    #[async_trait]
    impl Framer for PassThroughFramer {
        fn name(&self) -> &'static str {
            "pass-through"
        }

        fn frame_outbound(&self, message: &Message) -> crate::framer::Result<Vec<Vec<u8>>> {
            Ok(vec![message.data.clone()])
        }

        fn parse_inbound(&self, buf: &mut Vec<u8>) -> crate::framer::Result<Vec<Message>> {
            if buf.is_empty() {
                return Ok(Vec::new());
            }
            let data = std::mem::take(buf);
            Ok(vec![Message::new(data)])
        }
    }
}
