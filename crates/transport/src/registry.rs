//! Stack registry
//!
//! The registration table candidate gathering draws from. The built-in set
//! covers the IP stacks; platform adapters (Bluetooth L2CAP, QUIC, ...)
//! register their own implementations alongside them. The registry is
//! immutable once built, so it can be shared freely across racing tasks.

use crate::stack::ProtocolStack;
use crate::tcp::TcpStack;
use crate::tls::TlsTcpStack;
use crate::udp::UdpStack;
use std::sync::Arc;
use tracing::info;

/// Registration table of available protocol stacks
#[derive(Clone, Default)]
pub struct StackRegistry {
    stacks: Vec<Arc<dyn ProtocolStack>>,
}

impl StackRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in IP stacks (TCP, TLS/TCP, UDP)
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TcpStack::new()));
        registry.register(Arc::new(TlsTcpStack::new()));
        registry.register(Arc::new(UdpStack::new()));
        registry
    }

    /// Register a stack
    pub fn register(&mut self, stack: Arc<dyn ProtocolStack>) {
        info!(stack = stack.name(), "registering protocol stack");
        self.stacks.push(stack);
    }

    /// All registered stacks, in registration order
    pub fn stacks(&self) -> &[Arc<dyn ProtocolStack>] {
        &self.stacks
    }

    /// Look a stack up by name
    pub fn find(&self, name: &str) -> Option<Arc<dyn ProtocolStack>> {
        self.stacks.iter().find(|s| s.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = StackRegistry::with_defaults();
        assert_eq!(registry.len(), 3);
        assert!(registry.find("tcp").is_some());
        assert!(registry.find("tls-tcp").is_some());
        assert!(registry.find("udp").is_some());
        assert!(registry.find("sctp").is_none());
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut registry = StackRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(UdpStack::new()));
        registry.register(Arc::new(TcpStack::new()));

        let names: Vec<_> = registry.stacks().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["udp", "tcp"]);
    }
}
