//! Channel types and their numeric wire identities.

use std::any::TypeId;
use std::collections::HashMap;

use chanlink_frame::ChannelTypeId;
use parking_lot::RwLock;
use tracing::debug;

use crate::payload::Payload;

/// A statically typed channel kind.
///
/// Implementors are usually zero-sized marker types:
///
/// ```
/// use chanlink_peer::{ChannelType, RawBytes};
///
/// struct Telemetry;
///
/// impl ChannelType for Telemetry {
///     type Payload = RawBytes;
/// }
/// ```
///
/// Both ends of a connection must report the same [`type_name`](Self::type_name)
/// for a channel to link.
pub trait ChannelType: 'static {
    type Payload: Payload;

    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Assigns each channel type a numeric id on first use.
///
/// Ids start at 1, increase monotonically and are never reused for the
/// lifetime of the registry. A context shares one registry with all of its
/// connections, so a channel type has the same id on every connection.
#[derive(Debug, Default)]
pub struct ChannelTypeRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    ids: HashMap<TypeId, ChannelTypeId>,
    names: Vec<&'static str>,
}

impl ChannelTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of channel type `C`, assigning the next one if `C` is new.
    pub fn id_of<C: ChannelType>(&self) -> ChannelTypeId {
        let key = TypeId::of::<C>();
        if let Some(id) = self.inner.read().ids.get(&key) {
            return *id;
        }

        let mut inner = self.inner.write();
        if let Some(id) = inner.ids.get(&key) {
            return *id;
        }
        inner.names.push(C::type_name());
        let id = inner.names.len() as ChannelTypeId;
        inner.ids.insert(key, id);
        debug!(channel = C::type_name(), channel_id = id, "channel type registered");
        id
    }

    /// The type name registered under `id`.
    pub fn lookup(&self, id: ChannelTypeId) -> Option<&'static str> {
        let index = (id as usize).checked_sub(1)?;
        self.inner.read().names.get(index).copied()
    }

    /// Number of registered channel types.
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{Json, RawBytes};

    struct Alpha;
    impl ChannelType for Alpha {
        type Payload = RawBytes;
    }

    struct Beta;
    impl ChannelType for Beta {
        type Payload = Json<String>;

        fn type_name() -> &'static str {
            "beta"
        }
    }

    #[test]
    fn distinct_types_get_distinct_stable_ids() {
        let registry = ChannelTypeRegistry::new();
        let alpha = registry.id_of::<Alpha>();
        let beta = registry.id_of::<Beta>();

        assert_ne!(alpha, beta);
        assert_eq!(registry.id_of::<Alpha>(), alpha);
        assert_eq!(registry.id_of::<Beta>(), beta);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn ids_start_at_one_in_first_use_order() {
        let registry = ChannelTypeRegistry::new();
        assert_eq!(registry.id_of::<Beta>(), 1);
        assert_eq!(registry.id_of::<Alpha>(), 2);
    }

    #[test]
    fn registries_are_isolated() {
        let first = ChannelTypeRegistry::new();
        let second = ChannelTypeRegistry::new();
        first.id_of::<Alpha>();
        assert_eq!(first.id_of::<Beta>(), 2);
        assert_eq!(second.id_of::<Beta>(), 1);
    }

    #[test]
    fn lookup_returns_type_names() {
        let registry = ChannelTypeRegistry::new();
        let beta = registry.id_of::<Beta>();
        assert_eq!(registry.lookup(beta), Some("beta"));
        assert_eq!(registry.lookup(0), None);
        assert_eq!(registry.lookup(99), None);
    }

    #[test]
    fn concurrent_registration_agrees() {
        let registry = std::sync::Arc::new(ChannelTypeRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || (registry.id_of::<Alpha>(), registry.id_of::<Beta>()))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(registry.len(), 2);
    }
}
