use crate::observe::Registration;

use std::{net::SocketAddr, sync::Arc};

use ahash::AHashMap;
use codec::{Token, key::ResourceKey, pdu::Pdu};

/// Request handler invoked with the owning resource, the remote
/// address, the request, its token and a pre-framed response PDU.
pub type MethodHandler =
    Arc<dyn Fn(&mut Resource, &SocketAddr, &Pdu, &Token, &mut Pdu) + Send + Sync>;

/// Hook invoked once when a subscriber's notification stream fails, so
/// the upper layer can tear down its state.
pub type UnregisterHandler = Arc<dyn Fn(&mut Resource, &Arc<Registration>) + Send + Sync>;

/// One addressable resource: a hash key derived from its URI path, a
/// method handler table indexed by request code, and the head of its
/// subscriber list.
pub struct Resource {
    key: ResourceKey,
    path: String,
    handlers: [Option<MethodHandler>; 4],
    on_unregister: Option<UnregisterHandler>,
    subscribers: Vec<Arc<Registration>>,
}

impl Resource {
    pub fn new(path: &str) -> Self {
        Self {
            key: ResourceKey::from_path(path),
            path: path.trim_matches('/').to_string(),
            handlers: [None, None, None, None],
            on_unregister: None,
            subscribers: Vec::new(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Installs the handler for a request method code (GET..DELETE).
    pub fn set_handler(
        &mut self,
        code: u8,
        handler: impl Fn(&mut Resource, &SocketAddr, &Pdu, &Token, &mut Pdu) + Send + Sync + 'static,
    ) {
        if code == 0 {
            return;
        }

        if let Some(slot) = self.handlers.get_mut(code as usize - 1) {
            *slot = Some(Arc::new(handler));
        }
    }

    pub fn handler(&self, code: u8) -> Option<MethodHandler> {
        if !(1..=self.handlers.len() as u8).contains(&code) {
            return None;
        }

        self.handlers[code as usize - 1].clone()
    }

    pub fn set_unregister(
        &mut self,
        handler: impl Fn(&mut Resource, &Arc<Registration>) + Send + Sync + 'static,
    ) {
        self.on_unregister = Some(Arc::new(handler));
    }

    pub(crate) fn unregister_handler(&self) -> Option<UnregisterHandler> {
        self.on_unregister.clone()
    }

    pub fn subscribers(&self) -> &[Arc<Registration>] {
        &self.subscribers
    }

    pub fn find_registration(&self, peer: &SocketAddr) -> Option<&Arc<Registration>> {
        self.subscribers.iter().find(|reg| reg.peer() == *peer)
    }

    /// Registers a subscriber, or refreshes an existing one.
    ///
    /// An existing record keeps its pointer identity (it is the handle
    /// the upper layer holds) and only its token is overwritten with
    /// the incoming one. The returned handle is always checked out, so
    /// the caller owns exactly one release.
    pub fn add_registration(&mut self, peer: SocketAddr, token: &Token) -> Arc<Registration> {
        if let Some(reg) = self.subscribers.iter().find(|reg| reg.peer() == peer) {
            reg.set_token(token);
            return reg.checkout();
        }

        let reg = Registration::new(self.key, peer, token);
        self.subscribers.insert(0, reg.clone());
        reg.checkout()
    }

    /// Balances one checkout. The release that brings the count to zero
    /// also scrubs the record from the subscriber list, which is the
    /// unique point where the record goes away.
    pub fn release_registration(&mut self, reg: Arc<Registration>) {
        if reg.release_ref() == 0 {
            log::debug!("dropping registration of {}", reg.peer());
            self.subscribers.retain(|held| !Arc::ptr_eq(held, &reg));
        }
    }
}

/// The keyed resource registry consumed by the dispatcher.
///
/// # Test
///
/// ```
/// use coap_server_service::resource::{Resource, ResourceMap};
/// use codec::key::ResourceKey;
///
/// let mut resources = ResourceMap::default();
/// resources.insert(Resource::new("sensors/accel"));
/// resources.insert(Resource::new("sensors/light"));
///
/// let key = ResourceKey::from_path("sensors/accel");
/// assert!(resources.get(&key).is_some());
/// assert!(resources.link_format().contains("</sensors/accel>"));
/// ```
#[derive(Default)]
pub struct ResourceMap(AHashMap<ResourceKey, Resource>);

impl ResourceMap {
    pub fn insert(&mut self, resource: Resource) {
        self.0.insert(resource.key(), resource);
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Resource> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &ResourceKey) -> Option<&mut Resource> {
        self.0.get_mut(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &ResourceKey) -> Option<Resource> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.values()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Link-format listing of every registered resource, served for
    /// GET `.well-known/core`.
    pub fn link_format(&self) -> String {
        let mut out = String::new();
        for (index, resource) in self.0.values().enumerate() {
            if index > 0 {
                out.push(',');
            }

            out.push_str("</");
            out.push_str(resource.path());
            out.push('>');
            if resource.unregister_handler().is_some() {
                out.push_str(";obs");
            }
        }

        out
    }
}
