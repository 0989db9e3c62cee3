//! APID to [`PacketLayout`] resolution.
//!
//! The registry has a two-phase lifecycle. Layouts are registered into a [`RegistryBuilder`]
//! before any decoding starts, then [`RegistryBuilder::build`] produces an immutable
//! [`DefinitionRegistry`] that may be shared freely between decode workers.
//!
//! Registering a layout for an APID that already has one replaces it; the last registration
//! wins.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::layout::PacketLayout;
use crate::spacepacket::Apid;
use crate::Result;

/// A source of packet layouts, e.g., a mission or instrument definition package.
pub trait PacketDefinitions {
    /// Name used when logging registrations.
    fn name(&self) -> &str;

    /// Layouts provided, in registration order.
    fn layouts(&self) -> Vec<PacketLayout>;
}

impl PacketDefinitions for (&str, Vec<PacketLayout>) {
    fn name(&self) -> &str {
        self.0
    }

    fn layouts(&self) -> Vec<PacketLayout> {
        self.1.clone()
    }
}

/// Write phase of the registry.
#[derive(Debug, Default, Clone)]
pub struct RegistryBuilder {
    layouts: HashMap<Apid, Arc<PacketLayout>>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert `layout`, replacing any layout already registered for its APID.
    ///
    /// # Errors
    /// [`crate::Error::MalformedLayout`] if the layout fails validation, in which case the
    /// registry is unchanged.
    pub fn register(&mut self, layout: PacketLayout) -> Result<()> {
        layout.validate()?;
        let apid = layout.apid;
        if let Some(prev) = self.layouts.insert(apid, Arc::new(layout)) {
            warn!(
                apid,
                previous = prev.name.as_deref().unwrap_or(""),
                "layout replaced by later registration"
            );
        } else {
            debug!(apid, "registered layout");
        }
        Ok(())
    }

    /// Register every layout provided by `plugin`, in order.
    ///
    /// # Errors
    /// The first malformed layout. Layouts before it remain registered.
    pub fn register_plugin(&mut self, plugin: &dyn PacketDefinitions) -> Result<()> {
        let layouts = plugin.layouts();
        debug!(plugin = plugin.name(), count = layouts.len(), "registering plugin");
        for layout in layouts {
            self.register(layout)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn resolve(&self, apid: Apid) -> Option<&PacketLayout> {
        self.layouts.get(&apid).map(AsRef::as_ref)
    }

    /// Finish registration.
    #[must_use]
    pub fn build(self) -> DefinitionRegistry {
        DefinitionRegistry {
            layouts: Arc::new(self.layouts),
        }
    }
}

/// Read-only APID to layout mapping. Cloning is cheap and clones share the same layouts.
#[derive(Debug, Default, Clone)]
pub struct DefinitionRegistry {
    layouts: Arc<HashMap<Apid, Arc<PacketLayout>>>,
}

impl DefinitionRegistry {
    /// Lookup the layout for `apid`. `None` is not an error; such packets are counted as
    /// unknown by the aggregator.
    #[must_use]
    pub fn resolve(&self, apid: Apid) -> Option<&PacketLayout> {
        self.layouts.get(&apid).map(AsRef::as_ref)
    }

    /// Like [`Self::resolve`], but returns a handle that can be moved to another thread.
    #[must_use]
    pub fn resolve_shared(&self, apid: Apid) -> Option<Arc<PacketLayout>> {
        self.layouts.get(&apid).cloned()
    }

    #[must_use]
    pub fn contains(&self, apid: Apid) -> bool {
        self.layouts.contains_key(&apid)
    }

    /// Registered APIDs in ascending order.
    #[must_use]
    pub fn apids(&self) -> Vec<Apid> {
        let mut apids: Vec<Apid> = self.layouts.keys().copied().collect();
        apids.sort_unstable();
        apids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}
