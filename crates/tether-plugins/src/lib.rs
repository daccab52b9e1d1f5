//! # tether-plugins
//!
//! Vendor procedure families for `tether-core` and the registry that picks
//! one for a device.
//!
//! Plugins are tried in priority order and the first whose filter matches
//! the device identity wins. The generic 3GPP plugin matches everything and
//! always comes last.

use std::sync::Arc;

use tether_core::config::TetherConfig;
use tether_core::plugin::{DeviceIdentity, Plugin};
use tracing::debug;

pub mod dial;
pub mod generic;
pub mod huawei;
pub mod load;
pub mod location;
pub mod qmi;
pub mod tables;

pub use generic::Generic3gpp;
pub use huawei::Huawei;
pub use qmi::Qmi;

/// Ordered strategy list of plugins.
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
    fallback: Arc<dyn Plugin>,
}

impl PluginRegistry {
    /// Message-channel devices first, then vendor AT dialects, then the
    /// generic fallback.
    pub fn standard(config: Arc<TetherConfig>) -> Self {
        Self {
            plugins: vec![
                Arc::new(Qmi::new(config.clone())),
                Arc::new(Huawei::new(config.clone())),
            ],
            fallback: Arc::new(Generic3gpp::new(config)),
        }
    }

    /// Insert a plugin ahead of the built-in ones.
    pub fn prepend(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.insert(0, plugin);
        self
    }

    pub fn select(&self, device: &DeviceIdentity) -> Arc<dyn Plugin> {
        let plugin = self
            .plugins
            .iter()
            .find(|p| p.supports(device))
            .unwrap_or(&self.fallback)
            .clone();
        debug!(vendor = %device.vendor, model = %device.model, plugin = plugin.name(), "plugin selected");
        plugin
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .chain(std::iter::once(&self.fallback))
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins
            .iter()
            .chain(std::iter::once(&self.fallback))
            .map(|p| p.name())
            .collect()
    }
}
