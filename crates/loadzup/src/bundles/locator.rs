use crate::config::BundlesConfig;
use crate::types::ResourceKey;

/// Provides the name of the platform bundles are built for.
pub trait PlatformProvider {
    fn platform_name(&self) -> String;
}

/// Maps bundle names to the [`ResourceKey`] they are loaded from.
///
/// Bundles live at `{base_uri}/{platform}/{name}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleLocator {
    prefix: String,
}

impl BundleLocator {
    pub fn new(base_uri: &str, platform: &str) -> Self {
        let base_uri = base_uri.trim_end_matches('/');
        let platform = platform.trim_matches('/');
        Self {
            prefix: format!("{base_uri}/{platform}/"),
        }
    }

    pub fn with_platform(base_uri: &str, platform: &impl PlatformProvider) -> Self {
        Self::new(base_uri, &platform.platform_name())
    }

    pub fn from_config(config: &BundlesConfig) -> Self {
        Self::new(&config.base_uri, &config.platform)
    }

    pub fn key_for(&self, name: &str) -> ResourceKey {
        ResourceKey::new(format!("{}{name}", self.prefix))
    }
}
