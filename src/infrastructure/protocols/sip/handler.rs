//! Proxy module chain interface

use super::event::{RequestEvent, ResponseEvent};
use crate::config::{Config, ConfigError, ConfigOption};
use async_trait::async_trait;

/// What the chain does with an event after a module handled it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleAction {
    /// Hand the event to the next module
    Continue,
    /// The module answered or dropped the event
    Stop,
}

/// A module of the proxy processing chain
#[async_trait]
pub trait SipModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Options the module reads from its configuration section
    fn declare_config(&self) -> &'static [ConfigOption] {
        &[]
    }

    /// Process an inbound request
    async fn on_request(&self, event: &mut RequestEvent) -> ModuleAction;

    /// Process a response relayed back to the client
    async fn on_response(&self, _event: &mut ResponseEvent) -> ModuleAction {
        ModuleAction::Continue
    }

    /// Periodic maintenance
    fn on_idle(&self) {}

    /// A configuration value was committed
    fn on_config_commit(&self, _key: &str, _config: &Config) -> Result<(), ConfigError> {
        Ok(())
    }
}
