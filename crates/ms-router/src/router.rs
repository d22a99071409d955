//! ---
//! ms_section: "02-routing"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Pattern-based routing of process variables to typed channels."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::{debug, trace};

use crate::channel::{Channel, Getter, Setter, SubscriptionHook};
use crate::{RouterError, SemanticType};

/// One registry entry. Patterns match from the start of the name only.
#[derive(Clone)]
pub struct Route {
    pattern: Regex,
    semantic: SemanticType,
    getter: Getter,
    setter: Option<Setter>,
    on_subscribe: Option<SubscriptionHook>,
    on_unsubscribe: Option<SubscriptionHook>,
}

impl Route {
    pub fn new(pattern: &str, semantic: SemanticType, getter: Getter) -> Result<Self, RouterError> {
        let anchored = format!("^(?:{pattern})");
        let pattern = Regex::new(&anchored).map_err(|err| RouterError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            pattern,
            semantic,
            getter,
            setter: None,
            on_subscribe: None,
            on_unsubscribe: None,
        })
    }

    pub fn with_setter(mut self, setter: Setter) -> Self {
        self.setter = Some(setter);
        self
    }

    pub fn on_subscribe(mut self, hook: SubscriptionHook) -> Self {
        self.on_subscribe = Some(hook);
        self
    }

    pub fn on_unsubscribe(mut self, hook: SubscriptionHook) -> Self {
        self.on_unsubscribe = Some(hook);
        self
    }

    fn matches(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    fn build(&self, name: &str) -> Channel {
        Channel::new(
            name.to_owned(),
            self.semantic.kind(),
            Arc::clone(&self.getter),
            self.setter.clone(),
            self.on_subscribe.clone(),
            self.on_unsubscribe.clone(),
        )
    }
}

/// Ordered route registry with a name-keyed channel cache.
///
/// Cached channels are never evicted, so a route added after a name was first
/// resolved does not affect that name.
#[derive(Default)]
pub struct ChannelRouter {
    routes: RwLock<Vec<Route>>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, route: Route) {
        debug!(pattern = %route.pattern.as_str(), semantic = ?route.semantic, "route registered");
        self.routes.write().push(route);
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Resolve `name` to its channel, building and caching it on first use.
    pub fn get(&self, name: &str) -> Result<Arc<Channel>, RouterError> {
        if let Some(channel) = self.channels.lock().get(name) {
            return Ok(Arc::clone(channel));
        }

        let channel = {
            let routes = self.routes.read();
            let route = routes
                .iter()
                .rev()
                .find(|route| {
                    trace!(name, pattern = %route.pattern.as_str(), "testing route");
                    route.matches(name)
                })
                .ok_or_else(|| RouterError::NotFound(name.to_owned()))?;
            Arc::new(route.build(name))
        };

        let mut channels = self.channels.lock();
        let cached = channels
            .entry(name.to_owned())
            .or_insert_with(|| channel);
        Ok(Arc::clone(cached))
    }

    /// Whether any route matches `name`, cached or not.
    pub fn contains(&self, name: &str) -> bool {
        self.channels.lock().contains_key(name)
            || self.routes.read().iter().any(|route| route.matches(name))
    }

    pub fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
