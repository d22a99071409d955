//! ---
//! ms_section: "02-routing"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Pattern-based routing of process variables to typed channels."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::{ChannelError, ChannelKind, ChannelValue};

/// Produces the current value of the named channel.
pub type Getter = Arc<dyn Fn(&str) -> Result<ChannelValue, ChannelError> + Send + Sync>;
/// Applies a client write to the named channel.
pub type Setter = Arc<dyn Fn(&str, ChannelValue) -> Result<(), ChannelError> + Send + Sync>;
/// Called with the channel name when monitoring starts or stops.
pub type SubscriptionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Typed channel bound to one concrete name.
pub struct Channel {
    name: String,
    kind: ChannelKind,
    value: watch::Sender<ChannelValue>,
    subscribers: Mutex<usize>,
    getter: Getter,
    setter: Option<Setter>,
    on_subscribe: Option<SubscriptionHook>,
    on_unsubscribe: Option<SubscriptionHook>,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        kind: ChannelKind,
        getter: Getter,
        setter: Option<Setter>,
        on_subscribe: Option<SubscriptionHook>,
        on_unsubscribe: Option<SubscriptionHook>,
    ) -> Self {
        let (value, _) = watch::channel(kind.default_value());
        Self {
            name,
            kind,
            value,
            subscribers: Mutex::new(0),
            getter,
            setter,
            on_subscribe,
            on_unsubscribe,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }

    /// Last value read, written or posted; the kind default before that.
    pub fn value(&self) -> ChannelValue {
        self.value.borrow().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        *self.subscribers.lock()
    }

    /// Query the getter and cache the result.
    pub fn read(&self) -> Result<ChannelValue, ChannelError> {
        let value = self.kind.coerce((self.getter)(&self.name)?)?;
        self.value.send_replace(value.clone());
        Ok(value)
    }

    /// Apply a client write through the setter.
    pub fn write(&self, value: ChannelValue) -> Result<(), ChannelError> {
        let setter = self
            .setter
            .as_ref()
            .ok_or_else(|| ChannelError::ReadOnly(self.name.clone()))?;
        let value = self.kind.coerce(value)?;
        setter(&self.name, value.clone())?;
        debug!(channel = %self.name, value = ?value, "channel written");
        self.value.send_replace(value);
        Ok(())
    }

    /// Push a new value to subscribers without going through the setter.
    pub fn post(&self, value: ChannelValue) -> Result<(), ChannelError> {
        let value = self.kind.coerce(value)?;
        self.value.send_replace(value);
        Ok(())
    }

    /// Start monitoring. The first subscriber fires the subscribe hook.
    pub fn subscribe(&self) -> watch::Receiver<ChannelValue> {
        let first = {
            let mut count = self.subscribers.lock();
            *count += 1;
            *count == 1
        };
        if first {
            if let Some(hook) = &self.on_subscribe {
                hook(&self.name);
            }
        }
        self.value.subscribe()
    }

    /// Stop monitoring. The last subscriber leaving fires the unsubscribe hook.
    pub fn unsubscribe(&self) {
        let last = {
            let mut count = self.subscribers.lock();
            if *count == 0 {
                return;
            }
            *count -= 1;
            *count == 0
        };
        if last {
            if let Some(hook) = &self.on_unsubscribe {
                hook(&self.name);
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &*self.value.borrow())
            .field("writable", &self.setter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn constant(value: f64) -> Getter {
        Arc::new(move |_| Ok(ChannelValue::Double(value)))
    }

    #[test]
    fn starts_at_default_and_caches_reads() {
        let channel = Channel::new("X".into(), ChannelKind::Double, constant(2.5), None, None, None);
        assert_eq!(channel.value(), ChannelValue::Double(0.0));
        assert_eq!(channel.read(), Ok(ChannelValue::Double(2.5)));
        assert_eq!(channel.value(), ChannelValue::Double(2.5));
    }

    #[test]
    fn write_without_setter_is_read_only() {
        let channel = Channel::new("X".into(), ChannelKind::Double, constant(1.0), None, None, None);
        assert_eq!(
            channel.write(ChannelValue::Double(3.0)),
            Err(ChannelError::ReadOnly("X".into()))
        );
    }

    #[test]
    fn write_reaches_setter_with_coerced_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let setter: Setter = Arc::new(move |name, value| {
            sink.lock().push((name.to_owned(), value));
            Ok(())
        });
        let channel = Channel::new(
            "Q:K1".into(),
            ChannelKind::Double,
            constant(0.0),
            Some(setter),
            None,
            None,
        );
        channel.write(ChannelValue::Integer(2)).expect("write");
        assert_eq!(*seen.lock(), vec![("Q:K1".to_owned(), ChannelValue::Double(2.0))]);
        assert_eq!(channel.value(), ChannelValue::Double(2.0));
    }

    #[test]
    fn hooks_fire_on_first_and_last_subscriber() {
        let subscribed = Arc::new(AtomicUsize::new(0));
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        let on_sub: SubscriptionHook = {
            let counter = Arc::clone(&subscribed);
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        let on_unsub: SubscriptionHook = {
            let counter = Arc::clone(&unsubscribed);
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        let channel = Channel::new(
            "X".into(),
            ChannelKind::Integer,
            Arc::new(|_| Ok(ChannelValue::Integer(1))),
            None,
            Some(on_sub),
            Some(on_unsub),
        );

        let _a = channel.subscribe();
        let _b = channel.subscribe();
        assert_eq!(subscribed.load(Ordering::SeqCst), 1);
        channel.unsubscribe();
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 0);
        channel.unsubscribe();
        channel.unsubscribe();
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn post_notifies_subscribers() {
        let channel = Channel::new("X".into(), ChannelKind::Double, constant(0.0), None, None, None);
        let mut rx = channel.subscribe();
        channel.post(ChannelValue::Double(4.0)).expect("post");
        rx.changed().await.expect("changed");
        assert_eq!(*rx.borrow(), ChannelValue::Double(4.0));
    }
}
