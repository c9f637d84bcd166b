//! Top-level wiring: owns the tree and the broker client and ties
//! inbound broker traffic back into the tree via a callback, the way
//! spec's component F glues everything together without an event-bus
//! abstraction.

use std::sync::Arc;
use std::time::Duration;

use fuser::Notifier;
use log::warn;
use parking_lot::Mutex;

use crate::broker::BrokerClient;
use crate::error::Result;
use crate::tree::Tree;

/// Holdback applied to every outbound publish triggered by a WRITE.
pub struct MqttFsContext {
    pub tree: Arc<Mutex<Tree>>,
    pub broker: Arc<BrokerClient>,
    pub holdback: Duration,
    notifier: Arc<Mutex<Option<Notifier>>>,
}

impl MqttFsContext {
    pub fn new(
        host: &str,
        port: u16,
        keepalive: Duration,
        holdback: Duration,
        notifier_source: Arc<Mutex<Option<Notifier>>>,
    ) -> Result<Self> {
        let tree = Arc::new(Mutex::new(Tree::new()));
        let callback_tree = tree.clone();
        let callback_notifier = notifier_source.clone();

        let on_publish = Arc::new(move |topic: &[u8], payload: &[u8]| {
            let tokens = {
                let mut t = callback_tree.lock();
                match t.apply_publish(topic, payload) {
                    Ok(tokens) => tokens,
                    Err(e) => {
                        warn!("failed to apply inbound publish: {e}");
                        return;
                    }
                }
            };
            notify_tokens(&callback_notifier, tokens);
        });

        let broker = Arc::new(BrokerClient::create(host, port, keepalive, on_publish)?);

        Ok(MqttFsContext {
            tree,
            broker,
            holdback,
            notifier: notifier_source,
        })
    }

    /// Publish a WRITE's payload to the broker, respecting the
    /// configured holdback delay.
    pub fn publish(&self, topic: &[u8], payload: &[u8]) -> Result<()> {
        self.broker.publish_at(topic, payload, self.holdback)
    }

    /// Fire the out-of-band poll wakeup for every token in `tokens` —
    /// used both by the inbound-publish callback and by `write()` for
    /// a locally written payload, since both "replace a payload" per
    /// the opcode table and must wake exactly the handles that had a
    /// token stored.
    pub fn notify_tokens(&self, tokens: Vec<u64>) {
        notify_tokens(&self.notifier, tokens);
    }

    pub fn shutdown(&self) {
        self.broker.destroy();
    }
}

fn notify_tokens(notifier_source: &Mutex<Option<Notifier>>, tokens: Vec<u64>) {
    if tokens.is_empty() {
        return;
    }
    let guard = notifier_source.lock();
    let Some(notifier) = guard.as_ref() else {
        return;
    };
    for token in tokens {
        if let Err(e) = notifier.poll(fuser::PollHandle(token)) {
            warn!("poll notification failed: {e}");
        }
    }
}
