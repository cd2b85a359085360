#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use buildup_contracts::envelope::{
    envelope_types, Envelope, EnvelopeId, EnvelopePayload, EnvelopeSink,
};
use buildup_contracts::{ContractViolation, Validate};

pub const BUS_SOURCE: &str = "event_bus";

/// Returned by a subscriber when it cannot handle an envelope. The bus turns
/// this into a `subscriber.error` envelope; it never aborts delivery to the
/// remaining subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFailure {
    pub message: String,
}

impl SubscriberFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

type Handler = Rc<dyn Fn(&Envelope) -> Result<(), SubscriberFailure>>;

/// Handle for removing a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    event_type: String,
    id: u64,
}

struct BusInner {
    subscribers: BTreeMap<String, Vec<(u64, Handler)>>,
    next_subscription_id: u64,
    next_envelope_seq: u64,
    pending: VecDeque<Envelope>,
    dispatching: bool,
}

/// In-process, synchronous, run-to-completion event bus.
///
/// A publish during dispatch only enqueues: the outer drain loop picks the
/// envelope up after the current one finishes, which gives global FIFO order
/// and keeps subscriber call stacks flat. Because delivery is a plain method
/// call, no state borrow may be held across `publish`.
#[derive(Clone)]
pub struct EventBus {
    inner: Rc<RefCell<BusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(BusInner {
                subscribers: BTreeMap::new(),
                next_subscription_id: 0,
                next_envelope_seq: 0,
                pending: VecDeque::new(),
                dispatching: false,
            })),
        }
    }

    pub fn subscribe(
        &self,
        event_type: &str,
        handler: impl Fn(&Envelope) -> Result<(), SubscriberFailure> + 'static,
    ) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        inner.next_subscription_id += 1;
        let id = inner.next_subscription_id;
        inner
            .subscribers
            .entry(event_type.to_string())
            .or_default()
            .push((id, Rc::new(handler)));
        Subscription {
            event_type: event_type.to_string(),
            id,
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut inner = self.inner.borrow_mut();
        if let Some(handlers) = inner.subscribers.get_mut(&subscription.event_type) {
            handlers.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Validates and enqueues the envelope, then drains the queue unless a
    /// drain is already running higher up the stack.
    pub fn publish(&self, envelope: Envelope) -> Result<(), ContractViolation> {
        envelope.validate()?;
        let should_drain = {
            let mut inner = self.inner.borrow_mut();
            inner.pending.push_back(envelope);
            !inner.dispatching
        };
        if should_drain {
            self.drain();
        }
        Ok(())
    }

    fn drain(&self) {
        self.inner.borrow_mut().dispatching = true;
        loop {
            let next = self.inner.borrow_mut().pending.pop_front();
            let envelope = match next {
                Some(envelope) => envelope,
                None => break,
            };
            // snapshot so handlers may subscribe/unsubscribe mid-delivery
            let handlers: Vec<Handler> = {
                let inner = self.inner.borrow();
                inner
                    .subscribers
                    .get(&envelope.event_type)
                    .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default()
            };
            for handler in handlers {
                if let Err(failure) = handler(&envelope) {
                    self.enqueue_subscriber_error(&envelope, failure);
                }
            }
        }
        self.inner.borrow_mut().dispatching = false;
    }

    /// A failing `subscriber.error` handler is reported nowhere else, which
    /// terminates the error cascade.
    fn enqueue_subscriber_error(&self, failed: &Envelope, failure: SubscriberFailure) {
        if failed.event_type == envelope_types::SUBSCRIBER_ERROR {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        inner.next_envelope_seq += 1;
        let id = EnvelopeId::new(format!(
            "{}:evt_{}_{:04}",
            BUS_SOURCE, failed.timestamp.0, inner.next_envelope_seq
        ));
        let envelope = id.and_then(|id| {
            Envelope::v1(
                id,
                BUS_SOURCE,
                EnvelopePayload::SubscriberError {
                    failed_envelope_id: failed.id.clone(),
                    event_type: failed.event_type.clone(),
                    message: failure.message,
                },
                failed.timestamp,
            )
        });
        if let Ok(envelope) = envelope {
            inner.pending.push_back(envelope);
        }
    }
}

impl EnvelopeSink for EventBus {
    fn publish(&self, envelope: Envelope) -> Result<(), ContractViolation> {
        EventBus::publish(self, envelope)
    }
}
