//! Topology and queue state shared by every connection of a memory transport.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Debug};
use std::sync::Arc;

use bytes::Bytes;
use courier_transport::{
    Delivery, ExchangeKind, MessageProperties, NoopAcker, QueueInfo, QueueOptions, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::MemoryAcker;

pub type DeliverySender = mpsc::UnboundedSender<Result<Delivery, TransportError>>;

/// A message sitting in a queue.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub content: Bytes,
    pub properties: MessageProperties,
    pub routing_key: String,
    pub redelivered: bool,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

struct ConsumerSlot {
    tag: String,
    connection: u64,
    no_ack: bool,
    prefetch: u16,
    unacked: usize,
    tx: DeliverySender,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.unacked < usize::from(self.prefetch)
    }
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    consumers: Vec<ConsumerSlot>,
    next: usize,
    ready: VecDeque<StoredMessage>,
}

impl QueueState {
    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            message_count: u32::try_from(self.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(self.consumers.len()).unwrap_or(u32::MAX),
        }
    }

    fn next_available(&self) -> Option<usize> {
        let len = self.consumers.len();
        (0..len)
            .map(|offset| (self.next + offset) % len)
            .find(|&index| self.consumers[index].has_capacity())
    }

    /// Hands ready messages to consumers with spare capacity, round robin.
    fn pump(&mut self, name: &str, broker: &MemoryBroker) {
        while !self.ready.is_empty() {
            let Some(index) = self.next_available() else {
                break;
            };
            let Some(message) = self.ready.pop_front() else {
                break;
            };

            let consumer = &mut self.consumers[index];
            let acker: Arc<dyn courier_transport::Acker> = if consumer.no_ack {
                Arc::new(NoopAcker)
            } else {
                Arc::new(MemoryAcker::new(
                    broker.clone(),
                    name.to_string(),
                    consumer.tag.clone(),
                    message.clone(),
                ))
            };
            let delivery = Delivery::new(
                message.content.clone(),
                message.properties.clone(),
                message.redelivered,
                consumer.tag.clone(),
                message.routing_key.clone(),
                acker,
            );

            if consumer.tx.send(Ok(delivery)).is_ok() {
                if !consumer.no_ack {
                    consumer.unacked += 1;
                }
                self.next = index + 1;
            } else {
                debug!(queue = name, tag = %consumer.tag, "dropping stale consumer");
                self.consumers.remove(index);
                self.ready.push_front(message);
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

impl BrokerState {
    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
        debug!(queue = name, "queue deleted");
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, TransportError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let state = self.exchanges.get(exchange).ok_or_else(|| {
            TransportError::Publish(format!("no exchange '{exchange}' in vhost '/'"))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, binding_key) in &state.bindings {
            let matched = match state.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding_key == routing_key,
                ExchangeKind::Topic => topic_matches(binding_key, routing_key),
                ExchangeKind::Headers => false,
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }
}

/// In-process broker state. Cloning shares the state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .finish()
    }
}

impl MemoryBroker {
    /// Current state of a queue, if it exists.
    #[must_use]
    pub fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        self.state.lock().queues.get(name).map(|queue| queue.info(name))
    }

    /// Names of every existing queue, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether an exchange with this name exists.
    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub(crate) fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), TransportError> {
        if kind == ExchangeKind::Headers {
            return Err(TransportError::Declare {
                resource: name.to_string(),
                reason: "headers exchanges are not supported in memory".to_string(),
            });
        }

        let mut state = self.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(TransportError::Declare {
                resource: name.to_string(),
                reason: format!(
                    "inequivalent arg 'type': received '{kind}' but current is '{}'",
                    existing.kind
                ),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = name, %kind, "exchange declared");
                Ok(())
            }
        }
    }

    pub(crate) fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
        connection: u64,
    ) -> Result<QueueInfo, TransportError> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get(&name) {
            if queue.owner.is_some_and(|owner| owner != connection) {
                return Err(TransportError::Declare {
                    resource: name.clone(),
                    reason: "resource locked: queue is exclusive to another connection"
                        .to_string(),
                });
            }
            return Ok(queue.info(&name));
        }

        let queue = QueueState {
            options: options.clone(),
            owner: options.exclusive.then_some(connection),
            consumers: Vec::new(),
            next: 0,
            ready: VecDeque::new(),
        };
        let info = queue.info(&name);
        state.queues.insert(name.clone(), queue);
        debug!(queue = %name, exclusive = options.exclusive, "queue declared");
        Ok(info)
    }

    pub(crate) fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Declare {
                resource: queue.to_string(),
                reason: "no such queue".to_string(),
            });
        }
        let exchange_state =
            state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| TransportError::Declare {
                    resource: exchange.to_string(),
                    reason: "no such exchange".to_string(),
                })?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    pub(crate) fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        mut properties: MessageProperties,
    ) -> Result<usize, TransportError> {
        properties.mandatory = false;
        let mut state = self.state.lock();
        let targets = state.route(exchange, routing_key)?;

        for target in &targets {
            if let Some(queue) = state.queues.get_mut(target) {
                queue.ready.push_back(StoredMessage {
                    content: content.clone(),
                    properties: properties.clone(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
                queue.pump(target, self);
            }
        }
        Ok(targets.len())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn consume(
        &self,
        queue: &str,
        tag: &str,
        connection: u64,
        no_ack: bool,
        exclusive: bool,
        prefetch: u16,
        tx: DeliverySender,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let state_queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::Consume(format!("no queue '{queue}' in vhost '/'")))?;

        if state_queue.owner.is_some_and(|owner| owner != connection) {
            return Err(TransportError::Consume(format!(
                "queue '{queue}' is exclusive to another connection"
            )));
        }
        if exclusive && !state_queue.consumers.is_empty() {
            return Err(TransportError::Consume(format!(
                "queue '{queue}' already has consumers"
            )));
        }

        state_queue.consumers.push(ConsumerSlot {
            tag: tag.to_string(),
            connection,
            no_ack,
            prefetch,
            unacked: 0,
            tx,
        });
        state_queue.pump(queue, self);
        Ok(())
    }

    pub(crate) fn cancel(&self, queue: &str, tag: &str) {
        let mut state = self.state.lock();
        let Some(state_queue) = state.queues.get_mut(queue) else {
            return;
        };
        let before = state_queue.consumers.len();
        state_queue.consumers.retain(|consumer| consumer.tag != tag);

        if before > 0 && state_queue.consumers.is_empty() && state_queue.options.auto_delete {
            state.delete_queue(queue);
        }
    }

    /// Settles one delivery held by consumer `tag`, optionally requeueing it.
    pub(crate) fn settle(&self, queue: &str, tag: &str, requeue: Option<StoredMessage>) {
        let mut state = self.state.lock();
        let Some(state_queue) = state.queues.get_mut(queue) else {
            return;
        };
        if let Some(consumer) = state_queue.consumers.iter_mut().find(|c| c.tag == tag) {
            consumer.unacked = consumer.unacked.saturating_sub(1);
        }
        if let Some(mut message) = requeue {
            message.redelivered = true;
            state_queue.ready.push_back(message);
        }
        state_queue.pump(queue, self);
    }

    /// Removes every consumer and exclusive queue belonging to `connection`.
    pub(crate) fn disconnect(&self, connection: u64) {
        let mut state = self.state.lock();
        let mut doomed = Vec::new();
        for (name, queue) in &mut state.queues {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|consumer| consumer.connection != connection);
            let emptied = before > 0 && queue.consumers.is_empty() && queue.options.auto_delete;
            if queue.owner == Some(connection) || emptied {
                doomed.push(name.clone());
            }
        }
        for name in doomed {
            state.delete_queue(&name);
        }
    }
}

/// Matches an AMQP topic binding pattern against a routing key.
///
/// `*` matches exactly one word, `#` matches zero or more words.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "orders.created"));
        assert!(!topic_matches("*.created", "orders.deleted"));
    }

    #[test]
    fn redeclaring_an_exchange_with_another_kind_fails() {
        let broker = MemoryBroker::default();
        broker.declare_exchange("x", ExchangeKind::Fanout).unwrap();
        broker.declare_exchange("x", ExchangeKind::Fanout).unwrap();

        let err = broker.declare_exchange("x", ExchangeKind::Direct).unwrap_err();
        assert!(matches!(err, TransportError::Declare { .. }));
    }

    #[test]
    fn exclusive_queue_is_locked_to_its_connection() {
        let broker = MemoryBroker::default();
        let info = broker
            .declare_queue("", &QueueOptions::exclusive(), 1)
            .unwrap();
        assert!(info.name.starts_with("amq.gen-"));

        assert!(
            broker
                .declare_queue(&info.name, &QueueOptions::default(), 1)
                .is_ok()
        );
        assert!(
            broker
                .declare_queue(&info.name, &QueueOptions::default(), 2)
                .is_err()
        );

        broker.disconnect(1);
        assert!(broker.queue_info(&info.name).is_none());
    }

    #[test]
    fn publishing_to_a_missing_exchange_fails() {
        let broker = MemoryBroker::default();
        let err = broker
            .publish("nope", "", Bytes::new(), MessageProperties::default())
            .unwrap_err();
        assert!(matches!(err, TransportError::Publish(_)));
    }

    #[test]
    fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::default();
        broker
            .declare_queue("jobs", &QueueOptions::default(), 1)
            .unwrap();

        let routed = broker
            .publish("", "jobs", Bytes::from_static(b"x"), MessageProperties::default())
            .unwrap();
        assert_eq!(routed, 1);
        assert_eq!(broker.queue_info("jobs").unwrap().message_count, 1);

        let unrouted = broker
            .publish("", "missing", Bytes::new(), MessageProperties::default())
            .unwrap();
        assert_eq!(unrouted, 0);
    }
}
