//! In-process broker for testing and single-process use
//!
//! Implements the same delivery contract as the broker-backed variants:
//! wildcard subject matching (`*` matches one token, `>` the rest),
//! queue-group load balancing, redelivery after an ack-wait window,
//! delayed negative acknowledgement, and permanent termination. Every
//! delivery carries a redelivery counter, so the full subscriber
//! coordination protocol can be exercised without a server.

use super::{Acknowledger, BrokerSubscription, Connection, Delivery, Frame};
use crate::error::{PubSubError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// In-process broker connection
///
/// Clones share the broker, so a cloned connection handed to a publisher
/// delivers into subscriptions registered through the original.
#[derive(Clone)]
pub struct MemoryConnection {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnection {
    /// Create a broker whose un-acked deliveries are retried after `ack_wait`
    pub fn new(ack_wait: Duration) -> Self {
        Self {
            broker: Arc::new(MemoryBroker {
                ack_wait,
                state: Mutex::new(BrokerState::default()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

struct MemoryBroker {
    ack_wait: Duration,
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct BrokerState {
    subs: Vec<SubEntry>,
    round_robin: HashMap<String, usize>,
}

struct SubEntry {
    id: u64,
    filter: String,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

enum AckOp {
    Ack,
    Nak(Option<Duration>),
    Term,
}

enum Target {
    /// A specific subscription (broadcast delivery)
    Subscription(u64),
    /// Any current member of a queue group
    Group(String),
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn BrokerSubscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.broker.next_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.broker.state.lock().await;
        state.subs.push(SubEntry {
            id,
            filter: subject.to_string(),
            queue_group: (!queue_group.is_empty()).then(|| queue_group.to_string()),
            tx,
        });

        Ok(Box::new(MemorySubscription {
            id,
            broker: self.broker.clone(),
            rx,
        }))
    }

    async fn publish(&self, frame: Frame) -> Result<()> {
        let targets = {
            let state = self.broker.state.lock().await;
            let mut targets = Vec::new();
            let mut groups_seen = Vec::new();
            for entry in &state.subs {
                if !subject_matches(&entry.filter, &frame.subject) {
                    continue;
                }
                match &entry.queue_group {
                    None => targets.push(Target::Subscription(entry.id)),
                    Some(group) => {
                        if !groups_seen.contains(group) {
                            groups_seen.push(group.clone());
                            targets.push(Target::Group(group.clone()));
                        }
                    }
                }
            }
            targets
        };

        for target in targets {
            let broker = self.broker.clone();
            let frame = frame.clone();
            tokio::spawn(async move {
                broker.deliver(frame, target).await;
            });
        }

        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        self.broker.shutdown.cancel();
        let mut state = self.broker.state.lock().await;
        state.subs.clear();
        state.round_robin.clear();
        Ok(())
    }
}

impl MemoryBroker {
    /// Drive one message to its target until acked, termed, or orphaned
    async fn deliver(&self, frame: Frame, target: Target) {
        let mut num_delivered: u64 = 0;

        loop {
            num_delivered += 1;

            let (ack_tx, mut ack_rx) = oneshot::channel();
            let delivery = Delivery::new(
                Frame {
                    reply: Some(format!("_ack.memory.{}", frame.subject)),
                    ..frame.clone()
                },
                Box::new(MemoryAcker {
                    num_delivered,
                    op: StdMutex::new(Some(ack_tx)),
                }),
            );

            let sent = {
                let mut state = self.state.lock().await;
                match &target {
                    Target::Subscription(id) => match state.subs.iter().find(|s| s.id == *id) {
                        Some(entry) => entry.tx.send(delivery).is_ok(),
                        None => return,
                    },
                    Target::Group(group) => {
                        let members: Vec<u64> = state
                            .subs
                            .iter()
                            .filter(|s| {
                                s.queue_group.as_deref() == Some(group.as_str())
                                    && subject_matches(&s.filter, &frame.subject)
                            })
                            .map(|s| s.id)
                            .collect();
                        if members.is_empty() {
                            return;
                        }
                        let cursor = state.round_robin.entry(group.clone()).or_insert(0);
                        let chosen = members[*cursor % members.len()];
                        *cursor = cursor.wrapping_add(1);
                        state
                            .subs
                            .iter()
                            .find(|s| s.id == chosen)
                            .map(|entry| entry.tx.send(delivery).is_ok())
                            .unwrap_or(false)
                    }
                }
            };

            if !sent {
                // Receiver went away between matching and sending; the
                // next iteration re-selects or gives up.
                num_delivered -= 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.ack_wait) => continue,
                op = &mut ack_rx => match op {
                    Ok(AckOp::Ack) | Ok(AckOp::Term) => return,
                    Ok(AckOp::Nak(delay)) => {
                        if let Some(delay) = delay {
                            tokio::select! {
                                _ = self.shutdown.cancelled() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        continue;
                    }
                    // Delivery dropped without a verdict: redeliver after
                    // the ack-wait window, like the broker would.
                    Err(_) => {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(self.ack_wait) => continue,
                        }
                    }
                },
            }
        }
    }
}

struct MemorySubscription {
    id: u64,
    broker: Arc<MemoryBroker>,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        state.subs.retain(|s| s.id != self.id);
        self.rx.close();
        Ok(())
    }
}

struct MemoryAcker {
    num_delivered: u64,
    op: StdMutex<Option<oneshot::Sender<AckOp>>>,
}

impl MemoryAcker {
    fn send(&self, op: AckOp) -> Result<()> {
        let sender = self
            .op
            .lock()
            .map_err(|_| PubSubError::Ack("acknowledger poisoned".to_string()))?
            .take()
            .ok_or_else(|| PubSubError::Ack("already acknowledged".to_string()))?;
        sender
            .send(op)
            .map_err(|_| PubSubError::Ack("broker side gone".to_string()))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    fn num_delivered(&self) -> Result<u64> {
        Ok(self.num_delivered)
    }

    async fn ack(&self) -> Result<()> {
        self.send(AckOp::Ack)
    }

    async fn ack_sync(&self) -> Result<()> {
        self.send(AckOp::Ack)
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.send(AckOp::Nak(delay))
    }

    async fn term(&self) -> Result<()> {
        self.send(AckOp::Term)
    }
}

/// NATS-style subject matching: `*` matches one token, `>` the remainder
fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
