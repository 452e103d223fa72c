//! Broker side of the runtime.
//!
//! Leaves never talk to the MQTT client directly. They queue [`Outbound`]
//! messages on a bounded outbox through [`BrokerHandle`]; a forwarder task
//! drains the outbox into `rumqttc`. A full outbox drops the message with a
//! warning instead of stalling the caller.

use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::event::{Event, EventKind};
use crate::protocol::{parse_inbound, NodeAnnounce, Topics};

/// Delay before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Outbound>,
    topics: Topics,
}

impl BrokerHandle {
    /// Create a handle and the outbox receiver that a forwarder drains.
    pub fn channel(topics: Topics, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, topics }, rx)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// False once the outbox receiver is gone.
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a message. Returns false if it was dropped.
    pub fn publish(&self, msg: Outbound) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(topic = %msg.topic, "broker outbox full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                warn!(topic = %msg.topic, "broker outbox closed, dropping message");
                false
            }
        }
    }

    /// `{"deviceName": ...}` on `P/status`, plus `action` for maintenance
    /// notices.
    pub fn announce(&self, device_name: &str, action: Option<&str>) -> bool {
        let body = NodeAnnounce {
            device_name,
            action,
        };
        let payload = match serde_json::to_vec(&body) {
            Ok(p) => p,
            Err(e) => {
                warn!("announce serialization failed: {e}");
                return false;
            }
        };
        self.publish(Outbound {
            topic: self.topics.node_status(),
            payload,
            qos: QoS::ExactlyOnce,
            retain: false,
        })
    }

    pub fn publish_leaf_status(&self, leaf: &str, snapshot: &serde_json::Value) -> bool {
        self.publish(Outbound {
            topic: self.topics.leaf_status(leaf),
            payload: snapshot.to_string().into_bytes(),
            qos: QoS::AtMostOnce,
            retain: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Drain the outbox into the MQTT client. Runs until every handle is gone.
pub async fn forward(client: AsyncClient, mut outbox: mpsc::Receiver<Outbound>) {
    while let Some(msg) = outbox.recv().await {
        if let Err(e) = client
            .publish(&msg.topic, msg.qos, msg.retain, msg.payload)
            .await
        {
            warn!(topic = %msg.topic, "publish error: {e}");
        } else {
            debug!(topic = %msg.topic, "published");
        }
    }
    info!("broker outbox closed, forwarder exiting");
}

/// Poll the MQTT event loop, translating connectivity and inbound commands
/// into bus events.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    bus: EventBus,
) {
    let mut connected = false;

    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                for filter in topics.subscriptions() {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        warn!(filter = %filter, "subscribe failed: {e}");
                    }
                }
                connected = true;
                post(&bus, Event::new(EventKind::ServerConnected)).await;
            }
            Ok(MqttEvent::Incoming(Packet::Publish(p))) => {
                match parse_inbound(&topics, &p.topic, &p.payload) {
                    Some(inbound) => post(&bus, inbound.into_event()).await,
                    None => debug!(topic = %p.topic, "unhandled topic"),
                }
            }
            Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                if connected {
                    connected = false;
                    post(&bus, Event::new(EventKind::ServerDisconnected)).await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                if connected {
                    connected = false;
                    post(&bus, Event::new(EventKind::ServerDisconnected)).await;
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn post(bus: &EventBus, ev: Event) {
    let kind = ev.kind;
    if let Err(e) = bus.post(ev).await {
        warn!(%kind, "could not post broker event: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (BrokerHandle, mpsc::Receiver<Outbound>) {
        BrokerHandle::channel(Topics::new("gh"), capacity)
    }

    #[test]
    fn announce_goes_to_node_status() {
        let (broker, mut rx) = handle(4);
        assert!(broker.announce("greenhouse", None));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.topic, "gh/status");
        assert_eq!(msg.payload, br#"{"deviceName":"greenhouse"}"#.to_vec());
        assert_eq!(msg.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn leaf_status_payload_is_snapshot() {
        let (broker, mut rx) = handle(4);
        let snap = serde_json::json!({"status": true});
        assert!(broker.publish_leaf_status("plt_a", &snap));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.topic, "gh/plt_a/status");
        assert_eq!(msg.payload, br#"{"status":true}"#.to_vec());
    }

    #[test]
    fn full_outbox_drops_instead_of_blocking() {
        let (broker, mut rx) = handle(1);
        assert!(broker.announce("a", None));
        assert!(!broker.announce("b", None));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_outbox_reports_not_live() {
        let (broker, rx) = handle(1);
        assert!(broker.is_live());
        drop(rx);
        assert!(!broker.is_live());
        assert!(!broker.announce("a", None));
    }
}
