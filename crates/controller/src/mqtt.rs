//! rumqttc-backed [`Transport`]. The event loop is only polled from the
//! dispatch task, so a reconnect attempt buffers any publishes that arrive
//! while it waits for the broker's ConnAck and hands them out afterwards in
//! arrival order.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::ports::{Inbound, Transport, TransportEvent};

/// Upper bound on flushing queued publications during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
    subscriptions: Vec<String>,
    pending: VecDeque<Inbound>,
    reconnect_timeout: Duration,
}

impl MqttTransport {
    pub fn new(options: MqttOptions, subscriptions: Vec<String>, reconnect_timeout: Duration) -> Self {
        let (client, eventloop) = AsyncClient::new(options, 20);
        Self {
            client,
            eventloop,
            connected: false,
            subscriptions,
            pending: VecDeque::new(),
            reconnect_timeout,
        }
    }

    /// Clean sessions drop subscriptions, so they are renewed on every ConnAck.
    fn resubscribe(&self) {
        for topic in &self.subscriptions {
            if let Err(e) = self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                warn!(topic = %topic, "mqtt subscribe failed: {e}");
            }
        }
        info!(topics = self.subscriptions.len(), "mqtt subscribed");
    }

    /// Poll the event loop once and translate what it produced.
    async fn poll_once(&mut self) -> Result<Option<TransportEvent>> {
        match self.eventloop.poll().await {
            Ok(event) => {
                let translated = translate(event);
                match translated {
                    Some(TransportEvent::Connected) => {
                        self.connected = true;
                        self.resubscribe();
                    }
                    Some(TransportEvent::Disconnected) => self.connected = false,
                    _ => {}
                }
                Ok(translated)
            }
            Err(e) => {
                self.connected = false;
                Err(e).context("mqtt connection error")
            }
        }
    }
}

/// Map a raw rumqttc event onto the transport vocabulary.
fn translate(event: Event) -> Option<TransportEvent> {
    match event {
        Event::Incoming(Packet::Publish(p)) => Some(TransportEvent::Message(Inbound {
            topic: p.topic,
            payload: p.payload.to_vec(),
        })),
        Event::Incoming(Packet::ConnAck(_)) => Some(TransportEvent::Connected),
        Event::Incoming(Packet::Disconnect) => Some(TransportEvent::Disconnected),
        _ => None,
    }
}

impl Transport for MqttTransport {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn reconnect(&mut self) -> bool {
        let limit = self.reconnect_timeout;
        let attempt = async {
            loop {
                match self.poll_once().await {
                    Ok(Some(TransportEvent::Connected)) => return true,
                    Ok(Some(TransportEvent::Message(m))) => self.pending.push_back(m),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt reconnect failed: {e:#}");
                        return false;
                    }
                }
            }
        };
        timeout(limit, attempt).await.unwrap_or(false)
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .with_context(|| format!("mqtt publish failed topic={topic}"))
    }

    async fn next_event(&mut self) -> Result<TransportEvent> {
        if let Some(m) = self.pending.pop_front() {
            return Ok(TransportEvent::Message(m));
        }
        loop {
            if let Some(event) = self.poll_once().await? {
                return Ok(event);
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("mqtt disconnect request failed: {e}");
            return;
        }
        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("mqtt shutdown timed out with publications still queued");
        }
        self.connected = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
