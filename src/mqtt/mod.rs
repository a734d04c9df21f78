//! Per-mock MQTT brokers.
//!
//! A broker serves every MQTT mock declared on its port (topics of multiple
//! mocks merge). It keeps the retained-message map and the subscription
//! table; QoS 2 publishes complete the PUBREC/PUBREL/PUBCOMP handshake but
//! delivery is at-least-once. A subscription that matches a retained topic
//! sees the retained message before any later live publish on that topic.

pub mod codec;

use crate::engine::AppState;
use crate::matching::{topic_matches, RequestSnapshot};
use crate::metrics;
use crate::mock::{
    MockSpec, MockType, MqttAclRule, MqttSpec, MqttTopicConfig, MqttUser,
};
use crate::requestlog::ResponseSummary;
use crate::template::{render_str, Context};
use bytes::Bytes;
use codec::{read_packet, write_packet, CodecError, Packet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Message queued for delivery to one subscriber.
#[derive(Debug, Clone)]
struct Outbound {
    topic: String,
    payload: Bytes,
    qos: u8,
    retain: bool,
}

struct Subscription {
    session_id: u64,
    filter: String,
    qos: u8,
    tx: mpsc::Sender<Outbound>,
}

/// Broker state for one port.
pub struct Broker {
    port: u16,
    state: Arc<AppState>,
    retained: Mutex<std::collections::HashMap<String, (Bytes, u8)>>,
    subscriptions: Mutex<Vec<Subscription>>,
    script_tasks: Mutex<Vec<JoinHandle<()>>>,
    next_session: AtomicU64,
}

impl Broker {
    pub fn new(port: u16, state: Arc<AppState>) -> Self {
        Self {
            port,
            state,
            retained: Mutex::new(std::collections::HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            script_tasks: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Every MQTT spec merged onto this port, newest registry view.
    fn specs(&self) -> Vec<(String, MqttSpec)> {
        self.state
            .registry
            .snapshot(MockType::Mqtt)
            .iter()
            .filter(|m| m.enabled)
            .filter_map(|m| match &m.spec {
                MockSpec::Mqtt(spec) if spec.port == self.port => {
                    Some((m.id.clone(), spec.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn users(&self) -> (bool, Vec<MqttUser>) {
        let mut enabled = false;
        let mut users = Vec::new();
        for (_, spec) in self.specs() {
            if let Some(auth) = spec.auth {
                enabled = enabled || auth.enabled;
                users.extend(auth.users);
            }
        }
        (enabled, users)
    }

    fn topic_config(&self, topic: &str) -> Option<(String, MqttTopicConfig)> {
        for (mock_id, spec) in self.specs() {
            for config in spec.topics {
                if topic_matches(&config.topic, topic) {
                    return Some((mock_id, config));
                }
            }
        }
        None
    }

    /// Publish a message: update the retained map, then fan out to every
    /// matching subscription at min(publish QoS, subscription QoS).
    pub fn publish(&self, topic: &str, payload: Bytes, qos: u8, retain: bool) {
        if retain {
            let mut retained = self.retained.lock();
            if payload.is_empty() {
                retained.remove(topic);
            } else {
                retained.insert(topic.to_string(), (payload.clone(), qos));
            }
        }
        if payload.is_empty() && retain {
            return;
        }

        let subscriptions = self.subscriptions.lock();
        for sub in subscriptions.iter() {
            if topic_matches(&sub.filter, topic) {
                let message = Outbound {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    qos: qos.min(sub.qos),
                    retain: false,
                };
                // A slow subscriber drops messages rather than stalling the
                // publisher.
                if sub.tx.try_send(message).is_err() {
                    debug!("subscriber queue full, dropping message on {topic}");
                }
            }
        }
    }

    /// Register a subscription and queue matching retained messages onto its
    /// channel. Both happen under the subscription lock, so a concurrent
    /// publish either fans out after the retained queueing (FIFO per
    /// channel) or completed before and is already in the retained map.
    fn subscribe(&self, session_id: u64, filter: &str, qos: u8, tx: mpsc::Sender<Outbound>) {
        let mut subscriptions = self.subscriptions.lock();
        let retained = self.retained.lock();
        for (topic, (payload, retained_qos)) in retained.iter() {
            if topic_matches(filter, topic) {
                let _ = tx.try_send(Outbound {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    qos: (*retained_qos).min(qos),
                    retain: true,
                });
            }
        }
        subscriptions.push(Subscription {
            session_id,
            filter: filter.to_string(),
            qos,
            tx,
        });
    }

    fn unsubscribe(&self, session_id: u64, filter: &str) {
        self.subscriptions
            .lock()
            .retain(|s| !(s.session_id == session_id && s.filter == filter));
    }

    fn drop_session(&self, session_id: u64) {
        self.subscriptions
            .lock()
            .retain(|s| s.session_id != session_id);
    }

    /// Launch the configured topic scripts (broker-originated messages).
    pub fn start_topic_scripts(self: &Arc<Self>) {
        let mut tasks = self.script_tasks.lock();
        for (mock_id, spec) in self.specs() {
            for topic in spec.topics {
                if topic.messages.is_empty() || topic.topic.contains('+') || topic.topic.contains('#')
                {
                    continue;
                }
                let broker = Arc::clone(self);
                let mock_id = mock_id.clone();
                tasks.push(tokio::spawn(async move {
                    broker.run_topic_script(&mock_id, &topic).await;
                }));
            }
        }
    }

    async fn run_topic_script(self: &Arc<Self>, mock_id: &str, config: &MqttTopicConfig) {
        let render = |payload: &str| {
            let snapshot = RequestSnapshot {
                path: config.topic.clone(),
                ..Default::default()
            };
            let ctx = Context {
                request: Some(&snapshot),
                mock_id,
                state: Some(&self.state.state),
                sequences: Some(&self.state.sequences),
                ..Default::default()
            };
            Bytes::from(render_str(payload, &ctx))
        };

        for message in &config.messages {
            if message.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(message.delay_ms)).await;
            }
            self.publish(&config.topic, render(&message.payload), config.qos, config.retain);

            if message.repeat && message.interval_ms > 0 {
                loop {
                    tokio::time::sleep(Duration::from_millis(message.interval_ms)).await;
                    self.publish(
                        &config.topic,
                        render(&message.payload),
                        config.qos,
                        config.retain,
                    );
                }
            }
        }
    }

    /// Stop the broker's own tasks. Called outside any broker lock: the
    /// script tasks re-enter `publish`, which takes those locks.
    pub fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.script_tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

/// Accept loop for one broker port.
pub async fn serve(
    listener: std::net::TcpListener,
    broker: Arc<Broker>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            error!("MQTT listener on :{} failed to register: {e}", broker.port);
            return;
        }
    };

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let broker = Arc::clone(&broker);
                        tokio::spawn(async move {
                            if let Err(e) = run_session(stream, broker).await {
                                debug!("MQTT session from {addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => error!("MQTT accept error: {e}"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn run_session(stream: TcpStream, broker: Arc<Broker>) -> Result<(), CodecError> {
    let (mut reader, mut writer) = stream.into_split();

    // Session starts with CONNECT.
    let Some(Packet::Connect {
        client_id,
        username,
        password,
        ..
    }) = read_packet(&mut reader).await?
    else {
        return Err(CodecError::Malformed("expected CONNECT"));
    };

    let (auth_enabled, users) = broker.users();
    let user = if auth_enabled {
        let found = users.iter().find(|u| {
            Some(u.username.as_str()) == username.as_deref()
                && Some(u.password.as_str()) == password.as_deref()
        });
        match found {
            Some(user) => {
                let user = user.clone();
                write_packet(
                    &mut writer,
                    &Packet::ConnAck {
                        session_present: false,
                        code: codec::CONNACK_ACCEPTED,
                    },
                )
                .await?;
                Some(user)
            }
            None => {
                write_packet(
                    &mut writer,
                    &Packet::ConnAck {
                        session_present: false,
                        code: codec::CONNACK_BAD_CREDENTIALS,
                    },
                )
                .await?;
                return Ok(());
            }
        }
    } else {
        write_packet(
            &mut writer,
            &Packet::ConnAck {
                session_present: false,
                code: codec::CONNACK_ACCEPTED,
            },
        )
        .await?;
        None
    };

    info!("MQTT client {client_id} connected on :{}", broker.port);
    metrics::ACTIVE_STREAMS.inc();

    let session_id = broker.next_session.fetch_add(1, Ordering::Relaxed);
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);

    // Outbound publishes flow on their own task so the read loop never races
    // a half-read packet against a pending delivery. Both sides share the
    // write half through a mutex.
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let forwarder_writer = Arc::clone(&writer);
    let forwarder = tokio::spawn(async move {
        let mut next_packet_id: u16 = 1;
        while let Some(message) = out_rx.recv().await {
            let packet_id = if message.qos > 0 {
                let id = next_packet_id;
                next_packet_id = next_packet_id.wrapping_add(1).max(1);
                Some(id)
            } else {
                None
            };
            let packet = Packet::Publish {
                topic: message.topic,
                payload: message.payload,
                qos: message.qos,
                retain: message.retain,
                dup: false,
                packet_id,
            };
            let mut w = forwarder_writer.lock().await;
            if write_packet(&mut *w, &packet).await.is_err() {
                break;
            }
        }
    });

    let result: Result<(), CodecError> = loop {
        match read_packet(&mut reader).await {
            Ok(Some(packet)) => {
                match handle_packet(
                    packet,
                    &broker,
                    &client_id,
                    session_id,
                    user.as_ref(),
                    &out_tx,
                    &writer,
                )
                .await
                {
                    Ok(true) => break Ok(()),
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    broker.drop_session(session_id);
    drop(out_tx);
    forwarder.abort();
    metrics::ACTIVE_STREAMS.dec();
    info!("MQTT client {client_id} disconnected");
    result
}

/// Handle one inbound packet; returns true when the session should end.
async fn handle_packet<W: AsyncWrite + Unpin>(
    packet: Packet,
    broker: &Arc<Broker>,
    client_id: &str,
    session_id: u64,
    user: Option<&MqttUser>,
    out_tx: &mpsc::Sender<Outbound>,
    writer: &Arc<tokio::sync::Mutex<W>>,
) -> Result<bool, CodecError> {
    match packet {
        Packet::Publish {
            topic,
            payload,
            qos,
            retain,
            packet_id,
            ..
        } => {
            if let Some(user) = user {
                if !acl_allows(&user.acl, &topic, AclAccess::Write) {
                    warn!("client {client_id} denied publish to {topic}");
                    // 3.1.1 has no PUBLISH NACK; acknowledge and drop.
                    ack_publish(writer, qos, packet_id).await?;
                    return Ok(false);
                }
            }

            ack_publish(writer, qos, packet_id).await?;

            let snapshot = RequestSnapshot {
                method: "PUBLISH".to_string(),
                path: topic.clone(),
                body: String::from_utf8_lossy(&payload).to_string(),
                ..Default::default()
            };

            let matched = broker.topic_config(&topic);
            metrics::record_request("mqtt", matched.is_some());
            broker.state.request_log.push(
                MockType::Mqtt,
                &snapshot,
                matched.as_ref().map(|(id, _)| id.as_str()),
                ResponseSummary {
                    status_code: 0,
                    ..Default::default()
                },
                Vec::new(),
            );

            broker.publish(&topic, payload.clone(), qos, retain);

            // onPublish handlers: canned response and/or forward.
            if let Some((mock_id, config)) = matched {
                broker.state.verification.record(&mock_id, &snapshot);
                if let Some(handler) = &config.on_publish {
                    if let Some(response) = &handler.response {
                        let ctx = Context {
                            request: Some(&snapshot),
                            mock_id: &mock_id,
                            state: Some(&broker.state.state),
                            sequences: Some(&broker.state.sequences),
                            ..Default::default()
                        };
                        let rendered = Bytes::from(render_str(&response.payload, &ctx));
                        let target = if handler.response_topic.is_empty() {
                            topic.clone()
                        } else {
                            handler.response_topic.clone()
                        };
                        let broker = Arc::clone(broker);
                        let delay = response.delay_ms;
                        tokio::spawn(async move {
                            if delay > 0 {
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                            }
                            broker.publish(&target, rendered, config.qos, false);
                        });
                    }
                    if !handler.forward.is_empty() {
                        broker.publish(&handler.forward, payload, qos, false);
                    }
                }
            }
            Ok(false)
        }
        Packet::PubRel(id) => {
            // QoS 2 handshake completion; delivery already happened
            // (at-least-once).
            write_packet(&mut *writer.lock().await, &Packet::PubComp(id)).await?;
            Ok(false)
        }
        Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => Ok(false),
        Packet::Subscribe { packet_id, filters } => {
            let mut codes = Vec::with_capacity(filters.len());
            for (filter, qos) in &filters {
                let valid = crate::mock::validate_topic_filter(filter).is_ok();
                let allowed = user
                    .map(|u| acl_allows(&u.acl, filter, AclAccess::Read))
                    .unwrap_or(true);
                if valid && allowed {
                    broker.subscribe(session_id, filter, *qos, out_tx.clone());
                    codes.push(*qos);
                } else {
                    codes.push(codec::SUBACK_FAILURE);
                }
            }
            write_packet(&mut *writer.lock().await, &Packet::SubAck { packet_id, codes }).await?;
            Ok(false)
        }
        Packet::Unsubscribe { packet_id, filters } => {
            for filter in &filters {
                broker.unsubscribe(session_id, filter);
            }
            write_packet(&mut *writer.lock().await, &Packet::UnsubAck(packet_id)).await?;
            Ok(false)
        }
        Packet::PingReq => {
            write_packet(&mut *writer.lock().await, &Packet::PingResp).await?;
            Ok(false)
        }
        Packet::Disconnect => Ok(true),
        other => {
            debug!("ignoring unexpected packet {other:?}");
            Ok(false)
        }
    }
}

async fn ack_publish<W: AsyncWrite + Unpin>(
    writer: &Arc<tokio::sync::Mutex<W>>,
    qos: u8,
    packet_id: Option<u16>,
) -> Result<(), CodecError> {
    let mut w = writer.lock().await;
    match (qos, packet_id) {
        (1, Some(id)) => write_packet(&mut *w, &Packet::PubAck(id)).await,
        (2, Some(id)) => write_packet(&mut *w, &Packet::PubRec(id)).await,
        _ => Ok(()),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum AclAccess {
    Read,
    Write,
}

/// Empty ACL lists allow everything; otherwise the topic must match a rule
/// granting the requested access.
fn acl_allows(rules: &[MqttAclRule], topic: &str, access: AclAccess) -> bool {
    if rules.is_empty() {
        return true;
    }
    rules.iter().any(|rule| {
        let grants = match rule.access.as_str() {
            "read" => access == AclAccess::Read,
            "write" => access == AclAccess::Write,
            "readwrite" => true,
            _ => false,
        };
        grants && topic_matches(&rule.topic, topic)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use crate::engine::Engine;

    fn test_broker_with_mock(mock: serde_json::Value) -> Arc<Broker> {
        let engine = Engine::new(ServerOptions::default());
        let mock: crate::mock::Mock = serde_json::from_value(mock).unwrap();
        engine.state.registry.insert(mock).unwrap();
        Arc::new(Broker::new(1883, Arc::clone(&engine.state)))
    }

    fn broker() -> Arc<Broker> {
        test_broker_with_mock(serde_json::json!({
            "id": "b1",
            "type": "mqtt",
            "mqtt": {
                "port": 1883,
                "topics": [{"topic": "devices/#"}]
            }
        }))
    }

    #[tokio::test]
    async fn retained_message_delivered_before_live_publish() {
        let broker = broker();
        broker.publish("devices/status", Bytes::from_static(b"online"), 1, true);

        let (tx, mut rx) = mpsc::channel(8);
        broker.subscribe(1, "devices/#", 0, tx);
        broker.publish("devices/status", Bytes::from_static(b"later"), 0, false);

        let first = rx.recv().await.unwrap();
        assert_eq!(&first.payload[..], b"online");
        assert!(first.retain);
        let second = rx.recv().await.unwrap();
        assert_eq!(&second.payload[..], b"later");
    }

    #[tokio::test]
    async fn empty_retained_publish_clears() {
        let broker = broker();
        broker.publish("devices/status", Bytes::from_static(b"online"), 0, true);
        broker.publish("devices/status", Bytes::new(), 0, true);

        let (tx, mut rx) = mpsc::channel(8);
        broker.subscribe(1, "devices/#", 0, tx);
        // Nothing retained: channel stays empty.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn qos_downgrades_to_subscription_level() {
        let broker = broker();
        let (tx, mut rx) = mpsc::channel(8);
        broker.subscribe(1, "devices/#", 0, tx);
        broker.publish("devices/a", Bytes::from_static(b"x"), 2, false);
        let message = rx.recv().await.unwrap();
        assert_eq!(message.qos, 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = broker();
        let (tx, mut rx) = mpsc::channel(8);
        broker.subscribe(9, "devices/#", 0, tx);
        broker.unsubscribe(9, "devices/#");
        broker.publish("devices/a", Bytes::from_static(b"x"), 0, false);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn acl_rules() {
        let rules: Vec<MqttAclRule> = serde_json::from_value(serde_json::json!([
            {"topic": "devices/#", "access": "read"},
            {"topic": "commands/+", "access": "readwrite"}
        ]))
        .unwrap();
        assert!(acl_allows(&rules, "devices/d1", AclAccess::Read));
        assert!(!acl_allows(&rules, "devices/d1", AclAccess::Write));
        assert!(acl_allows(&rules, "commands/go", AclAccess::Write));
        assert!(!acl_allows(&rules, "other", AclAccess::Read));
        assert!(acl_allows(&[], "anything", AclAccess::Write));
    }

    #[test]
    fn topic_config_merges_across_mocks() {
        let broker = broker();
        let second: crate::mock::Mock = serde_json::from_value(serde_json::json!({
            "id": "b2",
            "type": "mqtt",
            "mqtt": {"port": 1883, "topics": [{"topic": "sensors/+"}]}
        }))
        .unwrap();
        broker.state.registry.insert(second).unwrap();

        assert_eq!(broker.topic_config("devices/d1").unwrap().0, "b1");
        assert_eq!(broker.topic_config("sensors/s1").unwrap().0, "b2");
        assert!(broker.topic_config("other/x").is_none());
    }
}
