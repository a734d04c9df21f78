//! Server-Sent Events delivery: renders the configured event list (or
//! generator) into a plan up front, then emits on a dedicated task with the
//! configured cadence. Dropping the response body cancels emission at the
//! next send.

use crate::matching::RequestSnapshot;
use crate::metrics;
use crate::mock::{SseEvent, SseSpec};
use crate::template::{render_json, render_str, Context};
use bytes::Bytes;
use hyper::body::Frame;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// One fully rendered event, ready for the wire.
#[derive(Debug, Clone)]
pub struct PlannedEvent {
    pub event_type: String,
    pub id: String,
    pub retry: u64,
    pub data: String,
    /// Delay before this event; already resolved from the timing config.
    pub delay_ms: u64,
}

/// The complete emission plan for one stream.
#[derive(Debug, Clone)]
pub struct EmissionPlan {
    pub initial_delay_ms: u64,
    pub keepalive_ms: u64,
    pub events: Vec<PlannedEvent>,
}

/// Render the spec's events against the request context and resolve timing.
pub fn build_plan(spec: &SseSpec, snapshot: &RequestSnapshot, ctx: &Context<'_>) -> EmissionPlan {
    let mut source: Vec<SseEvent> = spec.events.clone();

    if let Some(generator) = &spec.generator {
        match generator.kind.as_str() {
            "sequence" => {
                if let Some(seq) = &generator.sequence {
                    let count = generator.count.max(1);
                    for i in 0..count {
                        let value = seq.start + seq.increment * i as i64;
                        let data = if seq.format.is_empty() {
                            value.to_string()
                        } else {
                            seq.format.replace("%d", &value.to_string())
                        };
                        source.push(SseEvent {
                            data: serde_json::Value::String(data),
                            ..Default::default()
                        });
                    }
                }
            }
            "template" => {
                if let Some(tpl) = &generator.template {
                    for _ in 0..tpl.repeat.max(1) {
                        source.extend(tpl.events.iter().cloned());
                    }
                }
            }
            other => debug!("unknown SSE generator kind {other:?}, ignoring"),
        }
    }

    // Last-Event-ID resume: skip everything up to and including the
    // acknowledged id.
    if spec.resume.enabled {
        if let Some(last_id) = snapshot.header("last-event-id") {
            if let Some(pos) = source.iter().position(|e| e.id == last_id) {
                source.drain(..=pos);
            }
        }
    }

    if spec.lifecycle.max_events > 0 {
        source.truncate(spec.lifecycle.max_events as usize);
    }

    let mut rng = rand::thread_rng();
    let events = source
        .iter()
        .enumerate()
        .map(|(i, event)| {
            let data = match &event.data {
                serde_json::Value::String(s) => render_str(s, ctx),
                other => render_json(other, ctx).to_string(),
            };
            PlannedEvent {
                event_type: render_str(&event.event_type, ctx),
                id: render_str(&event.id, ctx),
                retry: event.retry,
                data,
                delay_ms: resolve_delay(spec, event, i, &mut rng),
            }
        })
        .collect();

    EmissionPlan {
        initial_delay_ms: spec.timing.initial_delay,
        keepalive_ms: spec.lifecycle.keepalive_interval,
        events,
    }
}

/// Delay precedence: explicit per-event > perEventDelays list > burst
/// pattern > random range > fixed cadence.
fn resolve_delay(spec: &SseSpec, event: &SseEvent, index: usize, rng: &mut impl Rng) -> u64 {
    if let Some(delay) = event.delay {
        return delay;
    }
    if let Some(delay) = spec.timing.per_event_delays.get(index) {
        return *delay;
    }
    if let Some(burst) = &spec.timing.burst {
        let count = burst.count.max(1);
        return if index == 0 {
            0
        } else if index % count == 0 {
            burst.pause
        } else {
            burst.interval
        };
    }
    if let Some(random) = &spec.timing.random_delay {
        if random.max > random.min {
            return rng.gen_range(random.min..=random.max);
        }
        return random.min;
    }
    spec.timing.fixed_delay.unwrap_or(1000)
}

/// Wire format for one event.
pub fn format_event(event: &PlannedEvent) -> String {
    let mut out = String::new();
    if !event.event_type.is_empty() {
        out.push_str("event: ");
        out.push_str(&event.event_type);
        out.push('\n');
    }
    if !event.id.is_empty() {
        out.push_str("id: ");
        out.push_str(&event.id);
        out.push('\n');
    }
    if event.retry > 0 {
        out.push_str(&format!("retry: {}\n", event.retry));
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Emit the plan into the response body channel. Ends when the list is
/// exhausted or the client disconnects (channel closed). Keepalive comments
/// flow on the same channel between events.
pub async fn emit(plan: EmissionPlan, tx: mpsc::Sender<Frame<Bytes>>) {
    metrics::ACTIVE_STREAMS.inc();

    let keepalive = if plan.keepalive_ms > 0 {
        let tx = tx.clone();
        let interval = Duration::from_millis(plan.keepalive_ms);
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if tx
                    .send(Frame::data(Bytes::from_static(b": keepalive\n\n")))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }))
    } else {
        None
    };

    if plan.initial_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(plan.initial_delay_ms)).await;
    }

    for event in &plan.events {
        if event.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(event.delay_ms)).await;
        }
        let frame = Frame::data(Bytes::from(format_event(event)));
        if tx.send(frame).await.is_err() {
            // Client went away; stop producing.
            break;
        }
    }

    if let Some(task) = keepalive {
        task.abort();
    }
    metrics::ACTIVE_STREAMS.dec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> SseSpec {
        serde_json::from_value(value).unwrap()
    }

    fn plan_for(value: serde_json::Value) -> EmissionPlan {
        let spec = spec(value);
        let snapshot = RequestSnapshot::default();
        let ctx = Context::default();
        build_plan(&spec, &snapshot, &ctx)
    }

    #[test]
    fn event_list_renders_in_order() {
        let plan = plan_for(json!({
            "matcher": {"path": "/events"},
            "events": [
                {"type": "greet", "data": "hello", "id": "1"},
                {"data": {"n": 2}}
            ],
            "timing": {"fixedDelay": 10}
        }));
        assert_eq!(plan.events.len(), 2);
        assert_eq!(plan.events[0].data, "hello");
        assert_eq!(plan.events[1].data, r#"{"n":2}"#);
        assert_eq!(plan.events[0].delay_ms, 10);
    }

    #[test]
    fn max_events_truncates() {
        let plan = plan_for(json!({
            "matcher": {"path": "/events"},
            "generator": {"type": "sequence", "count": 100,
                          "sequence": {"start": 0, "increment": 1}},
            "lifecycle": {"maxEvents": 5}
        }));
        assert_eq!(plan.events.len(), 5);
        assert_eq!(plan.events[4].data, "4");
    }

    #[test]
    fn sequence_generator_formats() {
        let plan = plan_for(json!({
            "matcher": {"path": "/events"},
            "generator": {"type": "sequence", "count": 3,
                          "sequence": {"start": 10, "increment": 5, "format": "tick-%d"}}
        }));
        let data: Vec<&str> = plan.events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["tick-10", "tick-15", "tick-20"]);
    }

    #[test]
    fn resume_skips_acknowledged_events() {
        let spec = spec(json!({
            "matcher": {"path": "/events"},
            "events": [
                {"data": "a", "id": "1"},
                {"data": "b", "id": "2"},
                {"data": "c", "id": "3"}
            ],
            "resume": {"enabled": true}
        }));
        let snapshot = RequestSnapshot {
            headers: [("last-event-id".to_string(), "2".to_string())].into(),
            ..Default::default()
        };
        let plan = build_plan(&spec, &snapshot, &Context::default());
        assert_eq!(plan.events.len(), 1);
        assert_eq!(plan.events[0].data, "c");
    }

    #[test]
    fn wire_format_is_valid_sse() {
        let event = PlannedEvent {
            event_type: "update".into(),
            id: "7".into(),
            retry: 3000,
            data: "line1\nline2".into(),
            delay_ms: 0,
        };
        assert_eq!(
            format_event(&event),
            "event: update\nid: 7\nretry: 3000\ndata: line1\ndata: line2\n\n"
        );
    }

    #[tokio::test]
    async fn emit_closes_after_list_exhausts() {
        let plan = EmissionPlan {
            initial_delay_ms: 0,
            keepalive_ms: 0,
            events: vec![PlannedEvent {
                event_type: String::new(),
                id: String::new(),
                retry: 0,
                data: "only".into(),
                delay_ms: 0,
            }],
        };
        let (tx, mut rx) = mpsc::channel(4);
        emit(plan, tx).await;
        let frame = rx.recv().await.unwrap();
        let data = frame.into_data().unwrap();
        assert_eq!(&data[..], b"data: only\n\n");
        // Channel closed: the stream terminates rather than hanging.
        assert!(rx.recv().await.is_none());
    }
}
