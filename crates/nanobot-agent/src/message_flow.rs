//! Inbound lane routing, the debounced busy notice, and error fallback
//! routing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use nanobot_bus::MessageBus;
use nanobot_core::types::{InboundMessage, OutboundMessage};
use nanobot_process::{CommandLane, CommandQueue};

pub struct MessageFlowCoordinator {
    busy_notice_threshold: usize,
    busy_notice_debounce: Duration,
    error_fallback_channel: String,
    error_fallback_chat_id: String,
    bus: Arc<MessageBus>,
    // One shared timestamp across all lanes, deliberately not per-lane.
    last_busy_notice: Mutex<Option<Instant>>,
}

impl MessageFlowCoordinator {
    pub fn new(
        busy_notice_threshold: usize,
        busy_notice_debounce_seconds: f64,
        error_fallback_channel: &str,
        error_fallback_chat_id: &str,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            busy_notice_threshold,
            busy_notice_debounce: Duration::from_secs_f64(busy_notice_debounce_seconds.max(0.0)),
            error_fallback_channel: error_fallback_channel.to_string(),
            error_fallback_chat_id: error_fallback_chat_id.to_string(),
            bus,
            last_busy_notice: Mutex::new(None),
        }
    }

    /// System-channel traffic runs in the background lane, everything else
    /// on main.
    pub fn lane_for(&self, msg: &InboundMessage) -> CommandLane {
        if msg.channel == "system" {
            CommandLane::Background
        } else {
            CommandLane::Main
        }
    }

    /// Send one debounced busy notice when the main lane is already loaded.
    pub async fn maybe_send_busy_notice(
        &self,
        msg: &InboundMessage,
        lane: CommandLane,
        queue: &CommandQueue,
    ) {
        if lane != CommandLane::Main {
            return;
        }
        let snapshot = queue.snapshot(lane);
        if snapshot.active + snapshot.queued < self.busy_notice_threshold {
            return;
        }

        {
            let mut last = self.last_busy_notice.lock().expect("busy notice poisoned");
            if let Some(at) = *last {
                if at.elapsed() <= self.busy_notice_debounce {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        self.bus
            .publish_outbound(
                OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    "老板，我正在全力处理您之前的指令，请稍等片刻，新指令已加入队列。",
                ),
                Duration::from_secs(10),
            )
            .await;
    }

    /// Route a processing error back to where the request came from, with a
    /// configured fallback for system messages without an origin.
    pub fn build_error_outbound(&self, msg: &InboundMessage, error: &str) -> OutboundMessage {
        let origin = msg.metadata.get("origin").and_then(Value::as_object);
        let (fallback_channel, fallback_chat_id) = if let Some((channel, chat_id)) =
            msg.chat_id.split_once(':')
        {
            (channel.to_string(), chat_id.to_string())
        } else if msg.channel == "system" {
            (
                self.error_fallback_channel.clone(),
                self.error_fallback_chat_id.clone(),
            )
        } else {
            (msg.channel.clone(), msg.chat_id.clone())
        };

        let channel = origin
            .and_then(|o| o.get("channel"))
            .and_then(Value::as_str)
            .unwrap_or(&fallback_channel)
            .to_string();
        let chat_id = origin
            .and_then(|o| o.get("chat_id"))
            .and_then(Value::as_str)
            .unwrap_or(&fallback_chat_id)
            .to_string();

        let mut outbound = OutboundMessage::new(
            channel,
            chat_id,
            format!("抱歉，我在处理指令时遇到了错误: {error}"),
        );
        outbound.trace_id = msg.trace_id.clone();
        outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn coordinator(bus: Arc<MessageBus>) -> MessageFlowCoordinator {
        MessageFlowCoordinator::new(1, 30.0, "cli", "direct", bus)
    }

    #[test]
    fn system_channel_routes_to_background() {
        let bus = Arc::new(MessageBus::new(4));
        let flow = coordinator(bus);
        let system = InboundMessage::new("system", "cron", "x", "y");
        let user = InboundMessage::new("telegram", "u", "42", "hi");
        assert_eq!(flow.lane_for(&system), CommandLane::Background);
        assert_eq!(flow.lane_for(&user), CommandLane::Main);
    }

    #[tokio::test]
    async fn busy_notice_fires_once_per_window() {
        let bus = Arc::new(MessageBus::new(8));
        let flow = coordinator(bus.clone());
        let queue = CommandQueue::new();

        // Occupy the main lane so the threshold (1) is met.
        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(CommandLane::Main, async {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                    })
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let msg = InboundMessage::new("telegram", "u", "42", "hi");
        flow.maybe_send_busy_notice(&msg, CommandLane::Main, &queue).await;
        flow.maybe_send_busy_notice(&msg, CommandLane::Main, &queue).await;
        assert_eq!(bus.outbound_size(), 1);
        blocker.await.unwrap();
    }

    #[test]
    fn error_routing_prefers_metadata_origin() {
        let bus = Arc::new(MessageBus::new(4));
        let flow = coordinator(bus);
        let mut msg = InboundMessage::new("system", "cron", "direct", "x");
        msg.metadata.insert(
            "origin".into(),
            json!({"channel": "telegram", "chat_id": "12345"}),
        );
        let out = flow.build_error_outbound(&msg, "boom");
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.chat_id, "12345");
        assert!(out.content.contains("boom"));
    }

    #[test]
    fn system_without_origin_uses_configured_fallback() {
        let bus = Arc::new(MessageBus::new(4));
        let flow = coordinator(bus);
        let msg = InboundMessage::new("system", "cron", "direct", "x");
        let out = flow.build_error_outbound(&msg, "boom");
        assert_eq!(out.channel, "cli");
        assert_eq!(out.chat_id, "direct");
    }
}
