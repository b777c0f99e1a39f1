#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use huddle_protocol::{RelayFrame, parse_relay_frame};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::broadcaster::EventBroadcaster;

/// Cross-instance relay settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
	pub channel: String,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

/// Start the relay: a publisher task draining `publish_rx` into
/// `PUBLISH`, and a subscriber task holding one pub/sub connection for
/// the process lifetime, re-delivering inbound frames locally.
pub fn spawn_relay(
	url: &str,
	settings: RelaySettings,
	publish_rx: mpsc::Receiver<RelayFrame>,
	broadcaster: EventBroadcaster,
) -> anyhow::Result<()> {
	let client = redis::Client::open(url).context("open redis client")?;

	{
		let client = client.clone();
		let channel = settings.channel.clone();
		let min_delay = settings.reconnect_min_delay;
		tokio::spawn(run_publisher(client, channel, min_delay, publish_rx));
	}

	tokio::spawn(run_subscriber(client, settings, broadcaster));
	Ok(())
}

/// Relay-disabled mode: drain and discard outbound frames so publishers
/// never observe a closed channel. Single-instance deployments only.
pub fn spawn_null_relay(mut publish_rx: mpsc::Receiver<RelayFrame>) {
	info!("relay disabled (no redis url); running single-instance");
	tokio::spawn(async move { while publish_rx.recv().await.is_some() {} });
}

async fn run_publisher(
	client: redis::Client,
	channel: String,
	retry_delay: Duration,
	mut rx: mpsc::Receiver<RelayFrame>,
) {
	let mut conn = loop {
		match redis::aio::ConnectionManager::new(client.clone()).await {
			Ok(conn) => break conn,
			Err(e) => {
				error!(error = %e, "relay publisher failed to connect; retrying");
				tokio::time::sleep(retry_delay).await;
			}
		}
	};

	while let Some(frame) = rx.recv().await {
		let payload = match serde_json::to_string(&frame) {
			Ok(p) => p,
			Err(e) => {
				warn!(kind = frame.event.kind(), error = %e, "failed to serialize relay frame");
				continue;
			}
		};

		match conn.publish::<_, _, ()>(&channel, payload).await {
			Ok(()) => {}
			Err(e) => {
				metrics::counter!("huddle_server_relay_publish_errors_total").increment(1);
				warn!(error = %e, "relay publish failed");
			}
		}
	}

	info!("relay publisher exiting (channel closed)");
}

async fn run_subscriber(client: redis::Client, settings: RelaySettings, broadcaster: EventBroadcaster) {
	let mut delay = settings.reconnect_min_delay;

	loop {
		match subscribe_once(&client, &settings.channel, &broadcaster).await {
			Ok(()) => {
				// Connection was established and later dropped.
				delay = settings.reconnect_min_delay;
				warn!("relay subscription ended; reconnecting");
			}
			Err(e) => {
				warn!(error = %e, "relay subscription failed; reconnecting");
			}
		}

		tokio::time::sleep(delay).await;
		delay = (delay * 2).min(settings.reconnect_max_delay);
	}
}

async fn subscribe_once(client: &redis::Client, channel: &str, broadcaster: &EventBroadcaster) -> anyhow::Result<()> {
	let conn = client.get_async_connection().await.context("connect subscriber")?;
	let mut pubsub = conn.into_pubsub();
	pubsub.subscribe(channel).await.context("subscribe channel")?;
	info!(channel, "relay subscribed");

	let mut stream = pubsub.on_message();
	while let Some(msg) = stream.next().await {
		let payload: String = match msg.get_payload() {
			Ok(p) => p,
			Err(e) => {
				metrics::counter!("huddle_server_relay_dropped_total").increment(1);
				debug!(error = %e, "non-text relay payload dropped");
				continue;
			}
		};

		// A single bad message must never take down the relay loop.
		match parse_relay_frame(&payload) {
			Ok(frame) => broadcaster.deliver_inbound(frame).await,
			Err(e) => {
				metrics::counter!("huddle_server_relay_dropped_total").increment(1);
				debug!(error = %e, "malformed relay payload dropped");
			}
		}
	}

	Ok(())
}
