#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use huddle_server::config;
use huddle_server::server::broadcaster::EventBroadcaster;
use huddle_server::server::connection::ConnectionSettings;
use huddle_server::server::dispatcher::{CommandDispatcher, DispatcherSettings};
use huddle_server::server::http::{AppState, HealthState, build_router};
use huddle_server::server::jobs::{JobQueue, MemoryJobQueue, RedisJobQueue};
use huddle_server::server::registry::ConnectionRegistry;
use huddle_server::server::relay::{RelaySettings, spawn_null_relay, spawn_relay};
use huddle_server::server::room_index::RoomIndex;
use huddle_server::server::store::{ChatStore, MemoryChatStore, PgChatStore};
use huddle_server::server::watchdog::JobWatchdog;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: huddle_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: 127.0.0.1:8080 or [server].bind from config)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<String> {
	let mut bind_override = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind_override = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind_override
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,huddle_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("huddle_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_override = parse_args();

	let config_path = config::default_config_path()?;
	let cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let bind = bind_override.unwrap_or_else(|| cfg.server.bind.clone());
	let bind_addr: SocketAddr = bind.parse().with_context(|| format!("invalid bind address: {bind}"))?;

	let Some(auth_secret) = cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow::anyhow!(
			"no auth_hmac_secret configured (set [server].auth_hmac_secret or HUDDLE_AUTH_HMAC_SECRET)"
		));
	};

	let store: Arc<dyn ChatStore> = match cfg.store.database_url.as_deref() {
		Some(url) => {
			let store = PgChatStore::connect(url).await?;
			info!("connected to postgres store");
			Arc::new(store)
		}
		None => {
			warn!("no database_url configured; using in-memory store (dev only)");
			Arc::new(MemoryChatStore::new())
		}
	};

	// Stable per-process id used as the relay origin tag.
	let instance_id = uuid::Uuid::new_v4().to_string();
	info!(instance_id = %instance_id, "room event hub starting");

	let registry = ConnectionRegistry::new();
	let index = RoomIndex::new();
	let watchdog = JobWatchdog::new(cfg.agent.job_timeout);

	let (relay_tx, relay_rx) = mpsc::channel(cfg.redis.publish_queue_capacity);
	let broadcaster = EventBroadcaster::new(registry.clone(), index.clone(), relay_tx, instance_id, watchdog.clone());

	tokio::spawn(watchdog.clone().run(broadcaster.clone()));

	let jobs: Arc<dyn JobQueue> = match cfg.redis.url.as_deref() {
		Some(url) => {
			spawn_relay(
				url,
				RelaySettings {
					channel: cfg.redis.pubsub_channel.clone(),
					reconnect_min_delay: cfg.redis.reconnect_min_delay,
					reconnect_max_delay: cfg.redis.reconnect_max_delay,
				},
				relay_rx,
				broadcaster.clone(),
			)?;
			Arc::new(RedisJobQueue::connect(url, cfg.redis.queue_name.clone()).await?)
		}
		None => {
			spawn_null_relay(relay_rx);
			warn!("no redis url configured; agent jobs queue in-memory and are never consumed");
			Arc::new(MemoryJobQueue::new())
		}
	};

	let dispatcher = CommandDispatcher::new(
		Arc::clone(&store),
		registry.clone(),
		index.clone(),
		broadcaster,
		jobs,
		watchdog,
		DispatcherSettings {
			agent_trigger_prefix: cfg.agent.trigger_prefix.clone(),
		},
	);

	let conn_settings = ConnectionSettings {
		max_frame_bytes: cfg.server.max_frame_bytes,
		outbound_queue_capacity: cfg.server.outbound_queue_capacity,
	};

	let health = HealthState::new();
	let state = Arc::new(AppState::new(
		dispatcher,
		registry,
		index,
		store,
		auth_secret,
		conn_settings,
		health.clone(),
	));

	let app = build_router(state);
	let listener = tokio::net::TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;

	health.mark_ready();
	info!(bind = %bind_addr, "websocket endpoint ready at /ws");

	axum::serve(listener, app).await.context("serve")?;

	Ok(())
}
