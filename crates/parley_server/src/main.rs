#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use parley_server::config;
use parley_server::server::broadcast::Broadcaster;
use parley_server::server::connection::ws_handler;
use parley_server::server::directory::{Directory, SqlDirectory};
use parley_server::server::health::{HealthState, healthz, readyz};
use parley_server::server::presence::PresenceTracker;
use parley_server::server::room_hub::{RoomHub, RoomHubConfig};
use parley_server::server::router::EventRouter;
use parley_server::server::state::AppState;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Bind address (default: 127.0.0.1:18210)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind = "127.0.0.1:18210".to_string();

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
				bind = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind.parse::<SocketAddr>().unwrap_or_else(|e| {
		eprintln!("invalid --bind address {bind:?}: {e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("parley_server");
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

	match bind.parse::<std::net::SocketAddr>() {
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

	let bind_addr = parse_args();

	let config_path = config::default_config_path()?;
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let Some(auth_hmac_secret) = server_cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow::anyhow!(
			"auth_hmac_secret must be configured (config [server] or PARLEY_AUTH_HMAC_SECRET)"
		));
	};

	let directory: Arc<dyn Directory> = match server_cfg.persistence.database_url.as_deref() {
		Some(database_url) => Arc::new(SqlDirectory::connect(database_url).await?),
		None => {
			warn!("no database_url configured; membership directory disabled (all joins will be denied)");
			Arc::new(SqlDirectory::disabled())
		}
	};

	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: server_cfg.server.subscriber_queue_capacity,
		debug_logs: server_cfg.server.debug_logs,
	});
	let presence = PresenceTracker::new();
	let router = EventRouter::new(hub.clone(), Arc::clone(&directory), server_cfg.server.debug_logs);

	// The one broadcaster handle: the HTTP write path receives this at
	// startup instead of probing ambient global state.
	let broadcaster = Broadcaster::new(hub.clone());

	let health = HealthState::new();
	let state = Arc::new(AppState::new(
		hub,
		presence,
		directory,
		router,
		broadcaster,
		health.clone(),
		auth_hmac_secret,
	));

	let app = Router::new()
		.route("/ws", get(ws_handler))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.with_state(state);

	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	health.mark_ready();
	info!(bind = %bind_addr, "parley_server: websocket endpoint ready");

	axum::serve(listener, app).await?;

	Ok(())
}
