#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::HubConfig;
use crate::server::admin::{AdminState, spawn_admin_server};
use crate::server::auth::{IdentityVerifier, TokenVerifier};
use crate::server::dispatch::Dispatcher;
use crate::server::handshake::{HubContext, serve};
use crate::server::notify::{LogDispatcher, Notifier, StaticDirectory};
use crate::server::registry::spawn_registry;
use crate::server::router::{Router, RouterConfig};
use crate::server::store::{DisabledStore, MessageStore, SqlMessageStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: errand_hub [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     WebSocket bind address (default: 127.0.0.1:18400)\n\
\t--config   Config file (default: ~/.errand/hub.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct CliArgs {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs::default();

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
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,errand_hub=debug".to_string());

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
				let tracer = tracer_provider.tracer("errand_hub");
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

async fn build_store(cfg: &HubConfig) -> anyhow::Result<Arc<dyn MessageStore>> {
	if !cfg.persistence.enabled {
		return Ok(Arc::new(DisabledStore));
	}

	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
	};
	let store = SqlMessageStore::connect(database_url)
		.await
		.context("connect message store")?;
	info!("message store connected");
	Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut hub_cfg = crate::config::load_hub_config_from_path(&config_path)?;
	if let Some(bind) = args.bind {
		hub_cfg.server.bind = bind;
	}
	info!(path = %config_path.display(), "loaded hub config (toml + env overrides)");

	init_metrics(hub_cfg.server.metrics_bind.as_deref());

	let token_verifier = TokenVerifier::new(
		hub_cfg.server.auth_hmac_secret.clone(),
		hub_cfg.server.service_token.clone(),
	);
	if !token_verifier.is_configured() {
		warn!("no auth_hmac_secret or service_token configured; every upgrade will be refused");
	}
	let verifier: Arc<dyn IdentityVerifier> = Arc::new(token_verifier);

	let registry = spawn_registry(hub_cfg.registry.clone());
	let router = Router::new(registry.clone(), RouterConfig::default());
	let store = build_store(&hub_cfg).await?;
	let notifier = if hub_cfg.notify.enabled {
		Notifier::new(
			registry.clone(),
			Arc::new(StaticDirectory::new(hub_cfg.notify.staff_recipients.clone())),
			Arc::new(LogDispatcher),
		)
	} else {
		Notifier::disabled(registry.clone())
	};
	let dispatcher = Dispatcher::new(router, store, notifier, hub_cfg.session.max_message_bytes);

	let admin_state = AdminState::new(
		dispatcher.clone(),
		Arc::clone(&verifier),
		hub_cfg.session.max_message_bytes,
	);
	if let Some(bind) = hub_cfg.server.admin_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => spawn_admin_server(addr, admin_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid admin bind address (expected host:port)"),
		}
	}

	let listener = TcpListener::bind(&hub_cfg.server.bind)
		.await
		.with_context(|| format!("bind {}", hub_cfg.server.bind))?;
	info!(bind = %hub_cfg.server.bind, "errand_hub: websocket listener ready");

	let hub = Arc::new(HubContext {
		settings: hub_cfg.session.clone(),
		verifier,
		dispatcher,
	});

	admin_state.mark_ready();

	tokio::select! {
		res = serve(listener, hub) => res,
		_ = tokio::signal::ctrl_c() => {
			info!("errand_hub: shutting down");
			Ok(())
		}
	}
}
