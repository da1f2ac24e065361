#![forbid(unsafe_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use errand_domain::{IdentityId, Role};
use errand_protocol::OutboundEnvelope;

use crate::config::SecretString;
use crate::server::auth::{AuthClaims, TokenVerifier, issue_hmac_token};
use crate::server::dispatch::Dispatcher;
use crate::server::handshake::HubContext;
use crate::server::notify::Notifier;
use crate::server::registry::{Registry, RegistryConfig, spawn_registry};
use crate::server::router::{Router, RouterConfig};
use crate::server::session::{OutboxRx, SessionHandle, SessionSettings};
use crate::server::store::MemoryStore;
use crate::util::time::unix_secs_now;

pub(crate) const TEST_SECRET: &str = "errand-test-secret";
pub(crate) const TEST_SERVICE_TOKEN: &str = "errand-test-service-token";

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub(crate) fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("ERRAND_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

pub(crate) fn id(s: &str) -> IdentityId {
	IdentityId::new(s).expect("valid identity")
}

pub(crate) fn token_for(sub: &str, role: Role) -> String {
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp: unix_secs_now() + 3600,
		role: Some(role.as_str().to_string()),
	};
	issue_hmac_token(&claims, TEST_SECRET).expect("issue token")
}

pub(crate) fn test_verifier() -> TokenVerifier {
	TokenVerifier::new(
		Some(SecretString::new(TEST_SECRET)),
		Some(SecretString::new(TEST_SERVICE_TOKEN)),
	)
}

pub(crate) fn session(identity: &str, role: Role, capacity: usize) -> (SessionHandle, OutboxRx) {
	SessionHandle::new(id(identity), role, capacity)
}

pub(crate) struct TestHub {
	pub registry: Registry,
	pub dispatcher: Dispatcher,
	pub store: Arc<MemoryStore>,
	pub context: Arc<HubContext>,
}

pub(crate) fn test_hub(settings: SessionSettings) -> TestHub {
	test_hub_with_store(settings, Arc::new(MemoryStore::default()))
}

pub(crate) fn test_hub_with_store(settings: SessionSettings, store: Arc<MemoryStore>) -> TestHub {
	init_test_logging();

	let registry = spawn_registry(RegistryConfig {
		debug_logs: true,
		..RegistryConfig::default()
	});
	let router = Router::new(
		registry.clone(),
		RouterConfig {
			debug_log_events: true,
		},
	);
	let dispatcher = Dispatcher::new(
		router,
		store.clone(),
		Notifier::disabled(registry.clone()),
		settings.max_message_bytes,
	);
	let context = Arc::new(HubContext {
		settings,
		verifier: Arc::new(test_verifier()),
		dispatcher: dispatcher.clone(),
	});

	TestHub {
		registry,
		dispatcher,
		store,
		context,
	}
}

/// Next envelope from an outbox, failing the test after a second.
pub(crate) async fn next_envelope(rx: &mut OutboxRx) -> Arc<OutboundEnvelope> {
	tokio::time::timeout(Duration::from_secs(1), rx.recv())
		.await
		.expect("expected an envelope within timeout")
		.expect("outbox open")
}

/// Assert nothing arrives for a short while.
pub(crate) async fn assert_quiet(rx: &mut OutboxRx) {
	let got = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got.is_err(), "unexpected envelope: {got:?}");
}
