#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use errand_domain::IdentityId;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::registry::RegistryConfig;
use crate::server::session::SessionSettings;

/// Default websocket bind address.
pub const DEFAULT_BIND: &str = "127.0.0.1:18400";

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Default config path: `~/.errand/hub.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".errand").join("hub.toml"))
}

/// Load the hub config from TOML and env overrides.
pub fn load_hub_config_from_path(path: &Path) -> anyhow::Result<HubConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = HubConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	cfg.clamp_session_timing();

	Ok(cfg)
}

/// Hub config (v1).
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
	pub server: ServerSettings,
	pub session: SessionSettings,
	pub registry: RegistryConfig,
	pub persistence: PersistenceSettings,
	pub notify: NotifySettings,
}

/// Listener and credential settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Websocket bind address (host:port).
	pub bind: String,
	/// Optional admin HTTP bind address (host:port).
	pub admin_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Static token for the sibling REST service.
	pub service_token: Option<SecretString>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			admin_bind: None,
			metrics_bind: None,
			auth_hmac_secret: None,
			service_token: None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NotifySettings {
	pub enabled: bool,
	/// Staff identities that receive offline notifications for customer messages.
	pub staff_recipients: Vec<IdentityId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	session: FileSessionSettings,

	#[serde(default)]
	registry: FileRegistrySettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	notify: FileNotifySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	admin_bind: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	service_token: Option<String>,
	max_message_bytes: Option<usize>,
	handshake_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	outbox_capacity: Option<usize>,
	ping_interval_ms: Option<u64>,
	read_deadline_ms: Option<u64>,
	max_missed_pongs: Option<u32>,
	write_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRegistrySettings {
	command_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileNotifySettings {
	enabled: Option<bool>,
	#[serde(default)]
	staff_recipients: Vec<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl HubConfig {
	fn from_file(file: FileConfig) -> Self {
		let session_defaults = SessionSettings::default();
		let session = SessionSettings {
			outbox_capacity: file
				.session
				.outbox_capacity
				.filter(|v| *v > 0)
				.unwrap_or(session_defaults.outbox_capacity),
			ping_interval: file
				.session
				.ping_interval_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(session_defaults.ping_interval),
			read_deadline: file
				.session
				.read_deadline_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(session_defaults.read_deadline),
			max_missed_pongs: file
				.session
				.max_missed_pongs
				.filter(|v| *v > 0)
				.unwrap_or(session_defaults.max_missed_pongs),
			write_timeout: file
				.session
				.write_timeout_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(session_defaults.write_timeout),
			max_message_bytes: file
				.server
				.max_message_bytes
				.filter(|v| *v > 0)
				.unwrap_or(session_defaults.max_message_bytes),
			handshake_timeout: file
				.server
				.handshake_timeout_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(session_defaults.handshake_timeout),
		};

		let staff_recipients = file
			.notify
			.staff_recipients
			.into_iter()
			.filter_map(|s| IdentityId::new(s.trim()).ok())
			.collect();

		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind).unwrap_or_else(|| DEFAULT_BIND.to_string()),
				admin_bind: non_empty(file.server.admin_bind),
				metrics_bind: non_empty(file.server.metrics_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
				service_token: non_empty(file.server.service_token).map(SecretString::new),
			},
			session,
			registry: RegistryConfig {
				command_queue_capacity: file
					.registry
					.command_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(RegistryConfig::default().command_queue_capacity),
				..RegistryConfig::default()
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
			},
			notify: NotifySettings {
				enabled: file.notify.enabled.unwrap_or(false),
				staff_recipients,
			},
		}
	}

	/// The writer must ping well inside the read deadline or idle sessions would time out.
	fn clamp_session_timing(&mut self) {
		let s = &mut self.session;
		if s.ping_interval >= s.read_deadline {
			let clamped = s.read_deadline / 2;
			warn!(
				ping_interval_ms = s.ping_interval.as_millis() as u64,
				read_deadline_ms = s.read_deadline.as_millis() as u64,
				clamped_ms = clamped.as_millis() as u64,
				"session config: ping_interval >= read_deadline; clamping"
			);
			s.ping_interval = clamped;
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().and_then(|v| non_empty(Some(v)))
}

fn apply_env_overrides(cfg: &mut HubConfig) {
	if let Some(v) = env_string("ERRAND_HUB_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_ADMIN_BIND") {
		cfg.server.admin_bind = Some(v);
		info!("server config: admin_bind overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_SERVICE_TOKEN") {
		cfg.server.service_token = Some(SecretString::new(v));
		info!("server auth: service_token overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_MAX_MESSAGE_BYTES")
		&& let Ok(max) = v.parse::<usize>()
		&& max > 0
	{
		cfg.session.max_message_bytes = max;
		info!(max, "server config: max_message_bytes overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_HANDSHAKE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.session.handshake_timeout = Duration::from_millis(ms);
		info!(ms, "server config: handshake_timeout overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_OUTBOX_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.session.outbox_capacity = capacity;
		info!(capacity, "session config: outbox_capacity overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_PING_INTERVAL_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.session.ping_interval = Duration::from_millis(ms);
		info!(ms, "session config: ping_interval overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_READ_DEADLINE_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.session.read_deadline = Duration::from_millis(ms);
		info!(ms, "session config: read_deadline overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env_string("ERRAND_HUB_NOTIFY_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.notify.enabled = enabled;
		info!(enabled, "notify: enabled overridden by env");
	}

	if cfg.server.auth_hmac_secret.is_none() && cfg.server.service_token.is_none() {
		warn!("server auth: no auth_hmac_secret or service_token configured; all upgrades will be refused");
	}
}
