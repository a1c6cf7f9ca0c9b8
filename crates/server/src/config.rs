use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// `hostname:port` identity published into the registry; handles are
    /// meaningful only paired with it.
    pub identity: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub postgres_dsn: String,
    pub redis_url: String,
    pub redis_cluster: bool,
    pub db_read_pool: usize,
    pub db_write_pool: usize,
    pub worker_threads: usize,
    pub task_workers: usize,
    pub max_connections: usize,
    pub outbound_buffer: usize,
    pub socket_send_buffer: usize,
    pub socket_recv_buffer: usize,
    pub heartbeat_idle_seconds: u64,
    pub heartbeat_check_seconds: u64,
    pub poll_interval_seconds: u64,
    pub offline_ttl_seconds: i64,
}

/// Loads server configuration from an optional file plus environment
/// overrides. A missing file is not an error; every knob has a default or
/// an environment source.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let mut map = HashMap::new();
    if let Ok(contents) = fs::read_to_string(path) {
        parse_sections(&contents, &mut map)?;
    }

    let bind = override_env("COURIER_BIND", map.remove("server.bind"))?
        .unwrap_or_else(|| "0.0.0.0:9502".to_string());
    let identity = match override_env("COURIER_IDENTITY", map.remove("server.identity"))? {
        Some(value) => value,
        None => default_identity(&bind),
    };
    let tls_cert = override_env("COURIER_TLS_CERT", map.remove("server.tls_cert"))?;
    let tls_key = override_env("COURIER_TLS_KEY", map.remove("server.tls_key"))?;
    let postgres_dsn = required(override_env(
        "COURIER_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let redis_url = match override_env("COURIER_REDIS_URL", map.remove("storage.redis_url"))? {
        Some(url) => url,
        None => redis_url_from_env()?,
    };
    let redis_cluster = parse_flag(override_env("REDIS_CLUSTER", map.remove("storage.redis_cluster"))?);

    let db_read_pool = parse_number(
        override_env("DB_READ_POOL_SIZE", map.remove("storage.db_read_pool"))?,
        15,
    )?;
    let db_write_pool = parse_number(
        override_env("DB_WRITE_POOL_SIZE", map.remove("storage.db_write_pool"))?,
        5,
    )?;

    let default_workers = std::thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(1);
    let worker_threads = parse_number(
        override_env("COURIER_WORKERS", map.remove("server.workers"))?,
        default_workers,
    )?;
    let task_workers = parse_number(
        override_env("COURIER_TASK_WORKERS", map.remove("server.task_workers"))?,
        default_workers * 2,
    )?;
    let max_connections = parse_number(
        override_env("COURIER_MAX_CONNECTIONS", map.remove("limits.max_connections"))?,
        1024,
    )?;
    let outbound_buffer = parse_number(
        override_env("COURIER_OUTBOUND_BUFFER", map.remove("limits.outbound_buffer"))?,
        128,
    )?;
    let socket_send_buffer = parse_number(
        override_env("COURIER_SOCKET_SEND_BUFFER", map.remove("limits.socket_send_buffer"))?,
        8 * 1024 * 1024,
    )?;
    let socket_recv_buffer = parse_number(
        override_env("COURIER_SOCKET_RECV_BUFFER", map.remove("limits.socket_recv_buffer"))?,
        32 * 1024 * 1024,
    )?;
    let heartbeat_idle_seconds = parse_number(
        override_env("COURIER_HEARTBEAT_IDLE", map.remove("heartbeat.idle"))?,
        180,
    )?;
    let heartbeat_check_seconds = parse_number(
        override_env("COURIER_HEARTBEAT_CHECK", map.remove("heartbeat.check"))?,
        60,
    )?;
    let poll_interval_seconds = parse_number(
        override_env("COURIER_POLL_INTERVAL", map.remove("pump.poll_interval"))?,
        15,
    )?;
    let offline_ttl_seconds = parse_number(
        override_env("COURIER_OFFLINE_TTL", map.remove("limits.offline_ttl"))?,
        604800i64,
    )?;

    Ok(ServerConfig {
        bind,
        identity,
        tls_cert,
        tls_key,
        postgres_dsn,
        redis_url,
        redis_cluster,
        db_read_pool,
        db_write_pool,
        worker_threads: worker_threads.max(1),
        task_workers: task_workers.max(1),
        max_connections: max_connections.max(1),
        outbound_buffer: outbound_buffer.max(1),
        socket_send_buffer: socket_send_buffer.max(64 * 1024),
        socket_recv_buffer: socket_recv_buffer.max(64 * 1024),
        heartbeat_idle_seconds: heartbeat_idle_seconds.max(1),
        heartbeat_check_seconds: heartbeat_check_seconds.max(1),
        poll_interval_seconds: poll_interval_seconds.max(1),
        offline_ttl_seconds: offline_ttl_seconds.max(1),
    })
}

fn parse_sections(contents: &str, map: &mut HashMap<String, String>) -> Result<(), ConfigError> {
    let mut section = String::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }
    Ok(())
}

/// Builds the connection URL from the REDIS_* environment contract.
fn redis_url_from_env() -> Result<String, ConfigError> {
    let scheme = match env::var("REDIS_SCHEME") {
        Ok(value) if value == "redis" || value == "rediss" => value,
        Ok(_) => return Err(ConfigError::Invalid),
        Err(_) => "redis".to_string(),
    };
    let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = match env::var("REDIS_PORT") {
        Ok(value) => value.parse::<u16>().map_err(|_| ConfigError::Invalid)?,
        Err(_) => 6379,
    };
    let auth = match env::var("REDIS_PASSWORD") {
        Ok(password) if !password.is_empty() => format!(":{}@", password),
        _ => String::new(),
    };
    Ok(format!("{}://{}{}:{}/", scheme, auth, host, port))
}

fn default_identity(bind: &str) -> String {
    let port = bind.rsplit_once(':').map(|(_, port)| port).unwrap_or("9502");
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}:{}", host, port)
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

fn parse_flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

fn parse_number<T>(value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match value {
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("courier_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:9502\"\nidentity=\"node-1:9502\"\n[storage]\npostgres_dsn=\"postgres://courier@localhost/courier\"\nredis_url=\"redis://localhost:6379/\"\n[heartbeat]\nidle=\"180\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9502");
        assert_eq!(config.identity, "node-1:9502");
        assert_eq!(config.heartbeat_idle_seconds, 180);
        assert_eq!(config.heartbeat_check_seconds, 60);
        assert_eq!(config.db_read_pool, 15);
        assert_eq!(config.db_write_pool, 5);
        assert_eq!(config.poll_interval_seconds, 15);
        assert_eq!(config.offline_ttl_seconds, 604800);
        assert_eq!(config.socket_send_buffer, 8 * 1024 * 1024);
        assert_eq!(config.socket_recv_buffer, 32 * 1024 * 1024);
        assert!(config.tls_cert.is_none());
        assert!(!config.redis_cluster);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_dsn_is_fatal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("courier_test_config_empty.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"[server]\nbind=\"127.0.0.1:9502\"\nredis_url_placeholder=\"x\"\n")
            .unwrap();
        // COURIER_PG_DSN may leak in from the environment of integration
        // runs; only assert when it is absent.
        if env::var("COURIER_PG_DSN").is_err() {
            assert!(matches!(
                load_configuration(&path),
                Err(ConfigError::Missing)
            ));
        }
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn identity_defaults_to_bind_port() {
        let identity = default_identity("0.0.0.0:9502");
        assert!(identity.ends_with(":9502"));
    }

    #[test]
    fn flags_parse_common_truthy_forms() {
        assert!(parse_flag(Some("1".to_string())));
        assert!(parse_flag(Some("true".to_string())));
        assert!(!parse_flag(Some("0".to_string())));
        assert!(!parse_flag(None));
    }
}
