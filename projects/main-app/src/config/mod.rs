use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub bind_addr: SocketAddr,
    pub log_dir: PathBuf,
    pub captures_dir: PathBuf,
    pub motions_prefix: String,
    pub capture_binary_prefix: String,
    pub stream_buffer_chunks: usize,
    pub settle_timeout: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let app_name = env::var("APP_NAME").unwrap_or_else(|_| "RaspiCam".to_owned());
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_owned())
            .parse()?;
        let log_dir = PathBuf::from(env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_owned()));
        let captures_dir = std::path::absolute(
            env::var("CAPTURES_DIR").unwrap_or_else(|_| "photos".to_owned()),
        )?;
        let motions_prefix =
            env::var("MOTIONS_PREFIX").unwrap_or_else(|_| "motions/motion".to_owned());
        let capture_binary_prefix = env::var("CAPTURE_BINARY_PREFIX")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "libcamera".to_owned());
        let stream_buffer_chunks = env::var("STREAM_BUFFER_CHUNKS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|chunks| *chunks > 0)
            .unwrap_or(256);
        // 0 waits for first output or exit with no upper bound.
        let settle_timeout = env::var("SETTLE_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);
        let settle_timeout = (settle_timeout > 0).then(|| Duration::from_secs(settle_timeout));

        Ok(Self {
            app_name,
            bind_addr,
            log_dir,
            captures_dir,
            motions_prefix,
            capture_binary_prefix,
            stream_buffer_chunks,
            settle_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        sync::{Mutex, OnceLock},
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use super::AppConfig;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("failed to lock env mutex")
    }

    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    #[test]
    fn from_env_uses_defaults_if_unset() {
        let _guard = lock_env();
        for key in [
            "CAPTURE_BINARY_PREFIX",
            "CAPTURES_DIR",
            "STREAM_BUFFER_CHUNKS",
            "SETTLE_TIMEOUT_SECONDS",
        ] {
            remove_env(key);
        }
        set_env("BIND_ADDR", "127.0.0.1:8080");

        let config = AppConfig::from_env().expect("config should parse");
        assert_eq!(config.capture_binary_prefix, "libcamera");
        assert_eq!(config.stream_buffer_chunks, 256);
        assert_eq!(config.settle_timeout, Some(Duration::from_secs(10)));
        assert!(config.captures_dir.is_absolute());
        assert!(config.captures_dir.ends_with("photos"));
    }

    #[test]
    fn from_env_reads_overrides() {
        let _guard = lock_env();
        set_env("BIND_ADDR", "127.0.0.1:9090");
        set_env("CAPTURE_BINARY_PREFIX", "rpicam");
        set_env("STREAM_BUFFER_CHUNKS", "32");
        set_env("SETTLE_TIMEOUT_SECONDS", "0");

        let config = AppConfig::from_env().expect("config should parse");
        assert_eq!(config.bind_addr.port(), 9090);
        assert_eq!(config.capture_binary_prefix, "rpicam");
        assert_eq!(config.stream_buffer_chunks, 32);
        assert_eq!(config.settle_timeout, None);

        remove_env("CAPTURE_BINARY_PREFIX");
        remove_env("STREAM_BUFFER_CHUNKS");
        remove_env("SETTLE_TIMEOUT_SECONDS");
    }

    #[test]
    fn from_env_rejects_invalid_bind_addr() {
        let _guard = lock_env();
        set_env("BIND_ADDR", "not-an-address");

        assert!(AppConfig::from_env().is_err());
        set_env("BIND_ADDR", "127.0.0.1:8080");
    }

    #[test]
    fn from_env_reads_prefix_from_dotenv_file() {
        let _guard = lock_env();
        remove_env("CAPTURE_BINARY_PREFIX");
        set_env("BIND_ADDR", "127.0.0.1:8080");

        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let path: PathBuf = std::env::temp_dir().join(format!("raspicam-dotenv-{suffix}.env"));
        fs::write(&path, "CAPTURE_BINARY_PREFIX=rpicam\n")
            .expect("should write temporary dotenv file");

        dotenvy::from_path_override(&path).expect("dotenv file should load");
        let config = AppConfig::from_env().expect("config should parse");
        assert_eq!(config.capture_binary_prefix, "rpicam");

        remove_env("CAPTURE_BINARY_PREFIX");
        let _ = fs::remove_file(path);
    }
}
