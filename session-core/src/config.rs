use std::env;

/// Process-wide configuration, loaded once at startup from the environment.
///
/// Mirrors the wire config table in §6: every field here has a direct env
/// var and a sane default so the service runs out of the box in dev.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_sessions: usize,
    pub idle_timeout_seconds: u64,
    pub cleanup_interval_seconds: u64,

    /// Base URL of the headless browser's remote-debugging HTTP endpoint
    /// (the `/json/new`, `/json/version` surface). The external browser
    /// binary itself is out of scope; this is just where we reach it.
    pub browser_http_base: String,

    pub stun_servers: Vec<String>,
    pub turn_server: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,

    pub audio_enabled: bool,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub audio_capture_command: String,

    pub video_width: u32,
    pub video_height: u32,
    pub framerate: u32,
    pub max_framerate: u32,

    pub min_bitrate: u32,
    pub default_bitrate: u32,
    pub max_bitrate: u32,

    pub cors_origins: Vec<String>,

    pub navigation_deadline_seconds: u64,
    pub shutdown_budget_millis: u64,
    pub input_events_per_second: u32,
    pub adaptive_adjustment_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 8080),
            max_sessions: env_parse("MAX_SESSIONS", 50),
            idle_timeout_seconds: env_parse("IDLE_TIMEOUT_SECONDS", 300),
            cleanup_interval_seconds: env_parse("CLEANUP_INTERVAL_SECONDS", 30),

            browser_http_base: env::var("BROWSER_HTTP_BASE")
                .unwrap_or_else(|_| "http://127.0.0.1:9222".to_string()),

            stun_servers: env_list("STUN_SERVERS", &["stun:stun.l.google.com:19302"]),
            turn_server: env::var("TURN_SERVER").ok(),
            turn_username: env::var("TURN_USERNAME").ok(),
            turn_password: env::var("TURN_PASSWORD").ok(),

            audio_enabled: env_bool("AUDIO_ENABLED", true),
            audio_sample_rate: env_parse("AUDIO_SAMPLE_RATE", 48_000),
            audio_channels: env_parse("AUDIO_CHANNELS", 2),
            audio_capture_command: env::var("AUDIO_CAPTURE_COMMAND")
                .unwrap_or_else(|_| "parec".to_string()),

            video_width: env_parse("VIDEO_WIDTH", 720),
            video_height: env_parse("VIDEO_HEIGHT", 1280),
            framerate: env_parse("FRAMERATE", 30),
            max_framerate: env_parse("MAX_FRAMERATE", 60),

            min_bitrate: env_parse("MIN_BITRATE", 500_000),
            default_bitrate: env_parse("DEFAULT_BITRATE", 2_000_000),
            max_bitrate: env_parse("MAX_BITRATE", 5_000_000),

            cors_origins: env_list("CORS_ORIGINS", &["*"]),

            navigation_deadline_seconds: env_parse("NAVIGATION_DEADLINE_SECONDS", 30),
            shutdown_budget_millis: env_parse("SHUTDOWN_BUDGET_MILLIS", 2_000),
            input_events_per_second: env_parse("INPUT_EVENTS_PER_SECOND", 200),
            adaptive_adjustment_seconds: env_parse("ADAPTIVE_ADJUSTMENT_SECONDS", 5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            max_sessions: 50,
            idle_timeout_seconds: 300,
            cleanup_interval_seconds: 30,
            browser_http_base: "http://127.0.0.1:9222".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_server: None,
            turn_username: None,
            turn_password: None,
            audio_enabled: true,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            audio_capture_command: "parec".to_string(),
            video_width: 720,
            video_height: 1280,
            framerate: 30,
            max_framerate: 60,
            min_bitrate: 500_000,
            default_bitrate: 2_000_000,
            max_bitrate: 5_000_000,
            cors_origins: vec!["*".to_string()],
            navigation_deadline_seconds: 30,
            shutdown_budget_millis: 2_000,
            input_events_per_second: 200,
            adaptive_adjustment_seconds: 5,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => {
            v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
        }
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}
