use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub download_dir: PathBuf,
    pub cookie_file: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ytdlp_path: PathBuf,
    pub audio_quality: String,
    pub retention_secs: u64,
    pub reclaim_interval_secs: u64,
    pub reject_concurrent: bool,
    pub log_level: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Default settings
            .set_default("server_port", 5000)?
            .set_default("download_dir", "downloads")?
            .set_default("cookie_file", "cookies.txt")?
            .set_default("ffmpeg_path", "./ffmpeg")?
            .set_default("ytdlp_path", "yt-dlp")?
            .set_default("audio_quality", "192")?
            .set_default("retention_secs", 3600)?
            .set_default("reclaim_interval_secs", 3600)?
            .set_default("reject_concurrent", false)?
            .set_default("log_level", "info")?
            // Config file (optional)
            .add_source(File::with_name("config").required(false))
            // Environment variables (e.g. MEDIAGRAB_SERVER_PORT=8080)
            .add_source(Environment::with_prefix("MEDIAGRAB"))
            // Plain PORT as set by most hosting platforms
            .set_override_option("server_port", std::env::var("PORT").ok())?;

        builder.build()?.try_deserialize()
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs.max(1))
    }
}

#[cfg(test)]
pub fn test_settings(download_dir: PathBuf, cookie_file: PathBuf) -> Settings {
    Settings {
        server_port: 0,
        download_dir,
        cookie_file,
        ffmpeg_path: PathBuf::from("ffmpeg"),
        ytdlp_path: PathBuf::from("yt-dlp"),
        audio_quality: "192".to_string(),
        retention_secs: 3600,
        reclaim_interval_secs: 3600,
        reject_concurrent: false,
        log_level: "info".to_string(),
    }
}
