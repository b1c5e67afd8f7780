use anyhow::Result;
use serde::Deserialize;
use anyhow::anyhow;

pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one database per origin; memory-only when unset.
    #[serde(default)]
    pub local_storage_directory: Option<String>,
    #[serde(default = "default_quota")]
    pub local_quota_bytes: usize,
    #[serde(default = "default_quota")]
    pub session_quota_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { local_storage_directory: None, local_quota_bytes: DEFAULT_QUOTA_BYTES, session_quota_bytes: DEFAULT_QUOTA_BYTES }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,
    #[serde(default = "default_admin_addr")]
    pub addr: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self { enabled: default_admin_enabled(), addr: default_admin_addr() }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_quota() -> usize { DEFAULT_QUOTA_BYTES }
fn default_admin_enabled() -> bool { true }
fn default_admin_addr() -> String { "127.0.0.1:9189".to_string() }

pub fn load_default() -> Result<AppConfig> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "storage.toml".to_string());
    load_from_file(&path)
}

pub fn load_from_file(path: &str) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    load_from_str(&content)
}

pub fn load_from_str(content: &str) -> Result<AppConfig> {
    let cfg: AppConfig = toml::from_str(content)?;
    Ok(cfg)
}

impl AppConfig {
    pub fn load_and_validate() -> Result<Self> {
        let mut cfg = load_default()?;
        cfg.normalize_and_validate()?;
        Ok(cfg)
    }

    pub fn normalize_and_validate(&mut self) -> Result<()> {
        // 目录可由环境变量 STORAGE_DIR 覆盖
        self.storage.normalize_from_env();
        self.storage.validate()?;
        self.admin.normalize_and_validate()?;
        Ok(())
    }
}

impl StorageConfig {
    pub fn normalize_from_env(&mut self) {
        if let Ok(dir) = std::env::var("STORAGE_DIR") {
            if !dir.trim().is_empty() {
                self.local_storage_directory = Some(dir);
            }
        }
        // 空字符串视为未配置（仅内存模式）
        if self.local_storage_directory.as_deref().is_some_and(|d| d.trim().is_empty()) {
            self.local_storage_directory = None;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_quota_bytes == 0 {
            return Err(anyhow!("storage.local_quota_bytes 必须 >= 1"));
        }
        if self.session_quota_bytes == 0 {
            return Err(anyhow!("storage.session_quota_bytes 必须 >= 1"));
        }
        Ok(())
    }
}

impl AdminConfig {
    fn normalize_and_validate(&mut self) -> Result<()> {
        if self.addr.trim().is_empty() {
            self.addr = default_admin_addr();
        }
        self.addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("admin.addr 无法解析为 host:port ({}): {e}", self.addr))?;
        Ok(())
    }
}
