use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use wm_core::ManagerConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: String,
    pub api_endpoint: String,
    pub database_url: Option<String>,
    pub logs_dir: PathBuf,
    pub default_mem_size_mb: u32,
    pub shutdown_timeout_secs: u64,
    pub agent_command: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".into())
                .parse()
                .expect("LISTEN_ADDR must be a valid socket address"),
            api_key: env::var("API_KEY").expect("API_KEY must be set"),
            api_endpoint: env::var("API_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:8080/api".into()),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            logs_dir: env::var("MACHINE_LOGS_DIR")
                .unwrap_or_else(|_| "/tmp/wm/logs".into())
                .into(),
            default_mem_size_mb: env::var("MACHINE_DEFAULT_MEM_SIZE_MB")
                .unwrap_or_else(|_| "1024".into())
                .parse()
                .expect("MACHINE_DEFAULT_MEM_SIZE_MB must be a valid u32"),
            shutdown_timeout_secs: env::var("MACHINE_SHUTDOWN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".into())
                .parse()
                .expect("MACHINE_SHUTDOWN_TIMEOUT_SECS must be a valid u64"),
            agent_command: env::var("WS_AGENT_COMMAND").ok().filter(|c| !c.is_empty()),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            logs_dir: self.logs_dir.clone(),
            default_ram_mb: self.default_mem_size_mb,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            agent_command: self.agent_command.clone(),
        }
    }
}
