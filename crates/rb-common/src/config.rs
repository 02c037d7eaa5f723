use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Top-level program configuration, loaded once from the YAML config file
/// named on the command line (or the default `./conf/dhcp-batcher.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub operation_mode: OperationMode,
    pub sonar: SonarConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Batch,
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SonarConfig {
    #[serde(rename = "sonar_version")]
    pub version: u8,
    #[serde(rename = "sonar_api_username", default)]
    pub api_username: String,
    #[serde(rename = "sonar_api_key", default)]
    pub api_key: String,
    #[serde(rename = "sonar_instance")]
    pub instance_name: String,
    #[serde(rename = "sonar_bearer_token", default)]
    pub bearer_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRouterAuth {
    pub username: String,
    pub password: String,
    pub router_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(rename = "batch_use_tls", default)]
    pub use_tls: bool,
    #[serde(rename = "batch_tls_key", default)]
    pub tls_key: String,
    #[serde(rename = "batch_tls_cert", default)]
    pub tls_cert: String,
    #[serde(rename = "batch_ip", default = "default_bind_ip")]
    pub server_ip: String,
    #[serde(rename = "batch_http_port", default = "default_http_port")]
    pub http_port: u16,
    #[serde(rename = "batch_tls_port", default = "default_tls_port")]
    pub tls_port: u16,
    #[serde(rename = "batch_cycle_time", default)]
    pub cycle_time_minutes: u64,
    #[serde(rename = "batch_routers", default)]
    pub routers: Vec<BatchRouterAuth>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            use_tls: false,
            tls_key: String::new(),
            tls_cert: String::new(),
            server_ip: default_bind_ip(),
            http_port: default_http_port(),
            tls_port: default_tls_port(),
            cycle_time_minutes: 0,
            routers: Vec::new(),
        }
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_tls_port() -> u16 {
    8443
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(rename = "proxy_upstream_if", default)]
    pub upstream_interface: String,
    #[serde(rename = "proxy_downstream_if", default)]
    pub downstream_interface: String,
    #[serde(rename = "proxy_upstream_dhcp_ips", default)]
    pub upstream_dhcp_ips: Vec<String>,
    #[serde(rename = "proxy_server_ip", default)]
    pub proxy_server_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(rename = "logging_mode", default = "default_logging_mode")]
    pub mode: String,
    #[serde(rename = "logging_format", default = "default_logging_format")]
    pub format: String,
    #[serde(rename = "logging_output", default = "default_logging_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            mode: default_logging_mode(),
            format: default_logging_format(),
            output: default_logging_output(),
        }
    }
}

fn default_logging_mode() -> String {
    "info".to_string()
}

fn default_logging_format() -> String {
    "text".to_string()
}

fn default_logging_output() -> String {
    "console".to_string()
}

impl ProgramConfig {
    /// Load and parse the YAML config file. Validation is a separate step
    /// (`validate`), so parsing a file never fails on a bad field value.
    pub fn load_from_file(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("unable to open {}: {e}", path.display())))?;
        let config: ProgramConfig = serde_yaml::from_str(&content)
            .map_err(|e| AppError::Config(format!("error parsing {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Validate the loaded configuration, normalizing `sonar.instance_name`
    /// in place. Returns the offending field name in the error on failure.
    pub fn validate(&mut self) -> Result<(), AppError> {
        match self.operation_mode {
            OperationMode::Batch => self.validate_batch()?,
            OperationMode::Proxy => self.validate_proxy()?,
        }
        self.validate_sonar()
    }

    fn validate_batch(&self) -> Result<(), AppError> {
        let batch = &self.batch;

        if batch.use_tls {
            if !Path::new(&batch.tls_key).is_file() {
                return Err(AppError::Config(
                    "(batch_tls_key) TLS key not found".into(),
                ));
            }
            if !Path::new(&batch.tls_cert).is_file() {
                return Err(AppError::Config(
                    "(batch_tls_cert) TLS cert not found".into(),
                ));
            }
        }

        if batch.server_ip.parse::<std::net::IpAddr>().is_err() {
            return Err(AppError::Config(
                "(batch_ip) unable to parse server IP".into(),
            ));
        }

        for router in &batch.routers {
            if router.username.len() < 5 {
                return Err(AppError::Config(format!(
                    "(batch_routers) username for {} must be 5 or more characters",
                    router.router_ip
                )));
            }
            if router.password.len() < 16 {
                return Err(AppError::Config(format!(
                    "(batch_routers) password for {} must be 16 or more characters",
                    router.router_ip
                )));
            }
            if router.router_ip.parse::<Ipv4Addr>().is_err() {
                return Err(AppError::Config(format!(
                    "(batch_routers) unable to parse router_ip {}",
                    router.router_ip
                )));
            }
        }

        Ok(())
    }

    fn validate_proxy(&self) -> Result<(), AppError> {
        let proxy = &self.proxy;

        if proxy.proxy_server_ip.parse::<Ipv4Addr>().is_err() {
            return Err(AppError::Config(
                "(proxy_server_ip) unable to parse the specified proxy server IP".into(),
            ));
        }

        if proxy.upstream_dhcp_ips.is_empty() {
            return Err(AppError::Config(
                "(proxy_upstream_dhcp_ips) you need to specify the IPs of the dhcp servers to forward requests to".into(),
            ));
        }

        for ip in &proxy.upstream_dhcp_ips {
            if ip.parse::<Ipv4Addr>().is_err() {
                return Err(AppError::Config(
                    "(proxy_upstream_dhcp_ips) unable to parse a configured dhcp server IP".into(),
                ));
            }
        }

        if proxy.upstream_interface.is_empty() || proxy.downstream_interface.is_empty() {
            return Err(AppError::Config(
                "(proxy_upstream_if / proxy_downstream_if) both interfaces must be set".into(),
            ));
        }

        Ok(())
    }

    fn validate_sonar(&mut self) -> Result<(), AppError> {
        let sonar = &mut self.sonar;

        if sonar.version < 1 || sonar.version > 2 {
            return Err(AppError::Config("(sonar_version) version must be [1 | 2]".into()));
        }

        if sonar.version == 1 {
            if sonar.api_username.is_empty() || sonar.api_username.len() > 256 {
                return Err(AppError::Config(
                    "(sonar_api_username) your sonar_api_username is blank or greater than 256 characters".into(),
                ));
            }
            if sonar.api_key.is_empty() || sonar.api_key.len() > 1925 {
                return Err(AppError::Config(
                    "(sonar_api_key) your sonar_api_key is blank or greater than 1925 bytes".into(),
                ));
            }
        }

        if sonar.version == 2 && sonar.bearer_token.len() > 1925 {
            return Err(AppError::Config(
                "(sonar_bearer_token) your sonar_bearer_token is greater than 1925 bytes".into(),
            ));
        }

        sonar.instance_name = sonar
            .instance_name
            .to_lowercase()
            .replacen("https://", "", 1);

        if sonar.instance_name.is_empty() || sonar.instance_name.len() > 256 {
            return Err(AppError::Config(
                "(sonar_instance) your sonar_instance URI is blank or greater than 256 characters".into(),
            ));
        }

        Ok(())
    }
}
