use serde::{Deserialize, Serialize};

use crate::model::SendMode;

/// Default configuration file, overridable by the first process argument.
pub const DEFAULT_CONFIG_PATH: &str = "config/risk-sms.yml";

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database connection settings, shared by every service.
    pub datasource: DataSourceConfig,

    /// Carrier services; a single object and a list are both accepted.
    pub sms: SmsSection,
}

impl Config {
    pub fn services(&self) -> &[SmsServiceConfig] {
        match &self.sms {
            SmsSection::One(service) => std::slice::from_ref(service.as_ref()),
            SmsSection::Many(services) => services.as_slice(),
        }
    }
}

/// The `sms` key keeps the original document shape: either one service
/// object or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SmsSection {
    Many(Vec<SmsServiceConfig>),
    One(Box<SmsServiceConfig>),
}

/// Connection-pool settings for the queue database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    pub server_name: String,
    pub port: u16,
    pub service_name: String,
    pub user: String,
    pub password: String,

    #[serde(default = "default_maximum_pool_size")]
    pub maximum_pool_size: u32,

    #[serde(default = "default_minimum_idle")]
    pub minimum_idle: u32,

    #[serde(rename = "idleTimeout", default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(rename = "connectionTimeout", default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl DataSourceConfig {
    /// Connection URL derived from the datasource fields.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.server_name, self.port, self.service_name
        )
    }
}

/// One carrier service: business filters plus its SMPP endpoint.
///
/// Field names preserve the original document keys (Spanish, including the
/// historical `sourceAdress` spelling) so existing config files keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsServiceConfig {
    /// Service key; also the log-routing key.
    pub nombre: String,

    /// Carrier filter for the queue query. `None` means any.
    #[serde(default)]
    pub telefonia: Option<String>,

    /// Category-classification filter for the queue query. `None` means any.
    #[serde(default)]
    pub clasificacion: Option<String>,

    #[serde(rename = "cantidadMaximaPorLote", default = "default_batch_max")]
    pub cantidad_maxima_por_lote: i64,

    #[serde(rename = "modoEnvioLote", default)]
    pub modo_envio_lote: SendMode,

    #[serde(rename = "intervaloEntreLotesMs", default = "default_batch_interval_ms")]
    pub intervalo_entre_lotes_ms: u64,

    #[serde(rename = "maximoIntentos", default = "default_max_attempts")]
    pub maximo_intentos: i32,

    pub smpp: SmppConfig,
}

/// SMPP endpoint and pacing settings for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmppConfig {
    pub host: String,
    pub port: u16,
    pub system_id: String,
    pub password: String,

    #[serde(rename = "sourceAdress", alias = "sourceAddress", default)]
    pub source_address: String,

    #[serde(default = "default_send_delay_ms")]
    pub send_delay_ms: u64,
}

fn default_maximum_pool_size() -> u32 {
    50
}

fn default_minimum_idle() -> u32 {
    5
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_batch_max() -> i64 {
    100
}

fn default_batch_interval_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> i32 {
    5
}

fn default_send_delay_ms() -> u64 {
    500
}
