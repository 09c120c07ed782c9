use serde::{Deserialize, Serialize};

/// A single entry in the service registry. Loaded once per run, read-only
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub name: String,
    pub production_port: u16,
    pub shadow_port_offset: u16,
    pub working_path: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    pub start_command: String,
    /// Environment variable names this service requires at resolve time.
    #[serde(default)]
    pub env: Vec<String>,
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl ServiceSpec {
    pub fn shadow_port(&self) -> u16 {
        self.production_port + self.shadow_port_offset
    }

    pub fn health_url(&self, port: u16) -> String {
        format!("http://127.0.0.1:{port}{}", self.health_path)
    }
}
