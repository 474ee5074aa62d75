use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Containers carrying this label (set to `"true"`) are owned by the
/// reconciler; everything else is ignored end-to-end.
pub const LABEL_MANAGED: &str = "managed";
/// Application id the container belongs to.
pub const LABEL_APP_ID: &str = "app.id";
/// Human name of the owning application.
pub const LABEL_APP_NAME: &str = "app.name";
/// Marks infrastructure containers (e.g. `system=caddy`). Never managed.
pub const LABEL_SYSTEM: &str = "system";
/// Container name prefix used before ownership labels existed.
pub const LEGACY_NAME_PREFIX: &str = "simplify-";

/// The unit of deployment. The desired spec is client-owned; the engine
/// binding fields are filled in from live engine state when the API
/// serves a read and are never written back to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySettings>,

    // Engine binding, reconciler/decoration-owned.
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub port_bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub networks: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_replicas() -> u32 {
    1
}

/// Virtual-host exposure through the reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub hostname: String,
    /// Container port the proxy forwards to. `0` means the default (80).
    #[serde(default)]
    pub port: u16,
}

impl Application {
    /// Ownership labels stamped on every container deployed for this
    /// application.
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED.to_owned(), "true".to_owned()),
            (LABEL_APP_ID.to_owned(), self.id.clone()),
            (LABEL_APP_NAME.to_owned(), self.name.clone()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Bare application fixture shared by unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_application(id: &str, name: &str) -> Application {
    Application {
        id: id.to_owned(),
        name: name.to_owned(),
        image: "nginx:latest".to_owned(),
        ports: BTreeMap::new(),
        env: BTreeMap::new(),
        replicas: 1,
        proxy: None,
        container_id: String::new(),
        status: String::new(),
        port_bindings: BTreeMap::new(),
        ip_address: String::new(),
        networks: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
