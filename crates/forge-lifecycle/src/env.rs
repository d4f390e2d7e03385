//! Synthetic platform environment for staging and running containers

use crate::app_config::{AppConfig, Services};
use crate::ForgeError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const APPLICATION_ID: &str = "01d31c12-d066-495e-aca2-8d3403165360";
pub const APPLICATION_VERSION: &str = "2b860df9-a0a1-474c-b02f-5985f53ea0bb";
pub const SPACE_ID: &str = "18300c1c-1aa4-4ae7-81e6-ae59c6cdbaf1";
pub const INSTANCE_ID: &str = "999db41a-508b-46eb-74d8-6f9c06c006da";

const PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const LANG: &str = "en_US.UTF-8";
const STACK: &str = "heroku-16";

/// The `VCAP_APPLICATION` document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcapApplication {
    pub application_id: String,
    pub application_name: String,
    pub application_uris: Vec<String>,
    pub application_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_index: Option<u32>,
    pub limits: BTreeMap<String, i64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub space_id: String,
    pub space_name: String,
    pub uris: Vec<String>,
    pub version: String,
}

impl VcapApplication {
    fn new(name: &str, memory: i64, disk: i64) -> Self {
        Self {
            application_id: APPLICATION_ID.to_string(),
            application_name: name.to_string(),
            application_uris: vec!["localhost".to_string()],
            application_version: APPLICATION_VERSION.to_string(),
            host: None,
            instance_id: None,
            instance_index: None,
            limits: BTreeMap::from([
                ("disk".to_string(), disk),
                ("fds".to_string(), 16384),
                ("mem".to_string(), memory),
            ]),
            name: name.to_string(),
            port: None,
            space_id: SPACE_ID.to_string(),
            space_name: format!("{}-space", name),
            uris: vec!["localhost".to_string()],
            version: SPACE_ID.to_string(),
        }
    }

    /// Metadata seen by the builder, with fixed staging limits
    pub fn staging(name: &str) -> Self {
        Self::new(name, 1024, 4096)
    }

    /// Metadata seen by a running instance
    pub fn running(name: &str, memory: i64, disk: i64) -> Self {
        Self {
            host: Some("0.0.0.0".to_string()),
            instance_id: Some(INSTANCE_ID.to_string()),
            instance_index: Some(0),
            port: Some(8080),
            ..Self::new(name, memory, disk)
        }
    }
}

/// `VCAP_SERVICES`, `{}` when the app binds nothing
pub fn services_json(services: Option<&Services>) -> Result<String, ForgeError> {
    let empty = Services::new();
    Ok(serde_json::to_string(services.unwrap_or(&empty))?)
}

fn string_map<const N: usize>(pairs: [(&str, String); N]) -> HashMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Base environment of the staging container
pub fn staging_env(app: &AppConfig) -> Result<HashMap<String, String>, ForgeError> {
    let vcap_application = serde_json::to_string(&VcapApplication::staging(&app.name))?;
    let vcap_services = services_json(app.services.as_ref())?;

    Ok(string_map([
        ("CF_INSTANCE_ADDR", String::new()),
        ("CF_INSTANCE_IP", "0.0.0.0".to_string()),
        ("CF_INSTANCE_PORT", String::new()),
        ("CF_INSTANCE_PORTS", "[]".to_string()),
        ("CF_STACK", "cflinuxfs2".to_string()),
        ("HOME", "/root".to_string()),
        ("LANG", LANG.to_string()),
        ("MEMORY_LIMIT", "1024m".to_string()),
        ("PATH", PATH.to_string()),
        ("USER", "root".to_string()),
        ("STACK", STACK.to_string()),
        ("VCAP_APPLICATION", vcap_application),
        ("VCAP_SERVICES", vcap_services),
    ]))
}

/// Base environment of a running instance, limits in megabytes
pub fn running_env(
    app: &AppConfig,
    memory: i64,
    disk: i64,
) -> Result<HashMap<String, String>, ForgeError> {
    let vcap_application =
        serde_json::to_string(&VcapApplication::running(&app.name, memory, disk))?;
    let vcap_services = services_json(app.services.as_ref())?;

    Ok(string_map([
        ("CF_INSTANCE_ADDR", "0.0.0.0:8080".to_string()),
        ("CF_INSTANCE_GUID", INSTANCE_ID.to_string()),
        ("CF_INSTANCE_INDEX", "0".to_string()),
        ("CF_INSTANCE_IP", "0.0.0.0".to_string()),
        ("CF_INSTANCE_PORT", "8080".to_string()),
        (
            "CF_INSTANCE_PORTS",
            r#"[{"external":8080,"internal":8080}]"#.to_string(),
        ),
        ("INSTANCE_GUID", INSTANCE_ID.to_string()),
        ("INSTANCE_INDEX", "0".to_string()),
        ("LANG", LANG.to_string()),
        ("MEMORY_LIMIT", format!("{}m", memory)),
        ("PATH", PATH.to_string()),
        ("PORT", "8080".to_string()),
        ("TMPDIR", "/tmp".to_string()),
        ("USER", "root".to_string()),
        ("STACK", STACK.to_string()),
        ("VCAP_APPLICATION", vcap_application),
        ("VCAP_SERVICES", vcap_services),
    ]))
}

/// Merge maps left to right; a key set by a later map wins
pub fn merge_maps<'a, I>(maps: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a HashMap<String, String>>,
{
    let mut merged = HashMap::new();
    for map in maps {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// `K=V` pairs sorted by key
pub fn map_to_env(env: &HashMap<String, String>) -> Vec<String> {
    let mut out: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    out.sort();
    out
}
