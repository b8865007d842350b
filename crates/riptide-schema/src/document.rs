//! Raw configuration documents as they appear on disk.
//!
//! Every field is optional so documents can be layered: defaults, user system
//! config, project file, local override and repository `extends` references
//! are parsed into the same shapes and merged before validation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `config.toml`: process-wide system settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SystemDoc {
    pub engine: Option<String>,
    pub repos: Option<Vec<String>>,
    pub update_hosts_file: Option<bool>,
    pub proxy: Option<ProxyDoc>,
    pub performance: Option<PerformanceDoc>,
    pub timeouts: Option<TimeoutsDoc>,
    pub variables: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxyDoc {
    pub url: Option<String>,
    pub autostart: Option<bool>,
    pub autostart_restrict: Option<Vec<String>>,
    pub ports: Option<ProxyPortsDoc>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxyPortsDoc {
    pub http: Option<i64>,
    pub https: Option<HttpsPortDoc>,
}

/// `https = 443` or `https = false`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum HttpsPortDoc {
    Port(i64),
    Toggle(bool),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PerformanceDoc {
    pub dont_sync_named_volumes_with_host: Option<FlagDoc>,
    pub dont_sync_unimportant_src: Option<FlagDoc>,
}

/// `true`, `false` or `"auto"`; any other string is reported by validation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FlagDoc {
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsDoc {
    pub start_secs: Option<i64>,
    pub stop_secs: Option<i64>,
    pub readiness_secs: Option<i64>,
    pub hook_secs: Option<i64>,
    pub poll_interval_ms: Option<i64>,
}

/// `riptide.toml` and `riptide.local.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectDoc {
    pub name: Option<String>,
    pub src: Option<String>,
    pub links: Option<Vec<String>>,
    pub default_services: Option<Vec<String>>,
    pub variables: Option<BTreeMap<String, String>>,
    pub app: Option<AppDoc>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppDoc {
    pub extends: Option<String>,
    pub name: Option<String>,
    pub unimportant_paths: Option<Vec<String>>,
    pub variables: Option<BTreeMap<String, String>>,
    pub services: Option<BTreeMap<String, ServiceDoc>>,
    pub commands: Option<BTreeMap<String, CommandDoc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceDoc {
    pub extends: Option<String>,
    pub roles: Option<Vec<String>>,
    pub image: Option<String>,
    pub command: Option<ServiceCommandDoc>,
    pub port: Option<i64>,
    pub additional_ports: Option<Vec<AdditionalPortDoc>>,
    pub volumes: Option<Vec<VolumeDoc>>,
    pub environment: Option<BTreeMap<String, String>>,
    pub working_directory: Option<String>,
    pub run_as_root: Option<bool>,
    pub dont_create_user: Option<bool>,
    pub pre_start: Option<Vec<String>>,
    pub post_start: Option<Vec<String>>,
    pub logging: Option<LoggingDoc>,
    pub additional_subdomains: Option<Vec<String>>,
    pub optional: Option<bool>,
    pub depends_on: Option<Vec<String>>,
    pub ready_label: Option<String>,
    pub allow_full_memlock: Option<bool>,
    pub driver: Option<DriverDoc>,
    pub config: Option<BTreeMap<String, ConfigFileDoc>>,
    pub variables: Option<BTreeMap<String, String>>,
}

/// Template file rendered with the service's variables before it starts.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileDoc {
    /// Path relative to the project folder or an extended repository file.
    pub from: Option<String>,
    /// Container path; relative paths are below `/src`.
    pub to: Option<String>,
}

/// A single command line, or named command groups with a `default` entry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServiceCommandDoc {
    Single(String),
    Groups(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AdditionalPortDoc {
    pub title: Option<String>,
    pub container: i64,
    pub host: Option<i64>,
    pub host_start: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VolumeDoc {
    pub host: String,
    pub container: String,
    pub mode: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub volume_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingDoc {
    pub stdout: Option<bool>,
    pub stderr: Option<bool>,
    pub paths: Option<BTreeMap<String, String>>,
    pub commands: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DriverDoc {
    pub name: Option<String>,
    pub config: Option<toml::Table>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandDoc {
    pub extends: Option<String>,
    pub image: Option<String>,
    pub command: Option<String>,
    pub aliases: Option<String>,
    pub in_service_with_role: Option<String>,
    pub volumes: Option<Vec<VolumeDoc>>,
    pub environment: Option<BTreeMap<String, String>>,
    pub working_directory: Option<String>,
    pub use_host_network: Option<bool>,
    pub variables: Option<BTreeMap<String, String>>,
}

/// Parse one TOML document, keeping the message of the first decode error.
pub fn parse_document<T: DeserializeOwned>(input: &str) -> Result<T, toml::de::Error> {
    toml::from_str(input)
}

/// Built-in system layer that every user `config.toml` is merged onto.
pub fn default_system_doc() -> SystemDoc {
    SystemDoc {
        engine: Some("docker".to_owned()),
        repos: Some(Vec::new()),
        update_hosts_file: Some(true),
        proxy: Some(ProxyDoc {
            url: Some("riptide.local".to_owned()),
            autostart: Some(true),
            autostart_restrict: None,
            ports: Some(ProxyPortsDoc {
                http: Some(80),
                https: Some(HttpsPortDoc::Port(443)),
            }),
        }),
        performance: Some(PerformanceDoc {
            dont_sync_named_volumes_with_host: Some(FlagDoc::Text("auto".to_owned())),
            dont_sync_unimportant_src: Some(FlagDoc::Text("auto".to_owned())),
        }),
        timeouts: Some(TimeoutsDoc {
            start_secs: Some(120),
            stop_secs: Some(30),
            readiness_secs: Some(60),
            hook_secs: Some(300),
            poll_interval_ms: Some(250),
        }),
        variables: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_project() {
        let input = r#"
name = "shop"
src = "code"
default_services = ["www"]

[variables]
php_version = "8.3"

[app]
name = "shop-app"
unimportant_paths = ["vendor", "node_modules"]

[app.services.www]
roles = ["main", "src"]
image = "php:${php_version}"
port = 8080
pre_start = ["touch /data/ready"]

[[app.services.www.additional_ports]]
title = "Xdebug"
container = 9003

[[app.services.www.volumes]]
host = "$volume_path/data"
container = "/data"
mode = "rw"
type = "directory"

[app.services.db]
roles = ["db"]
image = "mariadb:11"

[app.services.db.driver]
name = "mysql"
config = { password = "secret" }

[app.commands.php]
image = "php:8.3"
command = "php"

[app.commands.p]
aliases = "php"
"#;
        let doc: ProjectDoc = parse_document(input).expect("should parse");
        assert_eq!(doc.name.as_deref(), Some("shop"));
        let app = doc.app.unwrap();
        let services = app.services.unwrap();
        let www = &services["www"];
        assert_eq!(www.port, Some(8080));
        assert_eq!(www.additional_ports.as_ref().unwrap()[0].container, 9003);
        assert_eq!(
            www.volumes.as_ref().unwrap()[0].kind.as_deref(),
            Some("directory")
        );
        assert_eq!(services["db"].driver.as_ref().unwrap().name.as_deref(), Some("mysql"));
        assert_eq!(app.commands.unwrap()["p"].aliases.as_deref(), Some("php"));
    }

    #[test]
    fn command_groups_parse_as_map() {
        let input = r#"
[app.services.www]
image = "nginx"
command = { default = "nginx", debug = "nginx-debug" }
"#;
        let doc: ProjectDoc = parse_document(input).unwrap();
        let command = doc.app.unwrap().services.unwrap()["www"].command.clone();
        match command {
            Some(ServiceCommandDoc::Groups(groups)) => assert_eq!(groups["debug"], "nginx-debug"),
            other => panic!("unexpected command form: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = r#"
[app.services.www]
image = "nginx"
restart_policy = "always"
"#;
        assert!(parse_document::<ProjectDoc>(input).is_err());
    }

    #[test]
    fn https_accepts_port_or_false() {
        let doc: SystemDoc = parse_document("[proxy.ports]\nhttps = false\n").unwrap();
        assert_eq!(
            doc.proxy.unwrap().ports.unwrap().https,
            Some(HttpsPortDoc::Toggle(false))
        );
        let doc: SystemDoc = parse_document("[proxy.ports]\nhttps = 8443\n").unwrap();
        assert_eq!(
            doc.proxy.unwrap().ports.unwrap().https,
            Some(HttpsPortDoc::Port(8443))
        );
    }

    #[test]
    fn performance_flags_accept_bool_and_text() {
        let doc: SystemDoc = parse_document(
            "[performance]\ndont_sync_named_volumes_with_host = true\ndont_sync_unimportant_src = \"auto\"\n",
        )
        .unwrap();
        let perf = doc.performance.unwrap();
        assert_eq!(perf.dont_sync_named_volumes_with_host, Some(FlagDoc::Bool(true)));
        assert_eq!(
            perf.dont_sync_unimportant_src,
            Some(FlagDoc::Text("auto".to_owned()))
        );
    }
}
