//! Layer merging for raw documents.
//!
//! `base.merge(overlay)` returns the overlay applied on top of the base:
//! scalars and plain lists from the overlay replace the base, mappings merge
//! per key (nested documents recursively), and the additional ports and
//! volumes of a service accumulate across layers, keyed by their container
//! side.

use crate::document::{
    AdditionalPortDoc, AppDoc, CommandDoc, ConfigFileDoc, DriverDoc, FlagDoc, HttpsPortDoc,
    LoggingDoc, PerformanceDoc, ProjectDoc, ProxyDoc, ProxyPortsDoc, ServiceCommandDoc,
    ServiceDoc, SystemDoc, TimeoutsDoc, VolumeDoc,
};
use std::collections::BTreeMap;

pub trait Merge: Sized {
    #[must_use]
    fn merge(self, overlay: Self) -> Self;
}

macro_rules! replace_on_merge {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Merge for $ty {
                fn merge(self, overlay: Self) -> Self {
                    overlay
                }
            }
        )*
    };
}

replace_on_merge!(
    String,
    bool,
    i64,
    FlagDoc,
    HttpsPortDoc,
    ServiceCommandDoc,
    toml::Value
);

impl<T> Merge for Vec<T> {
    fn merge(self, overlay: Self) -> Self {
        overlay
    }
}

impl<V: Merge> Merge for BTreeMap<String, V> {
    fn merge(mut self, overlay: Self) -> Self {
        for (key, value) in overlay {
            let merged = match self.remove(&key) {
                Some(base) => base.merge(value),
                None => value,
            };
            self.insert(key, merged);
        }
        self
    }
}

impl Merge for toml::Table {
    fn merge(mut self, overlay: Self) -> Self {
        for (key, value) in overlay {
            let merged = match (self.remove(&key), value) {
                (Some(toml::Value::Table(base)), toml::Value::Table(over)) => {
                    toml::Value::Table(base.merge(over))
                }
                (_, over) => over,
            };
            self.insert(key, merged);
        }
        self
    }
}

impl<T: Merge> Merge for Option<T> {
    fn merge(self, overlay: Self) -> Self {
        match (self, overlay) {
            (Some(base), Some(over)) => Some(base.merge(over)),
            (base, None) => base,
            (None, over) => over,
        }
    }
}

/// Append overlay entries to the base; an overlay entry with an existing key
/// replaces the base entry in place.
pub fn merge_keyed_list<T, K, F>(
    base: Option<Vec<T>>,
    overlay: Option<Vec<T>>,
    key: F,
) -> Option<Vec<T>>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    match (base, overlay) {
        (Some(mut base), Some(overlay)) => {
            for entry in overlay {
                let k = key(&entry);
                match base.iter().position(|existing| key(existing) == k) {
                    Some(idx) => base[idx] = entry,
                    None => base.push(entry),
                }
            }
            Some(base)
        }
        (base, None) => base,
        (None, overlay) => overlay,
    }
}

impl Merge for SystemDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            engine: self.engine.merge(o.engine),
            repos: self.repos.merge(o.repos),
            update_hosts_file: self.update_hosts_file.merge(o.update_hosts_file),
            proxy: self.proxy.merge(o.proxy),
            performance: self.performance.merge(o.performance),
            timeouts: self.timeouts.merge(o.timeouts),
            variables: self.variables.merge(o.variables),
        }
    }
}

impl Merge for ProxyDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            url: self.url.merge(o.url),
            autostart: self.autostart.merge(o.autostart),
            autostart_restrict: self.autostart_restrict.merge(o.autostart_restrict),
            ports: self.ports.merge(o.ports),
        }
    }
}

impl Merge for ProxyPortsDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            http: self.http.merge(o.http),
            https: self.https.merge(o.https),
        }
    }
}

impl Merge for PerformanceDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            dont_sync_named_volumes_with_host: self
                .dont_sync_named_volumes_with_host
                .merge(o.dont_sync_named_volumes_with_host),
            dont_sync_unimportant_src: self
                .dont_sync_unimportant_src
                .merge(o.dont_sync_unimportant_src),
        }
    }
}

impl Merge for TimeoutsDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            start_secs: self.start_secs.merge(o.start_secs),
            stop_secs: self.stop_secs.merge(o.stop_secs),
            readiness_secs: self.readiness_secs.merge(o.readiness_secs),
            hook_secs: self.hook_secs.merge(o.hook_secs),
            poll_interval_ms: self.poll_interval_ms.merge(o.poll_interval_ms),
        }
    }
}

impl Merge for ProjectDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            name: self.name.merge(o.name),
            src: self.src.merge(o.src),
            links: self.links.merge(o.links),
            default_services: self.default_services.merge(o.default_services),
            variables: self.variables.merge(o.variables),
            app: self.app.merge(o.app),
        }
    }
}

impl Merge for AppDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            extends: self.extends.merge(o.extends),
            name: self.name.merge(o.name),
            unimportant_paths: self.unimportant_paths.merge(o.unimportant_paths),
            variables: self.variables.merge(o.variables),
            services: self.services.merge(o.services),
            commands: self.commands.merge(o.commands),
        }
    }
}

impl Merge for ServiceDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            extends: self.extends.merge(o.extends),
            roles: self.roles.merge(o.roles),
            image: self.image.merge(o.image),
            command: self.command.merge(o.command),
            port: self.port.merge(o.port),
            additional_ports: merge_keyed_list(
                self.additional_ports,
                o.additional_ports,
                |p: &AdditionalPortDoc| p.container,
            ),
            volumes: merge_keyed_list(self.volumes, o.volumes, |v: &VolumeDoc| {
                v.container.clone()
            }),
            environment: self.environment.merge(o.environment),
            working_directory: self.working_directory.merge(o.working_directory),
            run_as_root: self.run_as_root.merge(o.run_as_root),
            dont_create_user: self.dont_create_user.merge(o.dont_create_user),
            pre_start: self.pre_start.merge(o.pre_start),
            post_start: self.post_start.merge(o.post_start),
            logging: self.logging.merge(o.logging),
            additional_subdomains: self.additional_subdomains.merge(o.additional_subdomains),
            optional: self.optional.merge(o.optional),
            depends_on: self.depends_on.merge(o.depends_on),
            ready_label: self.ready_label.merge(o.ready_label),
            allow_full_memlock: self.allow_full_memlock.merge(o.allow_full_memlock),
            driver: self.driver.merge(o.driver),
            config: self.config.merge(o.config),
            variables: self.variables.merge(o.variables),
        }
    }
}

impl Merge for ConfigFileDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            from: self.from.merge(o.from),
            to: self.to.merge(o.to),
        }
    }
}

impl Merge for LoggingDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            stdout: self.stdout.merge(o.stdout),
            stderr: self.stderr.merge(o.stderr),
            paths: self.paths.merge(o.paths),
            commands: self.commands.merge(o.commands),
        }
    }
}

impl Merge for DriverDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            name: self.name.merge(o.name),
            config: self.config.merge(o.config),
        }
    }
}

impl Merge for CommandDoc {
    fn merge(self, o: Self) -> Self {
        Self {
            extends: self.extends.merge(o.extends),
            image: self.image.merge(o.image),
            command: self.command.merge(o.command),
            aliases: self.aliases.merge(o.aliases),
            in_service_with_role: self.in_service_with_role.merge(o.in_service_with_role),
            volumes: self.volumes.merge(o.volumes),
            environment: self.environment.merge(o.environment),
            working_directory: self.working_directory.merge(o.working_directory),
            use_host_network: self.use_host_network.merge(o.use_host_network),
            variables: self.variables.merge(o.variables),
        }
    }
}
