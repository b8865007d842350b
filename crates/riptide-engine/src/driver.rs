//! Database-driver plugin boundary.
//!
//! A service with a `driver` section delegates database specifics to the
//! named driver: it validates the driver config, contributes mounts for the
//! data directory, extra published ports and container environment.

use crate::backend::Mount;
use riptide_schema::{AdditionalPort, Service};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("driver '{driver}': {message}")]
pub struct DriverError {
    pub driver: String,
    pub message: String,
}

impl DriverError {
    pub fn new(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            message: message.into(),
        }
    }
}

pub trait DatabaseDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Check the service's driver config before anything is started.
    fn validate_service(&self, service: &Service) -> Result<(), DriverError>;

    fn collect_volumes(&self, service: &Service) -> Vec<Mount>;

    /// Ports the database should publish. The service's own additional
    /// ports take precedence for the same container port.
    fn collect_additional_ports(&self, _service: &Service) -> Vec<AdditionalPort> {
        Vec::new()
    }

    fn collect_environment(&self, service: &Service) -> BTreeMap<String, String>;
}

#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn DatabaseDriver>) {
        self.drivers.insert(driver.name().to_owned(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DatabaseDriver>> {
        self.drivers.get(name).cloned()
    }

    /// Driver for `service`, `None` when it declares none.
    pub fn for_service(
        &self,
        service: &Service,
    ) -> Result<Option<Arc<dyn DatabaseDriver>>, DriverError> {
        let Some(config) = &service.driver else {
            return Ok(None);
        };
        self.get(&config.name)
            .map(Some)
            .ok_or_else(|| DriverError::new(&config.name, "no such driver is registered"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use riptide_schema::{DriverConfig, Logging, ServiceName};
    use std::path::PathBuf;

    fn db_service(driver: Option<&str>) -> Service {
        Service {
            name: ServiceName::new("db"),
            roles: Vec::new(),
            image: "mariadb".to_owned(),
            command: None,
            port: None,
            additional_ports: Vec::new(),
            volumes: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: None,
            run_as_root: false,
            dont_create_user: false,
            pre_start: Vec::new(),
            post_start: Vec::new(),
            logging: Logging::default(),
            additional_subdomains: Vec::new(),
            optional: false,
            depends_on: Vec::new(),
            ready_label: None,
            allow_full_memlock: false,
            driver: driver.map(|name| DriverConfig {
                name: name.to_owned(),
                config: toml::Table::new(),
            }),
            config: BTreeMap::new(),
            variables: BTreeMap::new(),
            domain: "shop--db.riptide.local".to_owned(),
            volume_path: PathBuf::from("/work/shop/_riptide/data/db"),
        }
    }

    #[test]
    fn service_without_driver_has_none() {
        let registry = DriverRegistry::new();
        assert!(registry.for_service(&db_service(None)).unwrap().is_none());
    }

    #[test]
    fn unknown_driver_is_an_error() {
        let registry = DriverRegistry::new();
        let err = registry
            .for_service(&db_service(Some("postgres")))
            .err()
            .unwrap();
        assert_eq!(err.driver, "postgres");
    }

    #[test]
    fn registered_driver_is_found() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(MockDriver::new("mysql")));
        let driver = registry
            .for_service(&db_service(Some("mysql")))
            .unwrap()
            .unwrap();
        assert_eq!(driver.name(), "mysql");
        assert_eq!(driver.collect_volumes(&db_service(Some("mysql"))).len(), 1);
    }
}
