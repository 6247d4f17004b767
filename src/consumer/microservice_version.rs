use std::sync::Arc;

use crate::registry::microservice::Microservice;
use crate::version::Version;

/// 一个具体的服务 ID 及其版本
#[derive(Debug, Clone)]
pub struct MicroserviceVersion {
    service_id: String,
    version: Version,
    microservice: Arc<Microservice>,
}

impl MicroserviceVersion {
    pub fn new(microservice: Microservice) -> crate::error::Result<Self> {
        let version = microservice.parsed_version()?;
        Ok(Self {
            service_id: microservice.service_id.clone(),
            version,
            microservice: Arc::new(microservice),
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn microservice(&self) -> &Arc<Microservice> {
        &self.microservice
    }
}
