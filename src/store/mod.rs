//! Persistence of configured devices and driver metadata.

use crate::error::{BridgeError, Result};
use crate::model::DriverMetadata;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, OnceCell, RwLock};

pub const CONFIGURATION_FILE: &str = "configured_entities.json";

/// One configured physical device. Driver-specific settings ride along in
/// `extra` and are persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationItem {
    pub host: String,
    pub entity_id: String,
    pub entity_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigurationItem {
    pub fn new(
        host: impl Into<String>,
        entity_id: impl Into<String>,
        entity_name: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            device_id: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfiguration {
    #[serde(default)]
    pub entities: Vec<ConfigurationItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_handling_wait_time_in_seconds: Option<f64>,
}

impl IntegrationConfiguration {
    pub fn find(&self, entity_id: &str) -> Option<&ConfigurationItem> {
        self.entities
            .iter()
            .find(|e| e.entity_id.eq_ignore_ascii_case(entity_id))
    }
}

/// Selects configuration items for removal. A field that is `None` never
/// matches anything.
#[derive(Debug, Clone, Default)]
pub struct RemoveInstruction {
    pub device_id: Option<String>,
    pub entity_ids: Option<Vec<String>>,
    pub host: Option<String>,
}

impl RemoveInstruction {
    pub fn matches(&self, item: &ConfigurationItem) -> bool {
        let by_device = match (&item.device_id, &self.device_id) {
            (Some(have), Some(want)) => have == want,
            _ => false,
        };
        let by_entity = self.entity_ids.as_ref().is_some_and(|ids| {
            ids.iter()
                .any(|id| id.eq_ignore_ascii_case(&item.entity_id))
        });
        let by_host = self
            .host
            .as_ref()
            .is_some_and(|host| host.eq_ignore_ascii_case(&item.host));
        by_device || by_entity || by_host
    }
}

pub type ConfigurationEdit = Box<dyn FnOnce(&mut IntegrationConfiguration) + Send>;

#[async_trait]
pub trait ConfigurationService: Send + Sync {
    async fn get_configuration(&self) -> Result<IntegrationConfiguration>;

    /// Replaces the stored configuration wholesale.
    async fn update_configuration(
        &self,
        configuration: IntegrationConfiguration,
    ) -> Result<IntegrationConfiguration>;

    /// Read-modify-write under the store's single writer lock.
    async fn modify(&self, edit: ConfigurationEdit) -> Result<IntegrationConfiguration>;

    async fn get_driver_metadata(&self) -> Result<DriverMetadata>;

    async fn remove(&self, instruction: RemoveInstruction) -> Result<IntegrationConfiguration> {
        self.modify(Box::new(move |configuration| {
            configuration.entities.retain(|item| {
                let remove = instruction.matches(item);
                if remove {
                    tracing::info!(entity_id = %item.entity_id, host = %item.host, "removing configured entity");
                }
                !remove
            });
        }))
        .await
    }
}

/// Stores `configured_entities.json` under the integration's config home.
pub struct FileConfigurationService {
    configuration_path: PathBuf,
    metadata_path: PathBuf,
    cache: RwLock<Option<IntegrationConfiguration>>,
    write_lock: Mutex<()>,
    metadata: OnceCell<DriverMetadata>,
}

impl FileConfigurationService {
    pub fn new(config_home: impl AsRef<Path>, metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            configuration_path: config_home.as_ref().join(CONFIGURATION_FILE),
            metadata_path: metadata_path.into(),
            cache: RwLock::new(None),
            write_lock: Mutex::new(()),
            metadata: OnceCell::new(),
        }
    }

    pub fn configuration_path(&self) -> &Path {
        &self.configuration_path
    }

    async fn load_or_create(&self) -> Result<IntegrationConfiguration> {
        match tokio::fs::read(&self.configuration_path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|err| BridgeError::StoreDecode(err.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let empty = IntegrationConfiguration::default();
                self.write_file(&empty).await?;
                tracing::info!(path = %self.configuration_path.display(), "created empty configuration");
                Ok(empty)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write_file(&self, configuration: &IntegrationConfiguration) -> Result<()> {
        if let Some(parent) = self.configuration_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_vec_pretty(configuration)?;
        tokio::fs::write(&self.configuration_path, data).await?;
        Ok(())
    }

    async fn cached_or_load(&self) -> Result<IntegrationConfiguration> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let configuration = self.load_or_create().await?;
        *self.cache.write().await = Some(configuration.clone());
        Ok(configuration)
    }
}

#[async_trait]
impl ConfigurationService for FileConfigurationService {
    async fn get_configuration(&self) -> Result<IntegrationConfiguration> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let _guard = self.write_lock.lock().await;
        self.cached_or_load().await
    }

    async fn update_configuration(
        &self,
        configuration: IntegrationConfiguration,
    ) -> Result<IntegrationConfiguration> {
        let _guard = self.write_lock.lock().await;
        self.write_file(&configuration).await?;
        *self.cache.write().await = Some(configuration.clone());
        Ok(configuration)
    }

    async fn modify(&self, edit: ConfigurationEdit) -> Result<IntegrationConfiguration> {
        let _guard = self.write_lock.lock().await;
        let mut configuration = self.cached_or_load().await?;
        edit(&mut configuration);
        self.write_file(&configuration).await?;
        *self.cache.write().await = Some(configuration.clone());
        Ok(configuration)
    }

    async fn get_driver_metadata(&self) -> Result<DriverMetadata> {
        let metadata = self
            .metadata
            .get_or_try_init(|| async {
                let raw = tokio::fs::read(&self.metadata_path).await?;
                serde_json::from_slice::<DriverMetadata>(&raw)
                    .map_err(|err| BridgeError::StoreDecode(err.to_string()))
            })
            .await?;
        Ok(metadata.clone())
    }
}

/// Volatile store for embedding and tests.
pub struct MemoryConfigurationService {
    configuration: Mutex<IntegrationConfiguration>,
    metadata: DriverMetadata,
}

impl MemoryConfigurationService {
    pub fn new(configuration: IntegrationConfiguration, metadata: DriverMetadata) -> Self {
        Self {
            configuration: Mutex::new(configuration),
            metadata,
        }
    }
}

#[async_trait]
impl ConfigurationService for MemoryConfigurationService {
    async fn get_configuration(&self) -> Result<IntegrationConfiguration> {
        Ok(self.configuration.lock().await.clone())
    }

    async fn update_configuration(
        &self,
        configuration: IntegrationConfiguration,
    ) -> Result<IntegrationConfiguration> {
        *self.configuration.lock().await = configuration.clone();
        Ok(configuration)
    }

    async fn modify(&self, edit: ConfigurationEdit) -> Result<IntegrationConfiguration> {
        let mut guard = self.configuration.lock().await;
        edit(&mut *guard);
        Ok(guard.clone())
    }

    async fn get_driver_metadata(&self) -> Result<DriverMetadata> {
        Ok(self.metadata.clone())
    }
}
