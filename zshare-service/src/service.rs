// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use serde::Serialize;
use zbus::message::Header as MessageHeader;
use zbus::{Connection, interface};

use zshare_reconcile::Supervisor;
use zshare_types::{ConfigEvent, EventKey};

use crate::auth::{ACTION_MODIFY, ACTION_READ, TrustedCallers, require_authorization};
use crate::error::{Result, ServiceError};

pub const BUS_NAME: &str = "org.zshare.Reconciler";
pub const OBJECT_PATH: &str = "/org/zshare/Reconciler";

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn parse_key(key: &str) -> Result<EventKey> {
    EventKey::parse(key).ok_or_else(|| ServiceError::InvalidArgument(format!("invalid key {key:?}")))
}

/// Event ingestion and operator status over D-Bus.
///
/// Publish and Resync need [`ACTION_MODIFY`], Drift needs [`ACTION_READ`].
pub struct ReconcilerService {
    supervisor: Arc<Supervisor>,
    trusted: TrustedCallers,
    version: String,
}

impl ReconcilerService {
    pub fn new(supervisor: Arc<Supervisor>, trusted: TrustedCallers) -> Self {
        Self {
            supervisor,
            trusted,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn publish_json(&self, event_json: &str) -> Result<String> {
        let event: ConfigEvent = serde_json::from_str(event_json)
            .map_err(|e| ServiceError::InvalidArgument(format!("malformed event: {e}")))?;
        event.payload.validate().map_err(ServiceError::InvalidArgument)?;
        let id = event.id.to_string();
        tracing::debug!(
            "Received {:?} event {} for {} (sequence {})",
            event.kind(),
            id,
            event.key(),
            event.sequence
        );
        self.supervisor.publish(event)?;
        Ok(id)
    }

    fn status_json(&self, key: &str) -> Result<String> {
        let key = parse_key(key)?;
        let status = self
            .supervisor
            .key_status(&key)
            .ok_or_else(|| ServiceError::UnknownKey(key.to_string()))?;
        to_json(&status)
    }

    async fn resync_json(&self, key: &str) -> Result<String> {
        let summary = if key.trim().is_empty() {
            self.supervisor.resync_all().await
        } else {
            self.supervisor.resync(&parse_key(key)?).await
        };
        to_json(&summary)
    }
}

#[interface(name = "org.zshare.Reconciler")]
impl ReconcilerService {
    /// Queue a configuration event given as JSON; returns the event id
    async fn publish(
        &self,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
        event_json: &str,
    ) -> zbus::fdo::Result<String> {
        require_authorization(connection, &header, &self.trusted, ACTION_MODIFY).await?;
        Ok(self.publish_json(event_json)?)
    }

    /// Status record of one key (`service`, `pool:<name>` or a dataset name)
    async fn status(&self, key: &str) -> zbus::fdo::Result<String> {
        Ok(self.status_json(key)?)
    }

    /// Status records of every known key
    async fn status_all(&self) -> zbus::fdo::Result<String> {
        Ok(to_json(&self.supervisor.all_status())?)
    }

    /// Clear failures and reconverge a key; an empty key covers everything
    async fn resync(
        &self,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
        key: &str,
    ) -> zbus::fdo::Result<String> {
        require_authorization(connection, &header, &self.trusted, ACTION_MODIFY).await?;
        tracing::info!("Operator resync requested for {:?}", key);
        Ok(self.resync_json(key).await?)
    }

    /// Compare the model with a fresh backend scan
    async fn drift(
        &self,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> zbus::fdo::Result<String> {
        require_authorization(connection, &header, &self.trusted, ACTION_READ).await?;
        let report = self
            .supervisor
            .detect_drift()
            .await
            .map_err(ServiceError::from)?;
        Ok(to_json(&report)?)
    }

    #[zbus(property)]
    async fn version(&self) -> &str {
        &self.version
    }

    #[zbus(property)]
    async fn service_enabled(&self) -> bool {
        self.supervisor.model().read().service_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use zshare_reconcile::{DryRunBackend, SupervisorConfig};
    use zshare_types::KeyState;

    use crate::store::TomlConfigStore;

    async fn started(dir: &tempfile::TempDir) -> ReconcilerService {
        let declared = dir.path().join("shares.toml");
        std::fs::write(
            &declared,
            "[[shares]]\ndataset = \"tank/media\"\nexport = \"media\"\nclient = \"*\"\n",
        )
        .unwrap();

        let supervisor = Supervisor::new(
            Arc::new(DryRunBackend::new()),
            Arc::new(TomlConfigStore::new(declared)),
            SupervisorConfig::default(),
        );
        supervisor.start().await.unwrap();
        ReconcilerService::new(Arc::new(supervisor), TrustedCallers::default())
    }

    #[tokio::test]
    async fn publish_queues_events_and_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let service = started(&dir).await;

        let id = service
            .publish_json(
                r#"{"sequence": 1, "type": "share_created", "dataset": {"pool": "tank", "path": "media"},
                    "export": "guests", "options": {"client": "192.168.1.0/24"}}"#,
            )
            .unwrap();
        assert!(!id.is_empty());
        service.supervisor.bus().wait_idle().await;

        let status: zshare_types::KeyStatus =
            serde_json::from_str(&service.status_json("tank/media").unwrap()).unwrap();
        assert_eq!(status.state, KeyState::Idle);
        assert_eq!(status.last_sequence, Some(1));

        let model = service.supervisor.model().read();
        let dataset = model.dataset(&zshare_types::DatasetKey::new("tank", "media")).unwrap();
        assert_eq!(dataset.bindings.len(), 2);
    }

    #[tokio::test]
    async fn rejects_malformed_input() {
        let dir = tempfile::tempdir().unwrap();
        let service = started(&dir).await;

        assert!(matches!(
            service.publish_json("{\"type\": \"share_created\"}"),
            Err(ServiceError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.publish_json(
                r#"{"sequence": 1, "type": "share_created", "dataset": {"pool": "tank", "path": "media"},
                    "export": "guests", "options": {"client": "10.0.0.1(ro)\n/ *"}}"#,
            ),
            Err(ServiceError::InvalidArgument(_))
        ));
        assert_eq!(service.supervisor.bus().in_flight(), 0);
        assert!(matches!(
            service.status_json("pool:"),
            Err(ServiceError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.status_json("tank/unknown"),
            Err(ServiceError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn resync_with_empty_key_covers_all_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let service = started(&dir).await;

        let summary: serde_json::Value =
            serde_json::from_str(&service.resync_json("").await.unwrap()).unwrap();
        assert_eq!(summary["converged"], 1);
        assert_eq!(summary["failed"].as_array().map(Vec::len), Some(0));
    }
}
