// Connection Management
// One configured database target: lifecycle, query execution and introspection

use crate::db::call::{Call, CallListener, CallOptions};
use crate::db::registry::AdapterRegistry;
use crate::db::traits::{Adapter, Column, DatabaseError, Driver, Structure, StructureType, TableOptions};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Connection configuration as stored by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Backend type, resolved through the [`AdapterRegistry`]
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl ConnectionParams {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind: kind.into(),
            url: url.into(),
        }
    }
}

/// A configured target plus, once connected, the live driver for it
pub struct Connection {
    /// Used to connect
    params: ConnectionParams,
    /// Handed back to callers and persisted
    unexpanded: ConnectionParams,
    adapter: Arc<dyn Adapter>,
    driver: RwLock<Option<Arc<dyn Driver>>>,
    call_options: CallOptions,
}

impl Connection {
    pub fn new(params: ConnectionParams, adapter: Arc<dyn Adapter>) -> Self {
        Self::with_expanded(params.clone(), params, adapter)
    }

    /// Connection whose URL had placeholders expanded by the caller.
    /// `expanded` is used to connect; `unexpanded` is what gets persisted.
    pub fn with_expanded(
        mut unexpanded: ConnectionParams,
        mut expanded: ConnectionParams,
        adapter: Arc<dyn Adapter>,
    ) -> Self {
        if expanded.id.is_empty() {
            expanded.id = if unexpanded.id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                unexpanded.id.clone()
            };
        }
        unexpanded.id = expanded.id.clone();

        Self {
            params: expanded,
            unexpanded,
            adapter,
            driver: RwLock::new(None),
            call_options: CallOptions::default(),
        }
    }

    /// Resolve the adapter for `params.kind` and build the connection
    pub fn from_registry(params: ConnectionParams, registry: &AdapterRegistry) -> Result<Self, DatabaseError> {
        let adapter = registry.resolve(&params.kind)?;
        Ok(Self::new(params, adapter))
    }

    /// Options given to every call created by this connection
    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.call_options = options;
        self
    }

    pub fn id(&self) -> &str {
        &self.params.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn kind(&self) -> &str {
        &self.params.kind
    }

    pub fn url(&self) -> &str {
        &self.params.url
    }

    /// The parameters as originally supplied, before expansion
    pub fn params(&self) -> &ConnectionParams {
        &self.unexpanded
    }

    /// Connect through the adapter. Does nothing when already connected.
    pub async fn connect(&self) -> Result<(), DatabaseError> {
        let mut driver = self.driver.write().await;
        if driver.is_some() {
            return Ok(());
        }

        let connected = self
            .adapter
            .connect(&self.params.url)
            .await
            .map_err(|e| e.context("adapter.connect"))?;
        *driver = Some(Arc::from(connected));

        info!(connection_id = %self.params.id, kind = %self.params.kind, "connected");
        Ok(())
    }

    /// Close the driver. Does nothing when not connected.
    pub async fn disconnect(&self) {
        let driver = self.driver.write().await.take();
        if let Some(driver) = driver {
            driver.close().await;
            info!(connection_id = %self.params.id, "disconnected");
        }
    }

    pub async fn close(&self) {
        self.disconnect().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.driver.read().await.is_some()
    }

    async fn driver(&self) -> Result<Arc<dyn Driver>, DatabaseError> {
        self.driver
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(DatabaseError::NotConnected)
    }

    /// Build an unexecuted call for `query`. Invalid input is rejected here,
    /// before any call exists.
    pub async fn prepare(&self, query: &str) -> Result<Arc<Call>, DatabaseError> {
        if query.trim().is_empty() {
            return Err(DatabaseError::Validation("empty query".to_string()));
        }
        let driver = self.driver().await?;

        let text = query.to_string();
        let call = Call::new(query, self.call_options.clone(), move |token| async move {
            driver.query(token, &text).await
        });
        debug!(connection_id = %self.params.id, call_id = %call.id(), "prepared call");
        Ok(Arc::new(call))
    }

    /// Start `query` with `listener` subscribed before the first transition
    pub async fn execute(
        &self,
        query: &str,
        listener: impl CallListener + 'static,
    ) -> Result<Arc<Call>, DatabaseError> {
        let call = self.prepare(query).await?;
        call.subscribe(listener);
        call.start()?;
        Ok(call)
    }

    /// Browsable schema tree; never empty
    pub async fn structure(&self) -> Result<Vec<Structure>, DatabaseError> {
        let driver = self.driver().await?;
        let structure = driver.structure().await?;

        if structure.is_empty() {
            return Ok(vec![Structure::new("no schema to show", "", StructureType::None)]);
        }
        Ok(structure)
    }

    pub async fn columns(&self, opts: Option<&TableOptions>) -> Result<Vec<Column>, DatabaseError> {
        let opts = opts.ok_or_else(|| DatabaseError::Validation("opts cannot be empty".to_string()))?;
        let driver = self.driver().await?;

        let columns = driver
            .columns(opts)
            .await
            .map_err(|e| e.context("driver.columns"))?;
        if columns.is_empty() {
            return Err(DatabaseError::SchemaError(
                "no column names found for specified opts".to_string(),
            ));
        }
        Ok(columns)
    }

    /// Switch the active database. On failure the previous one stays active.
    pub async fn select_database(&self, name: &str) -> Result<(), DatabaseError> {
        let driver = self.driver().await?;
        let switcher = driver.as_switcher().ok_or(DatabaseError::SwitchingNotSupported)?;

        switcher
            .select_database(name)
            .await
            .map_err(|e| e.context("switcher.select_database"))?;
        info!(connection_id = %self.params.id, database = name, "switched database");
        Ok(())
    }

    /// Current database and every database available to switch to
    pub async fn list_databases(&self) -> Result<(String, Vec<String>), DatabaseError> {
        let driver = self.driver().await?;
        let switcher = driver.as_switcher().ok_or(DatabaseError::SwitchingNotSupported)?;

        switcher
            .list_databases()
            .await
            .map_err(|e| e.context("switcher.list_databases"))
    }

    /// Helper queries for a table; default options when none are given
    pub fn helpers(&self, opts: Option<&TableOptions>) -> HashMap<String, String> {
        let default = TableOptions::default();
        self.adapter.helpers(opts.unwrap_or(&default))
    }
}

impl Serialize for Connection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.unexpanded.serialize(serializer)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.params.id)
            .field("name", &self.params.name)
            .field("kind", &self.params.kind)
            .finish()
    }
}
