use std::ops::Deref;

use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

use super::{schema, types::StoredObject};
use crate::{config::AppConfig, error::GraphRagError};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;
        db.signin(Root { username, password }).await?;
        db.use_ns(namespace).use_db(database).await?;
        Ok(SurrealDbClient { client: db })
    }

    pub async fn connect(config: &AppConfig) -> Result<Self, Error> {
        Self::new(
            &config.graph_store_address,
            &config.graph_store_username,
            &config.graph_store_password,
            &config.graph_store_namespace,
            &config.graph_store_database,
        )
        .await
    }

    /// Defines constraints and search/vector indexes for the node and
    /// relationship tables. Safe to call repeatedly.
    pub async fn ensure_schema(&self, embedding_dimension: usize) -> Result<(), GraphRagError> {
        schema::ensure_schema(self, embedding_dimension).await
    }

    /// Drops every index and analyzer the schema manager defines, including
    /// dynamically discovered property indexes.
    pub async fn clear_schema(&self) -> Result<(), GraphRagError> {
        schema::clear_schema(self).await
    }

    /// Deletes every record from every table, leaving the schema in place.
    pub async fn clear_data(&self) -> Result<(), GraphRagError> {
        schema::clear_data(self).await
    }

    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;
        db.use_ns(namespace).use_db(database).await?;
        Ok(SurrealDbClient { client: db })
    }
}
