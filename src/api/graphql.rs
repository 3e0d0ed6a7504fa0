use async_graphql::{Context, EmptySubscription, Object, Schema};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::domain::fleet_service::FleetService;
use crate::domain::monitoring::{Accident, AccidentQuery, Page, Ping, Stat};
use crate::domain::node::NodeView;
use crate::error::{FleetError, StoreError};
use crate::mesh::{MeshReport, MeshStatus};

pub type TrellisSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

fn gql_error(err: FleetError) -> async_graphql::Error {
    async_graphql::Error::new(err.to_string())
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn nodes(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<NodeView>> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.list_nodes().await.map_err(gql_error)
    }

    /// A single node, or null when the id is unknown.
    async fn node(&self, ctx: &Context<'_>, id: String) -> async_graphql::Result<Option<NodeView>> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        match fleet.get_node(&id).await {
            Ok(node) => Ok(Some(node)),
            Err(FleetError::Store(StoreError::NotFound(_))) => Ok(None),
            Err(e) => Err(gql_error(e)),
        }
    }

    async fn stats(
        &self,
        ctx: &Context<'_>,
        node_id: String,
        limit: Option<usize>,
    ) -> async_graphql::Result<Vec<Stat>> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.stats(&node_id, limit).await.map_err(gql_error)
    }

    async fn pings(
        &self,
        ctx: &Context<'_>,
        node_id: String,
        limit: Option<usize>,
    ) -> async_graphql::Result<Vec<Ping>> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.pings(&node_id, limit).await.map_err(gql_error)
    }

    #[allow(clippy::too_many_arguments)]
    async fn accidents(
        &self,
        ctx: &Context<'_>,
        node_id: Option<String>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        resolved: Option<bool>,
        page: Option<usize>,
        page_size: Option<usize>,
    ) -> async_graphql::Result<Page<Accident>> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        let query = AccidentQuery {
            node_id,
            since,
            until,
            resolved,
            page,
            page_size,
        };
        fleet.accidents(&query).await.map_err(gql_error)
    }

    async fn mesh_status(&self, ctx: &Context<'_>) -> async_graphql::Result<MeshStatus> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        Ok(fleet.mesh_status().await)
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Start provisioning in the background. Returns true once scheduled.
    async fn provision_node(&self, ctx: &Context<'_>, id: String) -> async_graphql::Result<bool> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.start_provisioning(&id).await.map_err(gql_error)?;
        Ok(true)
    }

    async fn retry_connection(
        &self,
        ctx: &Context<'_>,
        id: String,
    ) -> async_graphql::Result<NodeView> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.retry_connection(&id).await.map_err(gql_error)
    }

    async fn sync_mesh(&self, ctx: &Context<'_>) -> async_graphql::Result<MeshReport> {
        let fleet = ctx.data::<Arc<FleetService>>()?;
        fleet.sync_mesh().await.map_err(gql_error)
    }
}

pub fn build_schema(fleet: Arc<FleetService>) -> TrellisSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(fleet)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fleet_service::testing;
    use crate::domain::node::fixtures;
    use crate::store::NodeRepository;

    #[tokio::test]
    async fn queries_nodes_without_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _state, fleet) = testing::fleet(dir.path());
        store.create(fixtures::node("a", "203.0.113.1")).await.unwrap();
        let schema = build_schema(Arc::new(fleet));

        let response = schema
            .execute(r#"{ nodes { id name connection hasPassword } node(id: "missing") { id } }"#)
            .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);

        let data = response.data.into_json().unwrap();
        assert_eq!(data["nodes"][0]["id"], "a");
        assert_eq!(data["nodes"][0]["connection"], "CONNECTED");
        assert_eq!(data["nodes"][0]["hasPassword"], true);
        assert!(data["node"].is_null());
        assert!(!data.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn provisioning_a_disconnected_node_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _state, fleet) = testing::fleet(dir.path());
        let mut node = fixtures::node("a", "203.0.113.1");
        node.connection = crate::domain::node::ConnectionStatus::Disconnected;
        store.create(node).await.unwrap();
        let schema = build_schema(Arc::new(fleet));

        let response = schema.execute(r#"mutation { provisionNode(id: "a") }"#).await;
        assert_eq!(response.errors.len(), 1);
        assert!(response.errors[0].message.contains("not connected"));
    }
}
