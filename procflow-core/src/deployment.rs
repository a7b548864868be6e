//! Deployments
//!
//! A deployment is a named set of resource blobs. Deploying parses each
//! resource into definition models, assigns the next version per key, and
//! persists definition records whose ids are never reused. Duplicate
//! filtering compares resource content hashes against the latest deployment
//! of the same name and turns identical redeploys into no-ops.

use crate::command::CommandContext;
use crate::error::EngineError;
use crate::graph::{self, DefinitionModel};
use crate::store::{DefinitionRecord, Deployment};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

/// Parses raw deployment resources into definition models. The built-in
/// parser consumes JSON-serialized [`DefinitionModel`]s; other formats plug
/// in behind this trait.
pub trait DefinitionParser: Send + Sync {
    fn parse(&self, resource_name: &str, bytes: &[u8])
        -> Result<Vec<DefinitionModel>, EngineError>;
}

pub struct JsonDefinitionParser;

impl DefinitionParser for JsonDefinitionParser {
    fn parse(
        &self,
        resource_name: &str,
        bytes: &[u8],
    ) -> Result<Vec<DefinitionModel>, EngineError> {
        if !resource_name.ends_with(".json") {
            return Ok(Vec::new());
        }
        let mut model: DefinitionModel = serde_json::from_slice(bytes).map_err(|err| {
            EngineError::InvalidModel(format!("resource '{resource_name}': {err}"))
        })?;
        graph::validate_and_index(&mut model)?;
        Ok(vec![model])
    }
}

#[derive(Clone, Debug)]
pub struct DeploymentBuilder {
    name: String,
    resources: BTreeMap<String, Vec<u8>>,
    filter_duplicates: bool,
}

impl DeploymentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: BTreeMap::new(),
            filter_duplicates: false,
        }
    }

    pub fn add_resource(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.resources.insert(name.into(), bytes);
        self
    }

    /// Serialize a built model as a `.json` resource.
    pub fn add_model(
        self,
        resource_name: impl Into<String>,
        model: &DefinitionModel,
    ) -> Result<Self, EngineError> {
        let bytes = serde_json::to_vec(model)
            .map_err(|err| EngineError::InvalidModel(err.to_string()))?;
        Ok(self.add_resource(resource_name, bytes))
    }

    /// Skip deploying when resource content matches the latest deployment of
    /// the same name.
    pub fn enable_duplicate_filtering(mut self) -> Self {
        self.filter_duplicates = true;
        self
    }
}

fn resources_digest(resources: &BTreeMap<String, Vec<u8>>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for (name, bytes) in resources {
        hasher.update(name.as_bytes());
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().into()
}

/// Deploy inside the caller's unit of work. Idempotent with duplicate
/// filtering enabled: redeploying unchanged content returns the existing
/// deployment without new rows.
pub(crate) async fn deploy(
    ctx: &mut CommandContext,
    builder: DeploymentBuilder,
) -> Result<Deployment, EngineError> {
    if builder.name.is_empty() {
        return Err(EngineError::illegal_argument("deployment name is empty"));
    }
    if builder.resources.is_empty() {
        return Err(EngineError::illegal_argument("deployment has no resources"));
    }

    if builder.filter_duplicates {
        if let Some(previous) = ctx
            .store()
            .latest_deployment_by_name(&builder.name)
            .await?
        {
            if resources_digest(&previous.resources) == resources_digest(&builder.resources) {
                debug!(deployment = %previous.id, "unchanged content, filtering duplicate deploy");
                return Ok(previous);
            }
        }
    }

    let deployment = Deployment {
        id: Uuid::now_v7().simple().to_string(),
        name: builder.name,
        resources: builder.resources,
        deployed_at: ctx.now(),
    };

    let parser = ctx.services().parser.clone();
    // Keys already versioned within this deployment, so two resources for
    // the same key get consecutive versions.
    let mut local_versions: HashMap<String, u32> = HashMap::new();
    for (resource_name, bytes) in &deployment.resources {
        for model in parser.parse(resource_name, bytes)? {
            let base = match local_versions.get(&model.key) {
                Some(version) => *version,
                None => ctx
                    .store()
                    .latest_definition_by_key(&model.key)
                    .await?
                    .map(|record| record.version)
                    .unwrap_or(0),
            };
            let version = base + 1;
            local_versions.insert(model.key.clone(), version);
            let record = DefinitionRecord {
                id: format!("{}:{}:{}", model.key, version, Uuid::now_v7().simple()),
                key: model.key.clone(),
                version,
                deployment_id: deployment.id.clone(),
                resource_name: resource_name.clone(),
                name: model.name.clone(),
            };
            info!(definition = %record.id, "deploying process definition");
            ctx.insert_definition(record);
        }
    }

    ctx.insert_deployment(deployment.clone());
    Ok(deployment)
}
