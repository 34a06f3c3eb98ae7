// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Git manifest writer.
//!
//! Realizes managed objects as YAML documents in their environment's
//! repository. A file may hold several objects, separated by `---`; the
//! persistence layer's file index records which objects live where, so
//! paths are computed only the first time an object is placed.

use std::sync::Arc;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::git::GitRepository;
use crate::model::CommandType;
use crate::persistence::{EnvironmentRecord, ManagedObjectRecord, Persistence};

/// A commit produced by the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Commit sha.
    pub sha: String,
    /// Repository-relative file path.
    pub path: String,
}

/// Result of removing an object from the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The file was deleted or rewritten in this commit.
    Committed(WriteOutcome),
    /// The object was never placed in a file.
    Untracked,
}

/// Writes and removes object documents in environment repositories.
pub struct ManifestWriter {
    git: Arc<dyn GitRepository>,
    store: Arc<dyn Persistence>,
}

impl ManifestWriter {
    /// Create a writer.
    pub fn new(git: Arc<dyn GitRepository>, store: Arc<dyn Persistence>) -> Self {
        Self { git, store }
    }

    /// Default path of an object that is not indexed yet.
    pub fn default_path(object: &ManagedObjectRecord) -> String {
        format!("{}-{}.yaml", object.kind.file_prefix(), object.name)
    }

    /// Create or replace the object's document and commit.
    pub async fn write(
        &self,
        env: &EnvironmentRecord,
        object: &ManagedObjectRecord,
        document: &Value,
        operation: CommandType,
    ) -> Result<WriteOutcome> {
        let path = match self.store.get_file_resource(env.id, object.id).await? {
            Some(file) => file.file_path,
            None => Self::default_path(object),
        };

        let existing = self.git.read_file(&env.repository, &path).await?;
        let mut documents = match existing.as_deref() {
            Some(text) => split_documents(text)?,
            None => Vec::new(),
        };

        match documents
            .iter_mut()
            .find(|doc| describes(doc, object.manifest_kind(), &object.name))
        {
            Some(slot) => *slot = document.clone(),
            None => documents.push(document.clone()),
        }

        let content = join_documents(&documents)?;
        let message = format!("{} {} {}", operation, object.kind, object.name);
        let sha = self
            .git
            .write_file(&env.repository, &path, &content, &message)
            .await?;

        self.store
            .put_file_resource(env.id, &path, object.id)
            .await?;

        info!(
            env_id = env.id,
            object_id = object.id,
            path = %path,
            sha = %sha,
            "Manifest committed"
        );

        Ok(WriteOutcome { sha, path })
    }

    /// Remove the object's document. The file goes away with its last member.
    pub async fn delete(
        &self,
        env: &EnvironmentRecord,
        object: &ManagedObjectRecord,
    ) -> Result<DeleteOutcome> {
        let Some(file) = self.store.get_file_resource(env.id, object.id).await? else {
            debug!(object_id = object.id, "Object has no file, nothing to delete");
            return Ok(DeleteOutcome::Untracked);
        };

        let members = self
            .store
            .list_file_resources(env.id, &file.file_path)
            .await?;
        let others = members.iter().filter(|m| m.object_id != object.id).count();
        let message = format!("delete {} {}", object.kind, object.name);

        let sha = if others == 0 {
            self.git
                .delete_file(&env.repository, &file.file_path, &message)
                .await?
        } else {
            let text = self
                .git
                .read_file(&env.repository, &file.file_path)
                .await?
                .unwrap_or_default();
            let remaining: Vec<Value> = split_documents(&text)?
                .into_iter()
                .filter(|doc| !describes(doc, object.manifest_kind(), &object.name))
                .collect();
            let content = join_documents(&remaining)?;
            self.git
                .write_file(&env.repository, &file.file_path, &content, &message)
                .await?
        };

        self.store.remove_file_resource(env.id, object.id).await?;

        info!(
            env_id = env.id,
            object_id = object.id,
            path = %file.file_path,
            remaining = others,
            sha = %sha,
            "Manifest removed"
        );

        Ok(DeleteOutcome::Committed(WriteOutcome {
            sha,
            path: file.file_path,
        }))
    }
}

/// Document for a Helm release of an application version.
pub fn release_document(
    name: &str,
    chart_name: &str,
    chart_version: &str,
    repo_url: Option<&str>,
    values: &str,
) -> Result<Value> {
    let values = crate::compose::parse_mapping("override", values)?;

    let mut metadata = Mapping::new();
    metadata.insert("name".into(), name.into());

    let mut spec = Mapping::new();
    spec.insert("chartName".into(), chart_name.into());
    spec.insert("chartVersion".into(), chart_version.into());
    if let Some(url) = repo_url {
        spec.insert("repoUrl".into(), url.into());
    }
    spec.insert("values".into(), Value::Mapping(values));

    let mut doc = Mapping::new();
    doc.insert("apiVersion".into(), "bosun.dev/v1".into());
    doc.insert("kind".into(), "HelmRelease".into());
    doc.insert("metadata".into(), Value::Mapping(metadata));
    doc.insert("spec".into(), Value::Mapping(spec));
    Ok(Value::Mapping(doc))
}

/// Parse a caller-supplied resource manifest, filling in `kind` and
/// `metadata.name` when absent and rejecting conflicting ones.
pub fn resource_document(kind: &str, name: &str, manifest: &str) -> Result<Value> {
    let mut doc = crate::compose::parse_mapping("override", manifest)?;

    match doc.get("kind").and_then(Value::as_str) {
        Some(declared) if !declared.eq_ignore_ascii_case(kind) => {
            return Err(Error::InvalidRequest(format!(
                "manifest kind '{}' does not match '{}'",
                declared, kind
            )));
        }
        Some(_) => {}
        None => {
            doc.insert("kind".into(), kind.into());
        }
    }

    let metadata = doc
        .entry("metadata".into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let Value::Mapping(metadata) = metadata else {
        return Err(Error::InvalidRequest("metadata must be a mapping".into()));
    };
    match metadata.get("name").and_then(Value::as_str) {
        Some(declared) if declared != name => {
            return Err(Error::InvalidRequest(format!(
                "manifest name '{}' does not match '{}'",
                declared, name
            )));
        }
        Some(_) => {}
        None => {
            metadata.insert("name".into(), name.into());
        }
    }

    Ok(Value::Mapping(doc))
}

fn split_documents(text: &str) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(de)?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

fn join_documents(documents: &[Value]) -> Result<String> {
    let mut out = String::new();
    for (i, doc) in documents.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(doc)?);
    }
    Ok(out)
}

fn describes(doc: &Value, kind: &str, name: &str) -> bool {
    let doc_kind = doc.get("kind").and_then(Value::as_str);
    let doc_name = doc
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str);
    doc_kind.is_some_and(|k| k.eq_ignore_ascii_case(kind)) && doc_name == Some(name)
}
