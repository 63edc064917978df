use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::graph::{GraphClient, GraphError};
use crate::model::Label;

pub const DEFAULT_PARENT_FOLDER: &str = "Email Classification";

#[derive(Debug, Error)]
pub enum FolderError {
    #[error("mail api error: {0}")]
    Graph(#[from] GraphError),
    #[error("parent folder '{0}' could not be created or found")]
    ParentUnavailable(String),
}

impl FolderError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FolderError::Graph(err) if err.is_auth())
    }
}

/// Label to destination folder id. Labels that could not be resolved are
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderMap {
    entries: BTreeMap<Label, String>,
}

impl FolderMap {
    pub fn get(&self, label: Label) -> Option<&str> {
        self.entries.get(&label).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        self.entries.keys().copied()
    }

    fn insert(&mut self, label: Label, folder_id: String) {
        self.entries.insert(label, folder_id);
    }
}

impl FromIterator<(Label, String)> for FolderMap {
    fn from_iter<I: IntoIterator<Item = (Label, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Comparison key for display names: lower-cased, alphanumerics only.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Keeps one folder per label under a single parent folder.
#[derive(Debug, Clone)]
pub struct FolderManager {
    parent_name: String,
    labels: Vec<Label>,
}

impl Default for FolderManager {
    fn default() -> Self {
        Self::new(DEFAULT_PARENT_FOLDER)
    }
}

impl FolderManager {
    pub fn new(parent_name: impl Into<String>) -> Self {
        Self {
            parent_name: parent_name.into(),
            labels: Label::ALL.to_vec(),
        }
    }

    pub fn with_labels(mut self, labels: Vec<Label>) -> Self {
        self.labels = labels;
        self
    }

    pub fn parent_name(&self) -> &str {
        &self.parent_name
    }

    /// Reconcile the label folders and return the resulting map. Safe to
    /// run repeatedly: existing folders are reused and stray ones are moved
    /// under the parent instead of duplicated.
    pub async fn ensure(&self, graph: &GraphClient) -> Result<FolderMap, FolderError> {
        let parent_id = self.ensure_parent(graph).await?;

        let children = graph.child_folders(&parent_id).await;
        let lookup: HashMap<String, String> = children
            .into_iter()
            .map(|folder| (normalize_name(&folder.display_name), folder.id))
            .collect();
        debug!(children = lookup.len(), parent_id = %parent_id, "listed label folders");

        let mut map = FolderMap::default();
        for &label in &self.labels {
            let display_name = label.display_name();
            let folder_id = match lookup.get(&normalize_name(&display_name)) {
                Some(id) => Some(id.clone()),
                None => match self.resolve_missing(graph, &parent_id, &display_name).await {
                    Ok(found) => found,
                    Err(err) if err.is_auth() => return Err(err.into()),
                    Err(err) => {
                        error!(folder = %display_name, error = %err, "could not resolve label folder");
                        None
                    }
                },
            };

            match folder_id {
                Some(id) => {
                    debug!(label = %label, folder_id = %id, "mapped label folder");
                    map.insert(label, id);
                }
                None => warn!(label = %label, "label folder unavailable, omitting from map"),
            }
        }

        info!(folders = map.len(), "folder mapping ready");
        Ok(map)
    }

    async fn ensure_parent(&self, graph: &GraphClient) -> Result<String, FolderError> {
        let key = normalize_name(&self.parent_name);
        let roots = graph.list_root_folders().await?;
        if let Some(parent) = roots
            .into_iter()
            .find(|folder| normalize_name(&folder.display_name) == key)
        {
            info!(parent = %self.parent_name, parent_id = %parent.id, "found parent folder");
            return Ok(parent.id);
        }

        match graph.create_root_folder(&self.parent_name).await {
            Ok(created) => {
                info!(parent = %self.parent_name, parent_id = %created.id, "created parent folder");
                Ok(created.id)
            }
            Err(err) if err.is_conflict() => graph
                .find_folder_by_name(&self.parent_name)
                .await?
                .map(|folder| folder.id)
                .ok_or_else(|| FolderError::ParentUnavailable(self.parent_name.clone())),
            Err(err) => Err(err.into()),
        }
    }

    async fn resolve_missing(
        &self,
        graph: &GraphClient,
        parent_id: &str,
        display_name: &str,
    ) -> Result<Option<String>, GraphError> {
        if let Some(ghost) = graph.find_folder_by_name(display_name).await? {
            if ghost.parent_folder_id.as_deref() != Some(parent_id) {
                graph.reparent_folder(&ghost.id, parent_id).await?;
                info!(folder = %display_name, folder_id = %ghost.id, "moved ghost folder under parent");
            }
            return Ok(Some(ghost.id));
        }

        match graph.create_child_folder(parent_id, display_name).await {
            Ok(created) => {
                info!(folder = %display_name, folder_id = %created.id, "created label folder");
                Ok(Some(created.id))
            }
            Err(err) if err.is_conflict() => {
                let found = graph.find_folder_by_name(display_name).await?;
                match &found {
                    Some(folder) => {
                        info!(folder = %display_name, folder_id = %folder.id, "folder already exists")
                    }
                    None => warn!(folder = %display_name, "conflict on create but folder not found"),
                }
                Ok(found.map(|folder| folder.id))
            }
            Err(err) => Err(err),
        }
    }
}
