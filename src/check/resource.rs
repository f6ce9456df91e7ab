// src/check/resource.rs
// =============================================================================
// The result tree of one check.
//
// Every URI under test is a Resource. Resources live in an arena
// (ResourceTree) and point at each other by ResourceId: the root is always
// id 0, each child records its parent and the link that produced it, and
// each parent maps link targets to child ids.
//
// The tree is also the unit of storage: it serializes as-is into a snapshot.
// =============================================================================

use crate::analysis::Note;
use crate::fetch::{ExchangeRequest, HeaderField};
use crate::links::FoundLink;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(usize);

/// Where a resource is in its lifecycle.
///
/// Created → Fetching → Analyzing → [Descending] → Done, with Failed and
/// TimedOut as the other terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Created,
    Fetching,
    Analyzing,
    /// Root only: waiting on its children
    Descending,
    Done,
    Failed,
    TimedOut,
}

impl CheckState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CheckState::Done | CheckState::Failed | CheckState::TimedOut)
    }

    fn rank(self) -> u8 {
        match self {
            CheckState::Created => 0,
            CheckState::Fetching => 1,
            CheckState::Analyzing => 2,
            CheckState::Descending => 3,
            CheckState::Done | CheckState::Failed | CheckState::TimedOut => 4,
        }
    }

    /// States only move forward, and never out of a terminal state.
    pub fn can_advance_to(self, next: CheckState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// The link that led from a parent to a child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEdge {
    pub source: ResourceId,
    pub target: String,
    pub tag: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<HeaderField>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trailers: Vec<HeaderField>,
    /// The start of the body, lossily decoded.
    pub body_sample: String,
    /// Full body length as received.
    pub body_len: u64,
    pub body_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub parent: Option<ResourceId>,
    pub edge: Option<LinkEdge>,
    pub request: ExchangeRequest,
    pub response: Option<ResponseRecord>,
    pub state: CheckState,
    pub transfer_in: u64,
    pub transfer_out: u64,
    /// Links found in the body, in document order, duplicates removed.
    pub links: Vec<FoundLink>,
    pub children: BTreeMap<String, ResourceId>,
    pub parsed_headers: BTreeMap<String, Vec<Value>>,
    pub notes: Vec<Note>,
}

impl Resource {
    fn new(id: ResourceId, parent: Option<ResourceId>, edge: Option<LinkEdge>, request: ExchangeRequest) -> Self {
        Self {
            id,
            parent,
            edge,
            request,
            response: None,
            state: CheckState::Created,
            transfer_in: 0,
            transfer_out: 0,
            links: Vec::new(),
            children: BTreeMap::new(),
            parsed_headers: BTreeMap::new(),
            notes: Vec::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.request.uri
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTree {
    resources: Vec<Resource>,
}

impl ResourceTree {
    pub fn new(request: ExchangeRequest) -> Self {
        Self {
            resources: vec![Resource::new(ResourceId(0), None, None, request)],
        }
    }

    pub fn root_id(&self) -> ResourceId {
        ResourceId(0)
    }

    pub fn root(&self) -> &Resource {
        &self.resources[0]
    }

    pub fn get(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.get(id.0)
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut Resource> {
        self.resources.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// Records the links found in a resource's body, dropping repeats of a
    /// target already seen.
    pub fn set_links(&mut self, id: ResourceId, links: Vec<FoundLink>) {
        let Some(resource) = self.get_mut(id) else {
            return;
        };
        let mut unique: Vec<FoundLink> = Vec::with_capacity(links.len());
        for link in links {
            if !unique.iter().any(|l| l.target == link.target) {
                unique.push(link);
            }
        }
        resource.links = unique;
    }

    /// Adds a child for one of `parent`'s links.
    ///
    /// Returns None if the parent doesn't have that link, or already has a
    /// child for it.
    pub fn add_child(&mut self, parent: ResourceId, link: &FoundLink, request: ExchangeRequest) -> Option<ResourceId> {
        let parent_resource = self.get(parent)?;
        if !parent_resource.links.iter().any(|l| l.target == link.target)
            || parent_resource.children.contains_key(&link.target)
        {
            return None;
        }

        let id = ResourceId(self.resources.len());
        let edge = LinkEdge {
            source: parent,
            target: link.target.clone(),
            tag: link.tag.clone(),
            title: link.title.clone(),
        };
        self.resources.push(Resource::new(id, Some(parent), Some(edge), request));
        self.resources[parent.0].children.insert(link.target.clone(), id);
        Some(id)
    }

    /// Moves a resource to `next`. Returns false (and changes nothing) when
    /// that would go backwards or leave a terminal state.
    pub fn advance(&mut self, id: ResourceId, next: CheckState) -> bool {
        match self.get_mut(id) {
            Some(resource) if resource.state.can_advance_to(next) => {
                resource.state = next;
                true
            }
            _ => false,
        }
    }

    /// Every resource below `id`, depth first.
    pub fn descendants(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut out = Vec::new();
        let mut stack: Vec<ResourceId> = match self.get(id) {
            Some(resource) => resource.children.values().rev().copied().collect(),
            None => return out,
        };
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(resource) = self.get(next) {
                stack.extend(resource.children.values().rev().copied());
            }
        }
        out
    }

    /// Bytes received and sent, summed over the whole tree.
    pub fn transfer_totals(&self) -> (u64, u64) {
        self.resources
            .iter()
            .fold((0, 0), |(bytes_in, bytes_out), r| (bytes_in + r.transfer_in, bytes_out + r.transfer_out))
    }

    /// Forces every unfinished resource to TimedOut and returns their URIs.
    pub fn force_timeout(&mut self) -> Vec<String> {
        let mut in_flight = Vec::new();
        for resource in &mut self.resources {
            if !resource.state.is_terminal() {
                resource.state = CheckState::TimedOut;
                in_flight.push(resource.request.uri.clone());
            }
        }
        in_flight
    }

    /// The first resource checked for `uri`.
    pub fn find_by_uri(&self, uri: &str) -> Option<ResourceId> {
        self.resources.iter().find(|r| r.request.uri == uri).map(|r| r.id)
    }

    pub fn push_note(&mut self, id: ResourceId, note: Note) {
        if let Some(resource) = self.get_mut(id) {
            resource.notes.push(note);
        }
    }

    /// Structural checks for a tree read back from storage.
    pub fn validate(&self) -> Result<(), String> {
        if self.resources.is_empty() {
            return Err("no root resource".to_string());
        }
        for (index, resource) in self.resources.iter().enumerate() {
            if resource.id.0 != index {
                return Err(format!("resource {index} is labelled {}", resource.id.0));
            }
            if (index == 0) != resource.parent.is_none() {
                return Err(format!("resource {index} has a bad parent"));
            }
            for child in resource.children.values() {
                let linked_back = self
                    .get(*child)
                    .is_some_and(|c| c.parent == Some(resource.id) && child.0 > index);
                if !linked_back {
                    return Err(format!("resource {index} has a dangling child {}", child.0));
                }
            }
        }
        Ok(())
    }
}
