// src/check/machine.rs
// =============================================================================
// Drives resources through their lifecycle.
//
// For one resource:
//   Created → Fetching    send the request, stream the body: count bytes,
//                         keep a bounded sample, feed the link parser
//           → Analyzing   hand headers + body to the header analyzer
//           → Done        (or Failed on any fetch error)
//
// The root may also descend: every unique link in its body (up to
// max_links) becomes a child, each child passes the policy guard and then
// runs the same fetch/analyze steps. Children never descend themselves.
// Children run concurrently, at most `concurrency` at a time, using
// buffer_unordered (the same pattern the link checker used for its batch).
//
// Everything runs on one task. The tree sits in a RefCell and a borrow is
// never held across an .await.
// =============================================================================

use super::resource::{CheckState, ResourceId, ResourceTree, ResponseRecord};
use crate::analysis::notes::{BODY_TRUNCATED, CHILD_DENIED, FETCH_FAILED, LINK_PARSE_ABANDONED};
use crate::analysis::{HeaderAnalyzer, MessageContext};
use crate::config::Config;
use crate::fetch::{header_block_size, BodyEvent, ExchangeRequest, FetchError, Fetcher};
use crate::links::LinkParser;
use crate::policy::{Admission, PolicyGuard};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::cell::RefCell;
use tracing::{debug, info};
use url::Url;

/// Everything one check needs, borrowed from the orchestrator.
pub(crate) struct CheckContext<'a, F> {
    pub fetcher: &'a F,
    pub analyzer: &'a dyn HeaderAnalyzer,
    pub guard: &'a PolicyGuard,
    pub config: &'a Config,
    pub tree: &'a RefCell<ResourceTree>,
}

/// Runs the root resource, and its children when `descend` is set, to a
/// terminal state.
pub(crate) async fn run_root<F: Fetcher>(ctx: &CheckContext<'_, F>, descend: bool) {
    let root = ctx.tree.borrow().root_id();

    if !fetch_and_analyze(ctx, root).await {
        return;
    }
    if descend {
        descend_links(ctx, root).await;
    }

    let mut tree = ctx.tree.borrow_mut();
    let unfinished = tree
        .descendants(root)
        .into_iter()
        .filter(|id| tree.get(*id).is_some_and(|r| !r.state.is_terminal()))
        .count();
    if unfinished > 0 {
        // a root with an unfinished child isn't done
        debug!(unfinished, "root left open");
        return;
    }
    tree.advance(root, CheckState::Done);
}

async fn descend_links<F: Fetcher>(ctx: &CheckContext<'_, F>, root: ResourceId) {
    let children: Vec<ResourceId> = {
        let mut tree = ctx.tree.borrow_mut();
        if !tree.advance(root, CheckState::Descending) {
            return;
        }
        let links = tree.get(root).map(|r| r.links.clone()).unwrap_or_default();
        let headers = tree
            .get(root)
            .map(|r| r.request.headers.clone())
            .unwrap_or_default();

        if links.len() > ctx.config.max_links {
            info!(
                found = links.len(),
                max_links = ctx.config.max_links,
                "too many links, checking only the first ones"
            );
        }
        links
            .iter()
            .take(ctx.config.max_links)
            .filter_map(|link| {
                tree.add_child(root, link, ExchangeRequest::get(link.target.as_str(), headers.clone()))
            })
            .collect()
    };

    debug!(children = children.len(), "descending");

    stream::iter(children)
        .map(|id| run_child(ctx, id))
        .buffer_unordered(ctx.config.concurrency.max(1))
        .collect::<Vec<()>>()
        .await;
}

async fn run_child<F: Fetcher>(ctx: &CheckContext<'_, F>, id: ResourceId) {
    let uri = match ctx.tree.borrow().get(id) {
        Some(resource) => resource.uri().to_string(),
        None => return,
    };

    if let Admission::Deny(reason) = ctx.guard.admit_link(&uri, ctx.fetcher).await {
        debug!(uri = %uri, reason = %reason, "link not checked");
        let mut tree = ctx.tree.borrow_mut();
        tree.push_note(id, CHILD_DENIED.note("policy").with("reason", reason.to_string()));
        tree.advance(id, CheckState::Failed);
        return;
    }

    if fetch_and_analyze(ctx, id).await {
        ctx.tree.borrow_mut().advance(id, CheckState::Done);
    }
}

// Fetches and analyzes one resource. Returns true when it made it through
// Analyzing; on failure the resource is already Failed.
pub(crate) async fn fetch_and_analyze<F: Fetcher>(ctx: &CheckContext<'_, F>, id: ResourceId) -> bool {
    let request = {
        let mut tree = ctx.tree.borrow_mut();
        if !tree.advance(id, CheckState::Fetching) {
            return false;
        }
        let Some(resource) = tree.get_mut(id) else {
            return false;
        };
        resource.transfer_out = resource.request.wire_size();
        resource.request.clone()
    };

    debug!(uri = %request.uri, "fetching");
    let response = match ctx.fetcher.fetch(&request).await {
        Ok(response) => response,
        Err(error) => {
            fail(ctx.tree, id, &error);
            return false;
        }
    };

    let received_at = Utc::now();
    let status = response.status;
    let reason = response.reason.clone();
    let headers = response.headers.clone();
    if let Some(resource) = ctx.tree.borrow_mut().get_mut(id) {
        resource.transfer_in += response.head_size();
    }

    let mut parser = Url::parse(&request.uri)
        .ok()
        .map(|base| LinkParser::new(&base, response.header("content-type"), ctx.config.max_body_sample));

    let max_sample = ctx.config.max_body_sample;
    let mut sample: Vec<u8> = Vec::new();
    let mut body_len: u64 = 0;
    let mut truncated = false;
    let mut trailers = Vec::new();

    let mut events = response.events;
    while let Some(event) = events.next().await {
        match event {
            Ok(BodyEvent::Chunk(chunk)) => {
                if let Some(resource) = ctx.tree.borrow_mut().get_mut(id) {
                    resource.transfer_in += chunk.len() as u64;
                }
                body_len += chunk.len() as u64;

                let room = max_sample.saturating_sub(sample.len());
                if chunk.len() > room {
                    truncated = true;
                }
                sample.extend_from_slice(&chunk[..room.min(chunk.len())]);

                if let Some(parser) = parser.as_mut().filter(|p| p.is_active()) {
                    parser.feed(&chunk);
                }
            }
            Ok(BodyEvent::Trailers(fields)) => {
                if let Some(resource) = ctx.tree.borrow_mut().get_mut(id) {
                    resource.transfer_in += header_block_size(&fields) as u64;
                }
                trailers = fields;
            }
            Err(error) => {
                // keep what we know about the response before failing
                if let Some(resource) = ctx.tree.borrow_mut().get_mut(id) {
                    resource.response = Some(ResponseRecord {
                        status,
                        reason: reason.clone(),
                        headers: headers.clone(),
                        trailers: Vec::new(),
                        body_sample: String::from_utf8_lossy(&sample).into_owned(),
                        body_len,
                        body_truncated: true,
                    });
                }
                fail(ctx.tree, id, &error);
                return false;
            }
        }
    }

    if !ctx.tree.borrow_mut().advance(id, CheckState::Analyzing) {
        return false;
    }

    let mut message_notes = Vec::new();
    if truncated {
        message_notes.push(BODY_TRUNCATED.note("body").with("sample_bytes", max_sample.to_string()));
    }

    let mut links = Vec::new();
    if let Some(parser) = parser.as_mut() {
        parser.finish();
        if parser.abandoned() {
            message_notes.push(
                LINK_PARSE_ABANDONED
                    .note("links")
                    .with("errors", parser.error_count().to_string()),
            );
        }
        links = parser.drain();
    }

    let message = MessageContext {
        status,
        base_uri: &request.uri,
        method: &request.method,
        request_headers: &request.headers,
        received_at,
    };
    // a truncated sample can't be compared against Content-Length
    let body = (!truncated).then_some(sample.as_slice());
    let analysis = ctx.analyzer.analyze(&message, &headers, body);

    let mut tree = ctx.tree.borrow_mut();
    tree.set_links(id, links);
    if let Some(resource) = tree.get_mut(id) {
        resource.response = Some(ResponseRecord {
            status,
            reason,
            headers,
            trailers,
            body_sample: String::from_utf8_lossy(&sample).into_owned(),
            body_len,
            body_truncated: truncated,
        });
        resource.parsed_headers = analysis.parsed;
        resource.notes.extend(analysis.notes);
        resource.notes.extend(message_notes);
    }
    true
}

fn fail(tree: &RefCell<ResourceTree>, id: ResourceId, error: &FetchError) {
    let mut tree = tree.borrow_mut();
    let uri = tree.get(id).map(|r| r.uri().to_string()).unwrap_or_default();
    debug!(uri = %uri, error = %error, "fetch failed");
    if tree.advance(id, CheckState::Failed) {
        tree.push_note(id, FETCH_FAILED.note("fetch").with("error", error.to_string()));
    }
}
