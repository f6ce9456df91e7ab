// src/check/mod.rs
// =============================================================================
// The check engine.
//
// - resource.rs: the result tree (resources, states, links between them)
// - machine.rs: moves resources through fetch → analyze → done, and
//   descends into the root's links
// - orchestrator.rs: the entry point; policy, timeout, saving, outcomes
// =============================================================================

mod machine;
mod orchestrator;
mod resource;

pub use orchestrator::{CheckOutcome, CheckReport, CheckRequest, Checker, LoadOutcome};
pub use resource::{CheckState, Resource, ResourceTree};

#[cfg(test)]
pub(crate) mod testing {
    // A Fetcher that plays back canned exchanges, keyed by request URI.
    //
    // URIs without a script fail with a connection error, so tests only
    // describe the exchanges they care about.

    use crate::fetch::{BodyEvent, ExchangeRequest, FetchError, Fetcher, HeaderField, ResponseStream};
    use futures::stream::{self, StreamExt};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone)]
    enum Script {
        Respond {
            status: u16,
            headers: Vec<HeaderField>,
            chunks: Vec<Vec<u8>>,
            then: Option<FetchError>,
            delay: Duration,
        },
        Fail(FetchError),
        // the exchange never completes
        Hang,
    }

    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        scripts: HashMap<String, Script>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    // Counts a fetch as in flight until it returns or is dropped.
    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn fields(headers: &[(&str, &str)]) -> Vec<HeaderField> {
        headers
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    impl ScriptedFetcher {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn respond(self, uri: &str, status: u16, headers: &[(&str, &str)], body: &str) -> Self {
            self.respond_chunks(uri, status, headers, &[body.as_bytes()])
        }

        pub(crate) fn respond_chunks(mut self, uri: &str, status: u16, headers: &[(&str, &str)], chunks: &[&[u8]]) -> Self {
            self.scripts.insert(
                uri.to_string(),
                Script::Respond {
                    status,
                    headers: fields(headers),
                    chunks: chunks.iter().map(|c| c.to_vec()).collect(),
                    then: None,
                    delay: Duration::ZERO,
                },
            );
            self
        }

        /// Responds after waiting `delay`.
        pub(crate) fn respond_after(mut self, uri: &str, delay: Duration, body: &str) -> Self {
            self.scripts.insert(
                uri.to_string(),
                Script::Respond {
                    status: 200,
                    headers: fields(&[("Content-Type", "text/plain")]),
                    chunks: vec![body.as_bytes().to_vec()],
                    then: None,
                    delay,
                },
            );
            self
        }

        pub(crate) fn respond_then_fail(
            mut self,
            uri: &str,
            status: u16,
            headers: &[(&str, &str)],
            chunk: &[u8],
            error: FetchError,
        ) -> Self {
            self.scripts.insert(
                uri.to_string(),
                Script::Respond {
                    status,
                    headers: fields(headers),
                    chunks: vec![chunk.to_vec()],
                    then: Some(error),
                    delay: Duration::ZERO,
                },
            );
            self
        }

        pub(crate) fn fail(mut self, uri: &str, error: FetchError) -> Self {
            self.scripts.insert(uri.to_string(), Script::Fail(error));
            self
        }

        pub(crate) fn hang(mut self, uri: &str) -> Self {
            self.scripts.insert(uri.to_string(), Script::Hang);
            self
        }

        pub(crate) fn fetch_count(&self, uri: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.as_str() == uri)
                .count()
        }

        /// Most fetches that were waiting for their response at once.
        pub(crate) fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: &ExchangeRequest) -> Result<ResponseStream, FetchError> {
            self.calls.lock().unwrap().push(request.uri.clone());
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
            let _in_flight = InFlight(&self.in_flight);

            match self.scripts.get(&request.uri).cloned() {
                None => Err(FetchError::Connect(format!("no script for {}", request.uri))),
                Some(Script::Fail(error)) => Err(error),
                Some(Script::Hang) => std::future::pending().await,
                Some(Script::Respond {
                    status,
                    headers,
                    chunks,
                    then,
                    delay,
                }) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let body = stream::iter(chunks.into_iter().map(|c| Ok(BodyEvent::Chunk(c))));
                    let tail = stream::iter(then.map(Err));
                    Ok(ResponseStream {
                        status,
                        reason: "Scripted".to_string(),
                        headers,
                        events: body.chain(tail).boxed(),
                    })
                }
            }
        }
    }
}
