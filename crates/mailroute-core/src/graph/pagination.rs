use std::collections::VecDeque;

use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use crate::graph::client::GraphClient;
use crate::graph::types::Page;

struct WalkState<T> {
    next: Option<String>,
    buffered: VecDeque<T>,
    yielded: usize,
    pages: usize,
}

impl GraphClient {
    /// Lazily yields the items of a paged collection, following
    /// `@odata.nextLink` until it is absent or `max_items` have been yielded.
    ///
    /// A failed or malformed page ends the stream; items already yielded stay
    /// with the caller and no error crosses this boundary.
    pub fn walk<'a, T>(
        &'a self,
        url: &str,
        params: &[(&str, &str)],
        max_items: Option<usize>,
    ) -> BoxStream<'a, T>
    where
        T: DeserializeOwned + Send + 'a,
    {
        let first = match Url::parse_with_params(url, params) {
            Ok(url) => url.to_string(),
            Err(err) => {
                error!(url, error = %err, "invalid collection url");
                return stream::empty().boxed();
            }
        };

        let state = WalkState {
            next: Some(first),
            buffered: VecDeque::new(),
            yielded: 0,
            pages: 0,
        };

        stream::unfold(state, move |mut state| async move {
            loop {
                if max_items.is_some_and(|max| state.yielded >= max) {
                    info!(items = state.yielded, "reached item limit");
                    return None;
                }

                if let Some(item) = state.buffered.pop_front() {
                    state.yielded += 1;
                    return Some((item, state));
                }

                let url = state.next.take()?;
                match self.send_json::<Page<T>, _>(|| self.http().get(&url)).await {
                    Ok(page) => {
                        state.pages += 1;
                        debug!(
                            page = state.pages,
                            items = page.value.len(),
                            has_next = page.next_link.is_some(),
                            "fetched collection page"
                        );
                        state.buffered.extend(page.value);
                        state.next = page.next_link;
                    }
                    Err(err) => {
                        error!(
                            error = %err,
                            page = state.pages + 1,
                            yielded = state.yielded,
                            "pagination aborted"
                        );
                        return None;
                    }
                }
            }
        })
        .boxed()
    }
}
