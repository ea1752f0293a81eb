//! Automatic persisted queries.
//!
//! The first send carries only a SHA-256 hash of the document. If the server
//! answers that it does not know the hash, the same logical request is sent
//! again with the full document, behind the same caller-visible response.

use crate::extension::{AroundRequest, Next};
use crate::response::{BoxResponse, OnResult, ProxyResponse, ProxySink};
use futures_util::future::{BoxFuture, FutureExt};
use gqlx_core::{Operation, OperationResult};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Extension key carrying the hash.
pub const EXTENSION_KEY: &str = "persistedQuery";

/// Error code servers use to report an unknown hash.
pub const NOT_FOUND_CODE: &str = "PERSISTED_QUERY_NOT_FOUND";

/// Shorter code some servers report instead of [`NOT_FOUND_CODE`].
pub const SHORT_NOT_FOUND_CODE: &str = "NOT_FOUND";

const NOT_FOUND_MESSAGE: &str = "PersistedQueryNotFound";

/// Returns the hex-encoded SHA-256 of a document.
pub fn hash_query(query: &str) -> String {
    hex::encode(Sha256::digest(query.as_bytes()))
}

fn extension_value(hash: &str) -> serde_json::Value {
    serde_json::json!({ "version": 1, "sha256Hash": hash })
}

/// Hash-first request interceptor with a single full-document retry.
#[derive(Debug, Clone)]
pub struct PersistedQuery {
    not_found_codes: Arc<[String]>,
}

impl Default for PersistedQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistedQuery {
    pub fn new() -> Self {
        Self {
            not_found_codes: Arc::from(vec![
                NOT_FOUND_CODE.to_string(),
                SHORT_NOT_FOUND_CODE.to_string(),
            ]),
        }
    }

    /// Treats `code` as a miss as well.
    #[must_use]
    pub fn not_found_code(self, code: impl Into<String>) -> Self {
        let mut codes = self.not_found_codes.to_vec();
        codes.push(code.into());
        Self {
            not_found_codes: Arc::from(codes),
        }
    }

    fn is_miss(codes: &[String], result: &OperationResult) -> bool {
        result.errors.iter().any(|e| {
            e.message == NOT_FOUND_MESSAGE || e.code().is_some_and(|c| codes.iter().any(|x| x == c))
        })
    }
}

impl AroundRequest for PersistedQuery {
    fn name(&self) -> &str {
        "persisted_query"
    }

    fn around_request(&self, operation: Operation, next: Next) -> BoxFuture<'static, BoxResponse> {
        let codes = self.not_found_codes.clone();
        async move {
            if operation.query.is_empty() || operation.extensions.contains_key(EXTENSION_KEY) {
                return next(operation).await;
            }

            let hash = hash_query(&operation.query);
            let hashed = operation
                .clone()
                .with_query("")
                .with_extension(EXTENSION_KEY, extension_value(&hash));
            let full = operation.with_extension(EXTENSION_KEY, extension_value(&hash));

            let downstream = next(hashed).await;
            let proxy = ProxyResponse::new();
            let checked = Arc::new(AtomicBool::new(false));

            let hook: OnResult = {
                let proxy = proxy.clone();
                let downstream = downstream.clone();
                Arc::new(move |result: OperationResult, sink: ProxySink| {
                    let proxy = proxy.clone();
                    let downstream = downstream.clone();
                    let next = next.clone();
                    let full = full.clone();
                    let codes = codes.clone();
                    let hash = hash.clone();
                    let first = !checked.swap(true, Ordering::SeqCst);
                    async move {
                        // Only the first result can trigger the retry.
                        if first && Self::is_miss(&codes, &result) {
                            debug!(%hash, "persisted query miss, sending full document");
                            proxy.unbind(&downstream);
                            downstream.close();
                            let retried = next(full).await;
                            proxy.bind(retried, None);
                            return;
                        }
                        sink.send(result).await;
                    }
                    .boxed()
                })
            };

            proxy.bind(downstream, Some(hook));
            proxy.boxed()
        }
        .boxed()
    }
}
