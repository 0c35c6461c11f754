//! hm-fetcher — pulls the desired-state snapshot from the bulk API.
//!
//! One fetch cycle is a strictly sequential chain of suspension points:
//!
//! ```text
//! fetch(result_tx)
//!   ├── bus.request(auth_subject)        → BasicAuthInfo
//!   └── loop
//!       ├── GET {base}/bulk/apps?batch_size=N&bulk_token=T
//!       ├── non-empty page → store every entry (TTL − 1), T = next token
//!       └── empty page     → bump freshness, done
//! ```
//!
//! Any failing link ends the cycle with exactly one failed [`FetchResult`];
//! only a cycle that reaches the empty page bumps freshness. Nothing retries
//! on its own: the polling loop simply calls [`DesiredStateFetcher::fetch`]
//! again next interval.

pub mod auth;
pub mod error;
pub mod fetcher;
pub mod http;

pub use auth::BasicAuthInfo;
pub use error::FetchError;
pub use fetcher::{BulkResponse, BulkToken, DesiredStateFetcher, FetchResult, FetcherSettings};
pub use http::{BoxError, HttpClient, HyperHttpClient, ResponseBody, ResponseFuture, full_body};
