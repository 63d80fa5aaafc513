pub mod http;

use std::future::Future;

use crate::error::FetchError;
use crate::model::{EntryContent, EntrySummary, ImageMetadata};

pub use http::{HttpGateway, Session};

/// Normalized response envelope: decoded body plus HTTP status.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub data: T,
    pub status: u16,
}

/// The remote REST surface the sync engine reads from.
///
/// One request per (path, operation). Implementations fail on transport errors
/// and on any non-2xx status.
pub trait EntryGateway: Send + Sync {
    fn list_entries(
        &self,
        path_id: &str,
    ) -> impl Future<Output = Result<Envelope<Vec<EntrySummary>>, FetchError>> + Send;

    fn get_entry_content(
        &self,
        path_id: &str,
        entry_id: &str,
    ) -> impl Future<Output = Result<Envelope<EntryContent>, FetchError>> + Send;

    fn list_entry_images(
        &self,
        path_id: &str,
        entry_id: &str,
    ) -> impl Future<Output = Result<Envelope<Vec<ImageMetadata>>, FetchError>> + Send;
}

impl<T: EntryGateway> EntryGateway for std::sync::Arc<T> {
    fn list_entries(
        &self,
        path_id: &str,
    ) -> impl Future<Output = Result<Envelope<Vec<EntrySummary>>, FetchError>> + Send {
        (**self).list_entries(path_id)
    }

    fn get_entry_content(
        &self,
        path_id: &str,
        entry_id: &str,
    ) -> impl Future<Output = Result<Envelope<EntryContent>, FetchError>> + Send {
        (**self).get_entry_content(path_id, entry_id)
    }

    fn list_entry_images(
        &self,
        path_id: &str,
        entry_id: &str,
    ) -> impl Future<Output = Result<Envelope<Vec<ImageMetadata>>, FetchError>> + Send {
        (**self).list_entry_images(path_id, entry_id)
    }
}
