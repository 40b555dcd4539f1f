use std::sync::Arc;

use duet_storage::{Storage, StorageResult};
use snafu::ResultExt;

use crate::error::{BlockingTaskSnafu, ChatResult, StorageSnafu};

pub type SharedStorage = Arc<dyn Storage>;

/// Runs a sync store operation off the async executor.
pub(crate) async fn store_call<T, F>(
    storage: &SharedStorage,
    stage: &'static str,
    op: F,
) -> ChatResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Storage) -> StorageResult<T> + Send + 'static,
{
    let storage = Arc::clone(storage);
    tokio::task::spawn_blocking(move || op(storage.as_ref()))
        .await
        .context(BlockingTaskSnafu { stage })?
        .context(StorageSnafu { stage })
}
