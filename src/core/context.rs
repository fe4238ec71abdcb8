use crate::storage::{FileSystem, ObjectStore, RequestContext};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 一次同步运行共享的外部依赖，生命周期与 `run()` 相同
#[derive(Clone)]
pub struct SyncContext {
    pub fs: Arc<dyn FileSystem>,
    pub store: Arc<dyn ObjectStore>,
    pub request: RequestContext,
    pub cancel: CancellationToken,
}

impl SyncContext {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        store: Arc<dyn ObjectStore>,
        request: RequestContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fs,
            store,
            request,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
