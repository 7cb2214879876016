use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::data_model::Workload;

/// Fire-and-forget sink for operator-facing notifications and internal error
/// reports. Delivery transports (mail, paging, exception trackers) live
/// behind this seam.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, context: HashMap<String, String>);

    async fn send_replacement_tasks_failing(&self, workload: &Workload);
}

/// Default sink: everything lands in the log stream.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, context: HashMap<String, String>) {
        error!(context = ?context, "{message}");
    }

    async fn send_replacement_tasks_failing(&self, workload: &Workload) {
        warn!(
            workload_id = %workload.id,
            owners = ?workload.owners,
            "Replacement tasks for workload are repeatedly failing"
        );
    }
}
