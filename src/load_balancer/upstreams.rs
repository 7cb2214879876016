use tracing::warn;

use super::UpstreamInfo;
use crate::data_model::Task;

/// Resolves the routable upstream endpoints for a batch of tasks. A task
/// missing its configured port is skipped rather than failing the batch.
pub fn upstreams_for_tasks(
    tasks: &[Task],
    request_id: &str,
    upstream_group: Option<&str>,
    group_label_key: Option<&str>,
) -> Vec<UpstreamInfo> {
    let mut upstreams = Vec::with_capacity(tasks.len());

    for task in tasks {
        let port_index = task
            .deploy
            .load_balancer
            .as_ref()
            .and_then(|options| options.port_index)
            .unwrap_or(0);

        let Some(port) = task.ports.get(port_index).copied() else {
            warn!(
                task_id = %task.id,
                port_index = port_index,
                "Task is missing its load balancer port but is being passed to the balancer, skipping"
            );
            continue;
        };

        let mut group = upstream_group.map(str::to_string);
        if let Some(label_key) = group_label_key {
            if let Some(value) = task.labels.get(label_key) {
                group = Some(value.clone());
            }
        }

        upstreams.push(UpstreamInfo {
            upstream: format!("{}:{}", task.host, port),
            request_id: Some(request_id.to_string()),
            rack_id: task.rack.clone(),
            group,
        });
    }

    upstreams
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::test_objects::tests::{mock_load_balanced_deploy, mock_task};

    #[test]
    fn test_port_resolution_by_index() {
        let mut deploy = mock_load_balanced_deploy();
        deploy.load_balancer.as_mut().unwrap().port_index = Some(1);
        let task = mock_task("task-1", deploy);

        let upstreams = upstreams_for_tasks(&[task.clone()], "task-1-ADD", None, None);
        assert_eq!(upstreams.len(), 1);
        assert_eq!(upstreams[0].upstream, format!("{}:{}", task.host, 31001));
        assert_eq!(upstreams[0].request_id.as_deref(), Some("task-1-ADD"));
        assert_eq!(upstreams[0].rack_id.as_deref(), Some("rack-1"));
    }

    #[test]
    fn test_task_missing_port_is_skipped() {
        let mut deploy = mock_load_balanced_deploy();
        deploy.load_balancer.as_mut().unwrap().port_index = Some(5);
        let broken = mock_task("task-1", deploy);
        let healthy = mock_task("task-2", mock_load_balanced_deploy());

        let upstreams = upstreams_for_tasks(&[broken, healthy], "r", None, None);
        assert_eq!(upstreams.len(), 1);
        assert!(upstreams[0].upstream.ends_with(":31000"));
    }

    #[test]
    fn test_group_from_task_label_overrides_caller_group() {
        let mut task = mock_task("task-1", mock_load_balanced_deploy());
        task.labels
            .insert("lb_group".to_string(), "canary".to_string());

        let upstreams =
            upstreams_for_tasks(&[task.clone()], "r", Some("default"), Some("lb_group"));
        assert_eq!(upstreams[0].group.as_deref(), Some("canary"));

        // Without the label the caller's group wins.
        task.labels.clear();
        let upstreams = upstreams_for_tasks(&[task], "r", Some("default"), Some("lb_group"));
        assert_eq!(upstreams[0].group.as_deref(), Some("default"));
    }
}
