//! Dispatcher worker: polls for due tasks, publishes them and reports back.
//!
//! Publishing happens outside any store transaction. Several dispatchers may
//! run against one store; `claim_due` hands each task to only one of them.

use crate::{
    config::AppConfig,
    core::schedule,
    errors::Result,
    models::ScheduledTask,
    providers::{PublishRequest, Publisher},
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use std::{future::Future, time::Duration};
use tracing::{error, info, warn};

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Tasks moved to `processing` by this pass
    pub claimed: usize,
    /// Tasks the publisher accepted
    pub published: usize,
    /// Tasks whose attempt failed, whether or not they will be retried
    pub failed: usize,
}

impl From<&ScheduledTask> for PublishRequest {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            task_id: task.id,
            target: task.target.clone(),
            content: task.content.clone(),
            tags: task.tags.clone(),
            media_ref: task.media_ref.clone(),
        }
    }
}

/// Claims one batch of due tasks and publishes each.
pub async fn dispatch_due(
    db: &DatabaseConnection,
    config: &AppConfig,
    publisher: &dyn Publisher,
    now: DateTime<Utc>,
) -> Result<DispatchReport> {
    let tasks = schedule::claim_due(db, config, config.dispatcher.batch_size, now).await?;
    let mut report = DispatchReport {
        claimed: tasks.len(),
        ..DispatchReport::default()
    };

    for task in &tasks {
        let outcome = publisher.publish(&PublishRequest::from(task)).await;
        let reported = match outcome {
            Ok(()) => {
                report.published += 1;
                schedule::report_success(db, task.id, now).await
            }
            Err(err) => {
                warn!(task_id = task.id, error = %err, "Publish failed");
                report.failed += 1;
                schedule::report_failure(db, config, task.id, &err.to_string(), now).await
            }
        };
        // The claim may have expired and been taken over; that worker reports instead
        if let Err(err) = reported {
            error!(task_id = task.id, error = %err, "Failed to report task outcome");
        }
    }

    if report.claimed > 0 {
        info!(
            claimed = report.claimed,
            published = report.published,
            failed = report.failed,
            "Dispatch pass finished"
        );
    }
    Ok(report)
}

/// Runs dispatch passes every `dispatcher.poll_interval_secs` until `shutdown`
/// resolves.
pub async fn run_dispatcher<S>(
    db: &DatabaseConnection,
    config: &AppConfig,
    publisher: &dyn Publisher,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.dispatcher.poll_interval_secs.max(1)));
    tokio::pin!(shutdown);

    info!(
        poll_interval_secs = config.dispatcher.poll_interval_secs,
        batch_size = config.dispatcher.batch_size,
        "Dispatcher started"
    );
    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Dispatcher stopping");
                return Ok(());
            }
            _ = interval.tick() => {
                if let Err(e) = dispatch_due(db, config, publisher, Utc::now()).await {
                    error!(error = %e, "Dispatch pass failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::schedule::{NewTask, get_task, schedule};
    use crate::errors::Error;
    use crate::models::TaskStatus;
    use crate::providers::MockPublisher;
    use crate::test_utils::*;

    async fn schedule_for(
        db: &DatabaseConnection,
        config: &AppConfig,
        target: &str,
        at: DateTime<Utc>,
    ) -> Result<ScheduledTask> {
        schedule(
            db,
            config,
            "owner",
            NewTask {
                target: target.to_string(),
                content: format!("hello {target}"),
                tags: vec!["hello".to_string()],
                media_ref: None,
                scheduled_for: at,
            },
            fixed_now(),
        )
        .await
    }

    #[tokio::test]
    async fn test_dispatch_reports_each_outcome() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();
        let due_at = fixed_now() + chrono::Duration::hours(1);
        let ok = schedule_for(&db, &config, "twitter", due_at).await?;
        let bad = schedule_for(&db, &config, "facebook", due_at).await?;

        let mut publisher = MockPublisher::new();
        publisher.expect_publish().times(2).returning(|request| {
            if request.target == "facebook" {
                Err(Error::ProviderUnavailable {
                    message: "token expired".to_string(),
                })
            } else {
                Ok(())
            }
        });

        let report = dispatch_due(&db, &config, &publisher, due_at).await?;
        assert_eq!(
            report,
            DispatchReport {
                claimed: 2,
                published: 1,
                failed: 1
            }
        );

        assert_eq!(get_task(&db, "owner", ok.id).await?.status, TaskStatus::Published);
        let retried = get_task(&db, "owner", bad.id).await?;
        assert_eq!(retried.status, TaskStatus::Pending);
        assert!(retried.last_error.unwrap().contains("token expired"));
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatch_with_nothing_due() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();
        schedule_for(&db, &config, "twitter", fixed_now() + chrono::Duration::days(1)).await?;

        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let report = dispatch_due(&db, &config, &publisher, fixed_now()).await?;
        assert_eq!(report, DispatchReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_dispatcher_stops_on_shutdown() -> Result<()> {
        let db = setup_test_db().await?;
        let config = test_config();
        let publisher = MockPublisher::new();

        run_dispatcher(
            &db,
            &config,
            &publisher,
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await
    }
}
