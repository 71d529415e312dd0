//! Scheduled-task (CronJob) reconciler
//!
//! One CronJob per declared task, named after the task. The API server
//! fills in many defaults on jobs and pods, so drift is judged on a
//! projection of the fields built here rather than on the whole object.
//!
//! Job pods carry no ownership labels. Those labels are the Service and
//! Deployment selector, and task pods must not be picked up as endpoints,
//! counted by the autoscaler or summed into the workload status.

use std::collections::BTreeSet;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar as ContainerEnv, LocalObjectReference, PodSpec, PodTemplateSpec,
};

use oneclick_common::crd::{Rollout, ScheduledTaskSpec};
use oneclick_common::kube_utils::owned_metadata;
use oneclick_common::Result;

use super::{container_resources, env_vars, list_eq, non_empty, resources_equal};
use crate::credentials::ensure_pull_secret;
use crate::managed::{collect_garbage, ensure, OwnedFields, PassContext};

const RESTART_POLICY: &str = "Never";

/// Desired CronJob for the task at `index`
///
/// `pull_secret` is the task's provisioned credential secret, if any.
pub fn build_cronjob(
    rollout: &Rollout,
    index: usize,
    task: &ScheduledTaskSpec,
    pull_secret: Option<String>,
) -> Result<CronJob> {
    let resources = container_resources(&format!("spec.cronjobs[{index}].resources"), &task.resources)?;

    let container = Container {
        name: task.name.clone(),
        image: Some(task.image.reference()),
        command: non_empty(task.command.clone()),
        args: non_empty(task.args.clone()),
        env: env_vars(&task.env),
        resources,
        ..Default::default()
    };

    let template = PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some(RESTART_POLICY.to_string()),
            image_pull_secrets: pull_secret.map(|name| vec![LocalObjectReference { name }]),
            ..Default::default()
        }),
    };

    Ok(CronJob {
        metadata: owned_metadata(rollout, task.name.clone())?,
        spec: Some(CronJobSpec {
            schedule: task.schedule.clone(),
            suspend: Some(task.suspend),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    backoff_limit: task.effective_backoff_limit(),
                    template,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn job_spec(c: &CronJob) -> Option<&JobSpec> {
    c.spec.as_ref()?.job_template.spec.as_ref()
}

fn pod_template(c: &CronJob) -> Option<&PodTemplateSpec> {
    job_spec(c).map(|j| &j.template)
}

fn pod_spec(c: &CronJob) -> Option<&PodSpec> {
    pod_template(c)?.spec.as_ref()
}

fn container(c: &CronJob) -> Option<&Container> {
    pod_spec(c)?.containers.first()
}

/// The fields this controller sets on a CronJob, in comparable form
#[derive(Debug, PartialEq)]
struct Projection<'a> {
    schedule: Option<&'a str>,
    suspend: bool,
    backoff_limit: Option<i32>,
    restart_policy: Option<&'a str>,
    container_name: Option<&'a str>,
    image: Option<&'a str>,
    pull_secrets: Vec<&'a str>,
}

fn project(c: &CronJob) -> Projection<'_> {
    let pod = pod_spec(c);
    let container = container(c);
    Projection {
        schedule: c.spec.as_ref().map(|s| s.schedule.as_str()),
        suspend: c.spec.as_ref().and_then(|s| s.suspend).unwrap_or(false),
        backoff_limit: job_spec(c).and_then(|j| j.backoff_limit),
        restart_policy: pod.and_then(|p| p.restart_policy.as_deref()),
        container_name: container.map(|c| c.name.as_str()),
        image: container.and_then(|c| c.image.as_deref()),
        pull_secrets: pod
            .and_then(|p| p.image_pull_secrets.as_ref())
            .map(|refs| refs.iter().map(|r| r.name.as_str()).collect())
            .unwrap_or_default(),
    }
}

fn env_list(c: Option<&Container>) -> Option<&Vec<ContainerEnv>> {
    c.and_then(|c| c.env.as_ref())
}

impl OwnedFields for CronJob {
    const KIND: &'static str = "CronJob";

    fn drifted(live: &Self, desired: &Self) -> bool {
        let (lc, dc) = (container(live), container(desired));
        project(live) != project(desired)
            || !list_eq(lc.and_then(|c| c.command.as_ref()), dc.and_then(|c| c.command.as_ref()))
            || !list_eq(lc.and_then(|c| c.args.as_ref()), dc.and_then(|c| c.args.as_ref()))
            || !list_eq(env_list(lc), env_list(dc))
            || !resources_equal(
                lc.and_then(|c| c.resources.as_ref()),
                dc.and_then(|c| c.resources.as_ref()),
            )
    }

    fn overwrite(live: &mut Self, desired: &Self) {
        live.spec = desired.spec.clone();
        if let Some(want) = desired.metadata.labels.as_ref() {
            live.metadata
                .labels
                .get_or_insert_with(Default::default)
                .extend(want.clone());
        }
    }
}

/// Converge one CronJob per task and remove the rest
pub async fn reconcile(ctx: &PassContext<'_>) -> Result<()> {
    let mut expected = BTreeSet::new();
    for (index, task) in ctx.rollout.spec.cron_jobs.iter().enumerate() {
        let pull_secret = ensure_pull_secret(ctx, &task.name, &task.image).await?;
        ensure(ctx, build_cronjob(ctx.rollout, index, task, pull_secret)?).await?;
        expected.insert(task.name.clone());
    }
    collect_garbage::<CronJob>(ctx, &expected).await?;
    Ok(())
}
