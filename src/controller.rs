use futures::StreamExt;
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EnvVar, KeyToPath, Pod, PodSpec, PodTemplateSpec, Secret,
            SecretVolumeSource, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
    ByteString,
};
use std::{collections::HashMap, sync::Arc, time::Duration};

use kube::{
    api::{DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams, PropagationPolicy},
    core::ObjectMeta,
    runtime::{
        conditions::{is_job_completed, Condition},
        controller::{Action, Controller},
        watcher,
    },
    Api, Client, Resource, ResourceExt,
};

#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::{
    auth::ProviderRegistry,
    persist::{self, ComposedCredentials, KubeSecretSource},
    resources::{ImageBuild, ImageBuildCondition, ImageBuildStatus},
    verify, Error, Result,
};

const BUILDKIT_IMAGE: &str = "moby/buildkit:v0.12.5-rootless";

/// Upper bound on the whole credential preflight (composition and
/// verification, including verification backoff) for one build, so a stuck
/// network call cannot stall a reconcile worker indefinitely.
const CREDENTIAL_PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(300);

const CONDITION_CREDENTIALS_READY: &str = "CredentialsReady";

struct Context {
    client: Client,
    providers: Arc<ProviderRegistry>,
}

fn error_policy(build: Arc<ImageBuild>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = build.name_any();
    warn!(?name, %error, "reconcile failed");
    Action::requeue(Duration::from_secs(60))
}

pub async fn run(client: Client, providers: Arc<ProviderRegistry>) -> Result<()> {
    let builds = Api::<ImageBuild>::all(client.clone());
    if let Err(e) = builds.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    info!("running kiln manager");
    let jobs = Api::<Job>::all(client.clone());
    Controller::new(builds, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .owns(jobs, watcher::Config::default().any_semantic())
        .run(
            reconcile,
            error_policy,
            Arc::new(Context { client, providers }),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

#[derive(Debug, Clone)]
enum ReconciliationState {
    Idle,
    Executing,
    JobTerminated(String, JobOutcome),
}

#[derive(Debug, Clone, Copy)]
enum JobOutcome {
    Success,
    Failure,
}

/// This is the main logic of the controller. This function gets called every time some resource related to the build
/// changes. This function should be idempotent.
async fn reconcile(build: Arc<ImageBuild>, ctx: Arc<Context>) -> Result<Action> {
    info!(
        name = build.name_any(),
        namespace = build.namespace(),
        image = build.spec.image,
        "--------------- Running reconciler ---------------"
    );

    if build.spec.pause {
        info!(name = build.name_any(), "build is paused");
        return Ok(Action::await_change());
    }

    let state = reconciliation_state(&build, &ctx).await?;
    info!(?state);

    let action = match state {
        ReconciliationState::Idle => {
            launch_build(&build, &ctx).await?;
            Action::await_change()
        }
        ReconciliationState::Executing => {
            info!(
                job_name = job_name_for(&build),
                "waiting for build job execution"
            );
            Action::await_change()
        }
        ReconciliationState::JobTerminated(job_uid, outcome) => {
            let action = match outcome {
                JobOutcome::Success => {
                    info!("build job completed successfully");
                    Action::await_change()
                }
                JobOutcome::Failure => {
                    info!("build job failed");
                    Action::requeue(Duration::from_secs(60))
                }
            };
            capture_logs(&build, &ctx, job_uid).await?;
            delete_job(&build, &ctx).await?;
            action
        }
    };

    Ok(action)
}

async fn reconciliation_state(build: &ImageBuild, ctx: &Context) -> Result<ReconciliationState> {
    let ns = build.namespace().ok_or(Error::NamespaceRequired)?;
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    let job_name = job_name_for(build);
    let job = api.get_opt(&job_name).await?;

    Ok(match job {
        Some(job) => {
            let uid = job
                .labels()
                .get("controller-uid")
                .expect("Jobs must have controller-uid label")
                .clone();

            fn condition(job: &Job, cond: impl Condition<Job>) -> bool {
                cond.matches_object(Some(job))
            }
            if condition(&job, is_job_completed()) {
                ReconciliationState::JobTerminated(uid, JobOutcome::Success)
            } else if condition(&job, is_job_failed()) {
                ReconciliationState::JobTerminated(uid, JobOutcome::Failure)
            } else {
                ReconciliationState::Executing
            }
        }
        None => ReconciliationState::Idle,
    })
}

/// Compose and verify registry credentials for this build. The composed
/// directory lives only for the duration of this call's caller; it is
/// removed when the returned value is dropped.
async fn resolve_credentials(build: &ImageBuild, ctx: &Context) -> Result<ComposedCredentials> {
    info!("resolving registry credentials");

    let ns = build.namespace().ok_or(Error::NamespaceRequired)?;
    let specs = build.spec.registry_credentials.clone().unwrap_or_default();
    let insecure = build.spec.insecure_registries.clone().unwrap_or_default();

    let secrets = KubeSecretSource::new(ctx.client.clone());
    let composed = persist::persist(&specs, &ns, &secrets, &ctx.providers).await?;

    verify::verify(composed.dir.path(), &insecure, &composed.provenance).await?;

    Ok(composed)
}

async fn launch_build(build: &ImageBuild, ctx: &Context) -> Result<()> {
    let preflight = tokio::time::timeout(
        CREDENTIAL_PREFLIGHT_TIMEOUT,
        resolve_credentials(build, ctx),
    )
    .await
    .unwrap_or(Err(Error::CredentialPreflightTimeout(
        CREDENTIAL_PREFLIGHT_TIMEOUT,
    )));

    let composed = match preflight {
        Ok(composed) => {
            patch_credentials_condition(
                build,
                ctx,
                "True",
                "CredentialsVerified",
                format!(
                    "verified credentials from {} source(s)",
                    composed.provenance.len()
                ),
            )
            .await?;
            composed
        }
        Err(err) => {
            let reason = match &err {
                Error::CredentialPreflightTimeout(_) => "PreflightTimeout",
                Error::Verify(_) => "CredentialsRejected",
                _ => "CredentialResolutionFailed",
            };
            patch_credentials_condition(build, ctx, "False", reason, err.to_string()).await?;
            return Err(err);
        }
    };

    create_registry_auth_secret(build, ctx, &composed).await?;
    create_job(build, ctx).await
}

fn handle_resource_exists<R>(res: kube::Result<R>) -> Result<()>
where
    R: kube::Resource,
{
    match res {
        Err(kube::Error::Api(ae)) => match ae.code {
            409 => {
                info!(
                    "{} resource already exist, doing nothing",
                    tynm::type_name::<R>()
                );
                Ok(())
            }
            _ => Err(kube::Error::Api(ae).into()),
        },
        Err(e) => Err(e.into()),
        Ok(_) => Ok(()),
    }
}

fn owned_by(build: &ImageBuild) -> Option<Vec<OwnerReference>> {
    build.controller_owner_ref(&()).map(|o| vec![o])
}

fn patch_params() -> PatchParams {
    PatchParams::apply("kiln").force()
}

fn job_name_for(build: &ImageBuild) -> String {
    format!("kiln-build-{}", build.name_any())
}

fn registry_auth_secret_name(build: &ImageBuild) -> String {
    format!("kiln-build-{}-registry-auth", build.name_any())
}

async fn patch_credentials_condition(
    build: &ImageBuild,
    ctx: &Context,
    status: &str,
    reason: &str,
    message: String,
) -> Result<()> {
    let ns = build.namespace().ok_or(Error::NamespaceRequired)?;
    let api: Api<ImageBuild> = Api::namespaced(ctx.client.clone(), &ns);

    let patch = ImageBuild {
        metadata: Default::default(),
        spec: Default::default(),
        status: Some(ImageBuildStatus {
            last_logs: None,
            conditions: vec![ImageBuildCondition {
                last_transition_time: Time(k8s_openapi::chrono::Utc::now()),
                message,
                observed_generation: build.metadata.generation,
                reason: reason.to_string(),
                status: status.to_string(),
                type_: CONDITION_CREDENTIALS_READY.to_string(),
            }],
        }),
    };

    api.patch_status(&build.name_any(), &patch_params(), &Patch::Apply(&patch))
        .await?;
    Ok(())
}

/// Materialize the verified credential file as a per-build secret the build
/// job mounts as its DOCKER_CONFIG.
async fn create_registry_auth_secret(
    build: &ImageBuild,
    ctx: &Context,
    composed: &ComposedCredentials,
) -> Result<()> {
    let ns = build.namespace().ok_or(Error::NamespaceRequired)?;
    let contents = std::fs::read(composed.config_path())?;

    let mut data = std::collections::BTreeMap::new();
    data.insert(".dockerconfigjson".to_string(), ByteString(contents));

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(registry_auth_secret_name(build)),
            namespace: build.namespace().clone(),
            owner_references: owned_by(build),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(data),
        ..Default::default()
    };

    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    api.patch(&secret.name_any(), &patch_params(), &Patch::Apply(&secret))
        .await?;
    Ok(())
}

async fn delete_job(build: &ImageBuild, ctx: &Context) -> Result<()> {
    let ns = &build.namespace().ok_or(Error::NamespaceRequired)?;
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), ns);
    let name = job_name_for(build);
    jobs.delete(
        &name,
        &DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        },
    )
    .await?;
    info!(name, "job deleted");
    Ok(())
}

async fn create_job(build: &ImageBuild, ctx: &Context) -> Result<()> {
    let ns = &build.namespace().ok_or(Error::NamespaceRequired)?;
    let job_name = job_name_for(build);

    let volumes = vec![Volume {
        name: "docker".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(registry_auth_secret_name(build)),
            items: Some(vec![KeyToPath {
                key: ".dockerconfigjson".to_string(),
                path: "config.json".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }];

    let mk_mount = |name: &str| VolumeMount {
        name: name.to_string(),
        mount_path: format!("/{name}"),
        ..Default::default()
    };
    let volume_mounts = Some(volumes.iter().map(|v| mk_mount(&v.name)).collect());

    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), ns);
    let job = Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            namespace: build.namespace().clone(),
            owner_references: owned_by(build),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    active_deadline_seconds: Some(1800),
                    volumes: Some(volumes),
                    containers: vec![Container {
                        name: "build".to_string(),
                        image: Some(BUILDKIT_IMAGE.to_string()),
                        command: Some(vec!["buildctl-daemonless.sh".to_string()]),
                        args: Some(vec![
                            "build".to_string(),
                            "--frontend".to_string(),
                            "dockerfile.v0".to_string(),
                            "--opt".to_string(),
                            format!("context={}", build.spec.context),
                            "--output".to_string(),
                            format!("type=image,name={},push=true", build.spec.image),
                        ]),
                        env: Some(vec![EnvVar {
                            name: "DOCKER_CONFIG".to_string(),
                            value: Some("/docker".to_string()),
                            ..Default::default()
                        }]),
                        volume_mounts: volume_mounts.clone(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    let pp = PostParams::default();

    handle_resource_exists(jobs.create(&pp, &job).await)?;

    Ok(())
}

// kube crate comes with is_job_completed but that condition is true only if it completes successfully.
fn is_job_failed() -> impl Condition<Job> {
    |obj: Option<&Job>| {
        if let Some(job) = &obj {
            if let Some(s) = &job.status {
                if let Some(conds) = &s.conditions {
                    if let Some(pcond) = conds.iter().find(|c| c.type_ == "Failed") {
                        return pcond.status == "True";
                    }
                }
            }
        }
        false
    }
}

async fn capture_logs(build: &ImageBuild, ctx: &Context, job_uid: String) -> Result<()> {
    let ns = &build.namespace().ok_or(Error::NamespaceRequired)?;
    info!(?ns, "reporting errors");

    let pods_api: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let job_name = job_name_for(build);

    let pods = pods_api
        .list(&ListParams {
            label_selector: Some(format!("job-name={job_name},controller-uid={job_uid}")),
            ..Default::default()
        })
        .await?;

    let mut per_container_logs = HashMap::new();

    // There should be exactly one pod per job. If something is broken with
    // k8s and two pods match the same job uid, concatenating their logs is
    // still easier to debug than logs from a random pod.
    for pod in pods.items {
        let mut container_names = vec![];

        let pod_status = pod.status.as_ref().unwrap();
        let container_statuses = [
            pod_status.init_container_statuses.as_ref(),
            pod_status.container_statuses.as_ref(),
        ]
        .into_iter()
        .flatten()
        .flat_map(|vec| vec.iter());

        for status in container_statuses {
            // we cannot get logs from a container that hasn't started yet.
            // We know a container hasn't started yet when:
            // 1. the container is explicitly in the "waiting" state
            // 2. the state field is empty
            let is_waiting = status
                .state
                .as_ref()
                .map(|x| x.waiting.is_some())
                .unwrap_or(true);
            info!(name = status.name, ?is_waiting, "Container status");
            if !is_waiting {
                container_names.push(&status.name);
            }
        }

        for container_name in container_names {
            let logs = pods_api
                .logs(
                    &pod.name_any(),
                    &LogParams {
                        container: Some(container_name.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            per_container_logs
                .entry(container_name.clone())
                .and_modify(|e: &mut String| e.push_str(&logs))
                .or_insert(logs);
        }
    }

    let builds_api: Api<ImageBuild> = Api::namespaced(ctx.client.clone(), ns);

    let build_patch = ImageBuild {
        metadata: Default::default(),
        spec: Default::default(),
        status: Some(ImageBuildStatus {
            last_logs: Some(per_container_logs),
            conditions: vec![],
        }),
    };
    builds_api
        .patch_status(
            &build.name_any(),
            &patch_params(),
            &Patch::Apply(&build_patch),
        )
        .await?;
    info!("status patched");
    Ok(())
}
