use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RecreateDeployment};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams, Resource},
};
use roundtable_common::annotations;
use roundtable_types::*;

use crate::util::{self, Error, MANAGER_NAME, patch::patch_status};

pub fn instance_name(instance: &Agent) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Agent is missing metadata.name".to_string()))
}

pub fn instance_namespace(instance: &Agent) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Agent is missing metadata.namespace".to_string()))
}

pub fn consumer_name(instance: &Agent) -> String {
    instance
        .spec
        .bus
        .consumer_name
        .clone()
        .unwrap_or_else(|| format!("agent-{}", instance.name_any()))
}

fn instance_labels(instance: &Agent) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("instance".to_string(), instance.name_any());
    labels.insert("domain".to_string(), instance.spec.domain.clone());
    labels.insert(annotations::MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels
}

fn owner_ref(instance: &Agent) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
    instance.controller_owner_ref(&()).expect("Agent is namespaced")
}

/// Renders the toolchain-manager configuration file content for `tools.toolchain`.
fn render_toolchain_config(tools: &AgentTools) -> String {
    let mut out = String::from("{ pkgs }:\n{\n  packages = [\n");
    for pkg in &tools.toolchain {
        out.push_str(&format!("    pkgs.{pkg}\n"));
    }
    out.push_str("  ];\n}\n");
    out
}

/// Renders the native-package flake (only meaningful when `tools.native` is non-empty).
fn render_native_flake(tools: &AgentTools) -> String {
    let mut out = String::from("{\n  description = \"agent native package store\";\n  packages = [\n");
    for pkg in &tools.native {
        out.push_str(&format!("    \"{pkg}\"\n"));
    }
    out.push_str("  ];\n}\n");
    out
}

/// Renders the system-package manifest (apt/apk-style list) for `tools.system`.
fn render_system_manifest(tools: &AgentTools) -> String {
    tools.system.join("\n")
}

/// Composes the Agent's config artifact per `spec.md` §4.1 step 4: skills
/// CSV, toolchain-manager config, optional native flake, optional system
/// manifest, optional prompt blobs.
pub fn config_map_resource(instance: &Agent) -> Result<ConfigMap, Error> {
    let name = config_map_name(instance);
    let namespace = instance_namespace(instance)?.to_string();
    let mut data = BTreeMap::new();
    data.insert("skills".to_string(), instance.spec.skills.join(","));
    data.insert(
        "toolchain.nix".to_string(),
        render_toolchain_config(&instance.spec.tools),
    );
    if !instance.spec.tools.native.is_empty() {
        data.insert("native-flake.nix".to_string(), render_native_flake(&instance.spec.tools));
    }
    if !instance.spec.tools.system.is_empty() {
        data.insert(
            "system-packages.txt".to_string(),
            render_system_manifest(&instance.spec.tools),
        );
    }
    if let Some(prompt) = &instance.spec.prompt {
        if let Some(identity) = &prompt.identity {
            data.insert("identity.md".to_string(), identity.clone());
        }
        if let Some(instructions) = &prompt.instructions {
            data.insert("instructions.md".to_string(), instructions.clone());
        }
    }
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(instance_labels(instance)),
            owner_references: Some(vec![owner_ref(instance)]),
            annotations: Some(BTreeMap::from([(
                annotations::SPEC_HASH.to_string(),
                util::hash_spec(&instance.spec),
            )])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

pub fn config_map_name(instance: &Agent) -> String {
    format!("{}-config", instance.name_any())
}

pub fn workspace_claim_name(instance: &Agent) -> Option<String> {
    if let Some(ws) = &instance.spec.workspace
        && let Some(existing) = &ws.existing_claim
    {
        return Some(existing.clone());
    }
    Some(format!("{}-workspace", instance.name_any()))
}

fn workspace_size(instance: &Agent) -> String {
    instance
        .spec
        .workspace
        .as_ref()
        .and_then(|w| w.size.clone())
        .unwrap_or_else(|| "1Gi".to_string())
}

fn pvc(instance: &Agent, name: String, size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: instance_namespace(instance).ok().map(str::to_string),
            labels: Some(instance_labels(instance)),
            owner_references: Some(vec![owner_ref(instance)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The workspace PVC to create, or `None` when `existingClaim` is set
/// (`spec.md` §4.1 step 4: "if `existingClaim` is set, skip creation").
pub fn workspace_pvc_resource(instance: &Agent) -> Option<PersistentVolumeClaim> {
    if instance
        .spec
        .workspace
        .as_ref()
        .is_some_and(|w| w.existing_claim.is_some())
    {
        return None;
    }
    Some(pvc(
        instance,
        workspace_claim_name(instance).unwrap(),
        &workspace_size(instance),
    ))
}

pub fn native_store_claim_name(instance: &Agent) -> String {
    format!("{}-native-store", instance.name_any())
}

/// The second 5Gi native-package store volume, only created when
/// `tools.native` is non-empty.
pub fn native_store_pvc_resource(instance: &Agent) -> Option<PersistentVolumeClaim> {
    if instance.spec.tools.native.is_empty() {
        return None;
    }
    Some(pvc(instance, native_store_claim_name(instance), "5Gi"))
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn resource_requirements(instance: &Agent) -> Option<ResourceRequirements> {
    let cpu = instance.spec.resources.cpu.clone();
    let memory = instance.spec.resources.memory.clone();
    if cpu.is_none() && memory.is_none() {
        return None;
    }
    let mut map = BTreeMap::new();
    if let Some(cpu) = cpu {
        map.insert("cpu".to_string(), Quantity(cpu));
    }
    if let Some(memory) = memory {
        map.insert("memory".to_string(), Quantity(memory));
    }
    Some(ResourceRequirements {
        requests: Some(map.clone()),
        limits: Some(map),
        ..Default::default()
    })
}

/// Composes the agent's primary workload container.
fn agent_container(instance: &Agent, bus_url: &str) -> Container {
    let filter_subjects = instance.spec.bus.filter_subjects.join(",");
    let mut env = vec![
        env_var("AGENT_NAME", instance.name_any()),
        env_var("MODEL", instance.spec.model.clone().unwrap_or_default()),
        env_var("BUS_URL", bus_url.to_string()),
        env_var("SUBSCRIBE_TOPICS", filter_subjects),
        env_var("MAX_CONCURRENT", instance.spec.concurrency.to_string()),
        env_var(
            "TASK_TIMEOUT_MS",
            (instance.spec.task_timeout_seconds as u64 * 1000).to_string(),
        ),
        EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    env.extend(instance.spec.env.clone());

    let mut mounts = vec![
        VolumeMount {
            name: "workspace".to_string(),
            mount_path: "/workspace".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "config".to_string(),
            mount_path: "/config".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "arsenal".to_string(),
            mount_path: "/arsenal".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "skills".to_string(),
            mount_path: "/skills".to_string(),
            ..Default::default()
        },
    ];
    if !instance.spec.tools.native.is_empty() {
        mounts.push(VolumeMount {
            name: "native-store".to_string(),
            mount_path: "/native-store".to_string(),
            ..Default::default()
        });
    }
    if let Some(vault) = &instance.spec.vault {
        mounts.push(VolumeMount {
            name: "vault".to_string(),
            mount_path: "/vault".to_string(),
            read_only: Some(vault.read_only && vault.writable_subpaths.is_empty()),
            ..Default::default()
        });
        for subpath in &vault.writable_subpaths {
            mounts.push(VolumeMount {
                name: "vault".to_string(),
                mount_path: format!("/vault/{subpath}"),
                sub_path: Some(subpath.clone()),
                read_only: Some(false),
                ..Default::default()
            });
        }
    }

    Container {
        name: "agent".to_string(),
        image: Some(
            instance
                .spec
                .image
                .clone()
                .unwrap_or_else(|| "roundtable/agent-runtime:latest".to_string()),
        ),
        env: Some(env),
        env_from: Some(instance.spec.env_from.clone()),
        volume_mounts: Some(mounts),
        resources: resource_requirements(instance),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_string()),
                port: k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(3000),
                ..Default::default()
            }),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/ready".to_string()),
                port: k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(3000),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
            container_port: 3000,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// The skill-filter sidecar: symlinks selected skill categories from the
/// shared arsenal volume into `/skills`, retrying until all are linked,
/// then polling every 60s for changes (`spec.md` §4.1 step 4(b)).
fn skill_filter_sidecar(instance: &Agent) -> Container {
    let categories = instance.spec.skills.join(" ");
    let repo_name = instance
        .spec
        .arsenal
        .as_ref()
        .map(|a| repo_basename(&a.repo))
        .unwrap_or_else(|| "skills".to_string());
    let script = format!(
        r#"set -eu
CATEGORIES="{categories}"
REPO="{repo_name}"
link_all() {{
  for cat in $CATEGORIES; do
    [ -d "/arsenal/$REPO/$cat" ] || return 1
    ln -sfn "/arsenal/$REPO/$cat" "/skills/$cat"
  done
  return 0
}}
until link_all; do sleep 2; done
while true; do
  link_all || true
  sleep 60
done
"#
    );
    Container {
        name: "skill-filter".to_string(),
        image: Some("busybox:stable".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "arsenal".to_string(),
                mount_path: "/arsenal".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "skills".to_string(),
                mount_path: "/skills".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn repo_basename(repo: &str) -> String {
    repo.trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or(repo)
        .to_string()
}

/// Optional arsenal-sync sidecar, present only when `spec.arsenal` is set.
fn arsenal_sync_sidecar(arsenal: &ArsenalSpec) -> Container {
    let repo_name = repo_basename(&arsenal.repo);
    let script = format!(
        r#"set -eu
while true; do
  if [ -d "/arsenal/{repo_name}/.git" ]; then
    git -C "/arsenal/{repo_name}" fetch --depth 1 origin {git_ref}
    git -C "/arsenal/{repo_name}" reset --hard FETCH_HEAD
  else
    git clone --depth 1 --branch {git_ref} {repo} "/arsenal/{repo_name}"
  fi
  sleep {period}
done
"#,
        git_ref = arsenal.git_ref,
        repo = arsenal.repo,
        period = arsenal.sync_period_seconds,
    );
    Container {
        name: "arsenal-sync".to_string(),
        image: Some(arsenal.image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(vec![VolumeMount {
            name: "arsenal".to_string(),
            mount_path: "/arsenal".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn deployment_name(instance: &Agent) -> String {
    instance.name_any()
}

/// Composes the Agent's workload per `spec.md` §4.1 step 4: a single
/// replicated Deployment, `strategy=Recreate`, containing the agent
/// container, the skill-filter sidecar, and (optionally) the
/// arsenal-sync sidecar.
pub fn deployment_resource(instance: &Agent, bus_url: &str) -> Result<Deployment, Error> {
    let name = deployment_name(instance);
    let namespace = instance_namespace(instance)?.to_string();
    let labels = instance_labels(instance);
    let replicas = if instance.spec.suspended { 0 } else { 1 };

    let mut containers = vec![agent_container(instance, bus_url), skill_filter_sidecar(instance)];
    if let Some(arsenal) = &instance.spec.arsenal {
        containers.push(arsenal_sync_sidecar(arsenal));
    }

    let mut volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
                name: config_map_name(instance),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "arsenal".to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        },
        Volume {
            name: "skills".to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        },
    ];
    volumes.push(Volume {
        name: "workspace".to_string(),
        persistent_volume_claim: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
            claim_name: workspace_claim_name(instance).unwrap(),
            ..Default::default()
        }),
        ..Default::default()
    });
    if !instance.spec.tools.native.is_empty() {
        volumes.push(Volume {
            name: "native-store".to_string(),
            persistent_volume_claim: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                claim_name: native_store_claim_name(instance),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if let Some(vault) = &instance.spec.vault {
        volumes.push(Volume {
            name: "vault".to_string(),
            persistent_volume_claim: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                claim_name: vault.claim_name.clone(),
                read_only: Some(vault.read_only),
            }),
            ..Default::default()
        });
    }

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_ref(instance)]),
            annotations: Some(BTreeMap::from([(
                annotations::SPEC_HASH.to_string(),
                util::hash_spec(&instance.spec),
            )])),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(volumes),
                    security_context: Some(PodSecurityContext {
                        fs_group: Some(1000),
                        run_as_user: Some(1000),
                        run_as_group: Some(1000),
                        fs_group_change_policy: Some("OnRootMismatch".to_string()),
                        ..Default::default()
                    }),
                    automount_service_account_token: Some(false),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

async fn upsert<K>(api: &Api<K>, name: &str, desired: &K) -> Result<(), Error>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(_) => {
            api.patch(
                name,
                &PatchParams::apply(MANAGER_NAME).force(),
                &Patch::Apply(desired),
            )
            .await?;
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            api.create(&Default::default(), desired).await?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Upserts config map, volumes, and workload, per `spec.md` §4.1 step 4.
/// Returns `Err` if any child upsert fails, so the caller can mark the
/// Agent `Degraded`.
pub async fn reconcile_children(client: Client, instance: &Agent, bus_url: &str) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?;

    let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    upsert(&cm_api, &config_map_name(instance), &config_map_resource(instance)?).await?;

    let pvc_api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    if let Some(ws) = workspace_pvc_resource(instance) {
        upsert(&pvc_api, &workspace_claim_name(instance).unwrap(), &ws).await?;
    }
    if let Some(native) = native_store_pvc_resource(instance) {
        upsert(&pvc_api, &native_store_claim_name(instance), &native).await?;
    }

    let deploy_api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    upsert(&deploy_api, &deployment_name(instance), &deployment_resource(instance, bus_url)?).await?;

    Ok(())
}

/// Scales the owned Deployment to zero replicas without touching any
/// other child (`spec.md` §4.1 step 3: "an Agent with `suspended=true`
/// runs zero replicas").
pub async fn suspend(client: Client, instance: &Agent) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?;
    let deploy_api: Api<Deployment> = Api::namespaced(client, namespace);
    if deploy_api.get(&deployment_name(instance)).await.is_ok() {
        let patch = serde_json::json!({"spec": {"replicas": 0}});
        deploy_api
            .patch(
                &deployment_name(instance),
                &PatchParams::apply(MANAGER_NAME),
                &Patch::Merge(patch),
            )
            .await?;
    }
    Ok(())
}

pub async fn mark_phase(
    client: Client,
    instance: &Agent,
    phase: AgentPhase,
    ready: bool,
    available: bool,
    reason: &str,
    message: String,
) -> Result<(), Error> {
    let generation = instance.meta().generation.unwrap_or(0);
    patch_status::<AgentStatus, Agent>(client, instance, |status| {
        status.phase = phase;
        status.ready = ready;
        status.consumer_name = Some(consumer_name(instance));
        set_condition(&mut status.conditions, "Available", available, reason, message, generation);
    })
    .await?;
    Ok(())
}

/// Bus-consumer teardown run from the deletion path, per `spec.md` §3:
/// "no orphaned bus consumers... on deletion."
pub async fn teardown_consumer(bus: &roundtable_common::bus::Bus, instance: &Agent) -> Result<(), Error> {
    let stream = instance
        .spec
        .bus
        .primary_stream
        .clone()
        .unwrap_or_else(|| "tasks".to_string());
    bus.delete_consumer(&stream, &consumer_name(instance))
        .await
        .map_err(Error::from)
}
