use super::MANAGER_NAME;
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use roundtable_types::*;
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, fmt::Debug};

pub trait Object<S: Status> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status {
    /// Records the generation the status reflects, so a reader can tell
    /// whether the status lags behind the most recent spec edit.
    fn set_observed_generation(&mut self, generation: i64);
}

impl Object<AgentStatus> for Agent {
    fn mut_status(&mut self) -> &mut AgentStatus {
        if self.status.is_none() {
            self.status = Some(Default::default());
        }
        self.status.as_mut().unwrap()
    }
}

impl Status for AgentStatus {
    fn set_observed_generation(&mut self, generation: i64) {
        self.observed_generation = generation;
    }
}

impl Object<PipelineStatus> for Pipeline {
    fn mut_status(&mut self) -> &mut PipelineStatus {
        if self.status.is_none() {
            self.status = Some(Default::default());
        }
        self.status.as_mut().unwrap()
    }
}

impl Status for PipelineStatus {
    fn set_observed_generation(&mut self, generation: i64) {
        self.observed_generation = generation;
    }
}

impl Object<MissionStatus> for Mission {
    fn mut_status(&mut self) -> &mut MissionStatus {
        if self.status.is_none() {
            self.status = Some(Default::default());
        }
        self.status.as_mut().unwrap()
    }
}

impl Status for MissionStatus {
    fn set_observed_generation(&mut self, generation: i64) {
        self.observed_generation = generation;
    }
}

impl Object<FleetStatus> for Fleet {
    fn mut_status(&mut self) -> &mut FleetStatus {
        if self.status.is_none() {
            self.status = Some(Default::default());
        }
        self.status.as_mut().unwrap()
    }
}

impl Status for FleetStatus {
    fn set_observed_generation(&mut self, generation: i64) {
        self.observed_generation = generation;
    }
}

/// Patches the resource's status subresource with the result of `f`,
/// applied to a clone of the current status, diffed against the original.
pub async fn patch_status<S: Status, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let generation = instance.meta().generation.unwrap_or(0);
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        let status = modified.mut_status();
        f(status);
        status.set_observed_generation(generation);
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}
