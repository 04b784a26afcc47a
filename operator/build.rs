use kube::CustomResourceExt;
use roundtable_types::*;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    for (file, yaml) in [
        (
            "roundtable.ai_agents_crd.yaml",
            serde_yaml::to_string(&Agent::crd()).unwrap(),
        ),
        (
            "roundtable.ai_pipelines_crd.yaml",
            serde_yaml::to_string(&Pipeline::crd()).unwrap(),
        ),
        (
            "roundtable.ai_missions_crd.yaml",
            serde_yaml::to_string(&Mission::crd()).unwrap(),
        ),
        (
            "roundtable.ai_fleets_crd.yaml",
            serde_yaml::to_string(&Fleet::crd()).unwrap(),
        ),
    ] {
        fs::write(format!("../crds/{file}"), yaml).unwrap();
    }
}
