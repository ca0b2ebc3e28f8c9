//! Generate CRD YAML from Rust types.
//!
//! Usage:
//!   cargo run --bin crdgen              # all CRDs to stdout
//!   cargo run --bin crdgen -- --out-dir ./crds   # one file per CRD

use std::path::PathBuf;

use anyhow::Context;
use kube::CustomResourceExt;

use eksforge_operator::crd::{
    apply_request::ApplyRequest, cluster::EksCluster, control_plane::EksControlPlane,
    machine::EksMachine, machine_deployment::EksMachineDeployment, machine_set::EksMachineSet,
    template::ModuleTemplate,
};

fn main() -> anyhow::Result<()> {
    let out_dir: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out-dir")
        .nth(1)
        .map(PathBuf::from);

    let crds = vec![
        ("ekscluster-crd.yaml", serde_yaml::to_string(&EksCluster::crd())?),
        ("ekscontrolplane-crd.yaml", serde_yaml::to_string(&EksControlPlane::crd())?),
        ("eksmachine-crd.yaml", serde_yaml::to_string(&EksMachine::crd())?),
        ("eksmachineset-crd.yaml", serde_yaml::to_string(&EksMachineSet::crd())?),
        (
            "eksmachinedeployment-crd.yaml",
            serde_yaml::to_string(&EksMachineDeployment::crd())?,
        ),
        ("applyrequest-crd.yaml", serde_yaml::to_string(&ApplyRequest::crd())?),
        ("moduletemplate-crd.yaml", serde_yaml::to_string(&ModuleTemplate::crd())?),
    ];

    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            for (name, yaml) in &crds {
                let path = dir.join(name);
                std::fs::write(&path, format!("---\n{yaml}"))
                    .with_context(|| format!("failed to write {}", path.display()))?;
                eprintln!("wrote {}", path.display());
            }
        }
        None => {
            for (_name, yaml) in &crds {
                println!("---\n{yaml}");
            }
        }
    }
    Ok(())
}
