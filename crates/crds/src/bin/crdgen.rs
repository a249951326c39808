//! Prints every lattice CRD as a multi-document YAML stream.
//!
//! `cargo run -p crds --bin crdgen > config/crds.yaml`

use crds::{
    ComponentBuild, Config, Service, ServiceBuild, System, SystemBuild, SystemRollout,
    SystemTeardown,
};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        ComponentBuild::crd(),
        ServiceBuild::crd(),
        SystemBuild::crd(),
        Service::crd(),
        System::crd(),
        SystemRollout::crd(),
        SystemTeardown::crd(),
        Config::crd(),
    ];

    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }

    Ok(())
}
