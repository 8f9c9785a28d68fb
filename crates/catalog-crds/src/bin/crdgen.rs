//! Prints every service catalog CRD as a multi-document YAML stream.
//!
//! `cargo run -p catalog-crds --bin crdgen > config/crds.yaml`

use catalog_crds::{ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        ServiceBroker::crd(),
        ServiceClass::crd(),
        ServicePlan::crd(),
        ServiceInstance::crd(),
        ServiceBinding::crd(),
    ];

    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
