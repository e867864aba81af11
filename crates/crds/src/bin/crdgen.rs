//! Prints the Kantaloupe CRDs as a multi-document YAML stream.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crds.yaml`

use crds::{Cluster, KantaloupeFlow};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [Cluster::crd(), KantaloupeFlow::crd()];
    for crd in &crds {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
