//! Prints the PostgresCluster CRD manifest as YAML.

use crds::PostgresCluster;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&PostgresCluster::crd())?);
    Ok(())
}
