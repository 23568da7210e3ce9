//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to print the up-to-date CRD, ready to be
//! synced with the cluster: `cargo run --example crd > leaderworkerset.yaml`.

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use lws_core::crd::LeaderWorkerSet;

fn main() -> Result<()> {
    let crd = LeaderWorkerSet::crd();
    let crd_yaml = serde_yaml::to_string(&crd).context("error serializing LeaderWorkerSet CRD to yaml")?;
    println!("{}", crd_yaml);
    Ok(())
}
