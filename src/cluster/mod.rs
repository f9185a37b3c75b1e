// (C) Copyright 2020 Hewlett Packard Enterprise Development LP

pub mod kubernetes;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use kubernetes::KubernetesCluster;
pub use types::{
  is_infra_container, Cluster, ContainerRef, LogSink, LogStreamParams,
  Resource, ResourceKind, Since, StreamHandle, HTTP_REQUEST_FAILED
};
