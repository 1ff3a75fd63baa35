#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod labels;
pub mod multicluster;
pub mod policy;
pub mod profile;

pub use self::labels::Labels;
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Container, ContainerPort, EndpointAddress, EndpointSubset, Endpoints, Namespace, Node,
            NodeSpec, Pod, PodSpec, PodStatus, Secret, Service, ServiceAccount, ServicePort,
            ServiceSpec,
        },
        discovery::v1::{Endpoint, EndpointConditions, EndpointSlice},
    },
    apimachinery::{
        self,
        pkg::{
            apis::meta::v1::{Condition, Time},
            util::intstr::IntOrString,
        },
    },
    NamespaceResourceScope,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    error::ErrorResponse,
    runtime::watcher::Event as WatchEvent,
    Client, Error,
};
