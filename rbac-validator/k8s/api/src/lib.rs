#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod application;

pub use self::application::{Application, ApplicationDestination, ApplicationSpec};
pub use k8s_openapi::{
    api::{
        self,
        authorization::v1::{
            ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
            SubjectAccessReviewStatus,
        },
        core::v1::{ConfigMap, Namespace, Secret},
    },
    apimachinery::pkg::apis::meta::v1::Time,
    ByteString,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    Client, Error, Resource,
};
