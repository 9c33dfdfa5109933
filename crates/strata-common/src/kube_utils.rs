//! Kubernetes helpers shared by the operator's store implementation

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};

use crate::Error;

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Uses a JSON merge patch, so only the fields present in `status` change.
/// A 404 becomes [`Error::NotFound`] and a 409 becomes [`Error::Conflict`].
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> Result<(), Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    let kind = T::kind(&Default::default()).to_string();
    match api
        .patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::not_found(kind, name)),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::Conflict {
            kind,
            name: name.to_string(),
            message: ae.message,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Get a namespaced resource, mapping 404 to `None`
pub async fn get_optional<T>(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<T>, Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}

/// Decode a Secret's `data` and `stringData` into a string map.
///
/// Values that are not valid UTF-8 are skipped.
pub fn secret_string_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            if let Ok(decoded) = String::from_utf8(value.0.clone()) {
                result.insert(key.clone(), decoded);
            }
        }
    }
    if let Some(string_data) = &secret.string_data {
        result.extend(string_data.clone());
    }
    result
}

/// Controller owner reference pointing at `owner`
pub fn owner_reference<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.meta().name.clone()?,
        uid: owner.meta().uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Namespace of a resource, falling back to `default`
pub fn namespace_or_default<K: Resource>(resource: &K) -> String {
    resource.namespace().unwrap_or_else(|| "default".to_string())
}
