use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, ResourceExt},
    runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter},
    Client, Resource,
};
use tracing::warn;

use super::{selector, EventSeverity, Managed, ObjectEvent, Store};
use crate::controller::helpers::FIELD_MANAGER;
use crate::error::{Error, Result};

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    reporter: Reporter,
}

impl KubeStore {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: Managed>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Build an ObjectReference from any kube Resource.
pub fn kube_object_ref<K: Managed>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Classify API errors: 409 and 404 become their domain variants so the
/// error policy can requeue them without backoff.
fn classify(err: kube::Error, what: String) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(format!("{what}: {}", ae.message)),
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(format!("{what}: {}", ae.message)),
        other => Error::Kube(other),
    }
}

/// Outcome of a delete call: true when a deletion was issued, false when
/// the object was already gone.
fn deletion_outcome<T>(result: Result<T, kube::Error>, what: String) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(classify(e, what)),
    }
}

fn describe<K: Managed>(namespace: &str, name: &str) -> String {
    format!("{} {namespace}/{name}", K::kind(&()))
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, describe::<K>(namespace, name)))
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<K>> {
        let mut lp = ListParams::default();
        if let Some(sel) = selector {
            lp = lp.labels_from(&selector::parse(sel)?);
        }
        let list = self
            .api::<K>(namespace)
            .list(&lp)
            .await
            .map_err(|e| classify(e, format!("{} list in {namespace}", K::kind(&()))))?;
        Ok(list.items)
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .clone()
            .or_else(|| obj.meta().generate_name.clone())
            .unwrap_or_default();
        self.api::<K>(namespace)
            .create(&Self::post_params(), obj)
            .await
            .map_err(|e| classify(e, describe::<K>(namespace, &name)))
    }

    async fn replace<K: Managed>(&self, obj: &K) -> Result<K> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        self.api::<K>(&ns)
            .replace(&name, &Self::post_params(), obj)
            .await
            .map_err(|e| classify(e, describe::<K>(&ns, &name)))
    }

    async fn replace_status<K: Managed>(&self, obj: &K) -> Result<K> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let body = serde_json::to_vec(obj)?;
        self.api::<K>(&ns)
            .replace_status(&name, &Self::post_params(), body)
            .await
            .map_err(|e| classify(e, describe::<K>(&ns, &name)))
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<bool> {
        let result = self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await;
        deletion_outcome(result, describe::<K>(namespace, name))
    }

    async fn publish_event<K: Managed>(&self, obj: &K, event: ObjectEvent) {
        let rec = Recorder::new(self.client.clone(), self.reporter.clone());
        let oref = kube_object_ref(obj);
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        if let Err(e) = rec
            .publish(
                &KubeEvent {
                    type_,
                    reason: event.reason,
                    note: event.note,
                    action: event.action,
                    secondary: None,
                },
                &oref,
            )
            .await
        {
            warn!(%e, "failed to publish event");
        }
    }
}
