//! Kubernetes pod driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{Value, json};

use labvisor_protocol::{BackendKind, PortRole};

use super::kube::{ExecStream, KubeClient};
use super::{
    AttachTarget, BackendDriver, BackendError, BackendResult, ExecOutput, LABEL_MANAGED,
    LABEL_SESSION, OwnedUnit, ResourceHandle, UnitStatus, WorkloadSpec, validate_env_key,
    validate_image_name, validate_unit_name,
};
use crate::config::TransportChoice;

/// Name of the single workload container inside every lab pod.
pub const LAB_CONTAINER: &str = "lab";
const HOME_CLAIM_SIZE: &str = "5Gi";

/// Pod-level API surface, mockable in tests.
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn create_pod(&self, namespace: &str, manifest: &Value) -> BackendResult<Value>;
    async fn get_pod(&self, namespace: &str, name: &str) -> BackendResult<Option<Value>>;
    async fn delete_pod(&self, namespace: &str, name: &str, grace_secs: u64) -> BackendResult<()>;
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> BackendResult<Vec<Value>>;
    async fn create_service(&self, namespace: &str, manifest: &Value) -> BackendResult<()>;
    async fn delete_service(&self, namespace: &str, name: &str) -> BackendResult<()>;
    async fn create_claim(&self, namespace: &str, manifest: &Value) -> BackendResult<()>;
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> BackendResult<ExecOutput>;
    /// Interactive (tty) exec stream.
    async fn open_exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> BackendResult<ExecStream>;
}

fn ignore_conflict(result: BackendResult<Value>) -> BackendResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

fn ignore_missing(result: BackendResult<Value>) -> BackendResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl PodApi for KubeClient {
    async fn create_pod(&self, namespace: &str, manifest: &Value) -> BackendResult<Value> {
        self.post(&format!("/api/v1/namespaces/{}/pods", namespace), manifest)
            .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> BackendResult<Option<Value>> {
        match self
            .get(&format!("/api/v1/namespaces/{}/pods/{}", namespace, name))
            .await
        {
            Ok(pod) => Ok(Some(pod)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str, grace_secs: u64) -> BackendResult<()> {
        ignore_missing(
            self.delete(
                &format!("/api/v1/namespaces/{}/pods/{}", namespace, name),
                Some(grace_secs),
            )
            .await,
        )
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> BackendResult<Vec<Value>> {
        let list = self
            .get(&format!(
                "/api/v1/namespaces/{}/pods?labelSelector={}",
                namespace,
                urlencoding::encode(label_selector)
            ))
            .await?;
        Ok(list
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_service(&self, namespace: &str, manifest: &Value) -> BackendResult<()> {
        ignore_conflict(
            self.post(&format!("/api/v1/namespaces/{}/services", namespace), manifest)
                .await,
        )
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> BackendResult<()> {
        ignore_missing(
            self.delete(
                &format!("/api/v1/namespaces/{}/services/{}", namespace, name),
                None,
            )
            .await,
        )
    }

    async fn create_claim(&self, namespace: &str, manifest: &Value) -> BackendResult<()> {
        ignore_conflict(
            self.post(
                &format!("/api/v1/namespaces/{}/persistentvolumeclaims", namespace),
                manifest,
            )
            .await,
        )
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> BackendResult<ExecOutput> {
        KubeClient::open_exec(self, namespace, pod, container, argv, false)
            .await?
            .collect()
            .await
    }

    async fn open_exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> BackendResult<ExecStream> {
        KubeClient::open_exec(self, namespace, pod, container, argv, true).await
    }
}

/// Label values must be DNS-label-like; the exact IDs travel in annotations.
fn label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Render the pod manifest for `spec`.
pub fn pod_manifest(spec: &WorkloadSpec) -> Value {
    let labels: serde_json::Map<String, Value> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(label_value(v))))
        .collect();
    let annotations: serde_json::Map<String, Value> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let env: Vec<Value> = spec
        .env
        .iter()
        .map(|(k, v)| json!({ "name": k, "value": v }))
        .collect();
    let ports: Vec<Value> = spec
        .ports
        .iter()
        .map(|(role, host_port)| {
            json!({
                "name": role.to_string(),
                "containerPort": role.guest_port(),
                "hostPort": host_port,
                "protocol": "TCP",
            })
        })
        .collect();
    let cpu = format!("{}m", (spec.cpus * 1000.0).round() as u32);
    let memory = format!("{}Mi", spec.memory_mb);

    let mut container = json!({
        "name": LAB_CONTAINER,
        "image": spec.image,
        "env": env,
        "ports": ports,
        "resources": {
            "limits": { "cpu": cpu, "memory": memory },
            "requests": { "cpu": cpu, "memory": memory },
        },
        "stdin": true,
        "tty": true,
    });
    if !spec.command.is_empty() {
        container["command"] = json!(spec.command);
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "containers": [],
    });
    if let Some(ref volume) = spec.volume {
        container["volumeMounts"] = json!([{ "name": "home", "mountPath": spec.home_dir }]);
        pod_spec["volumes"] = json!([{
            "name": "home",
            "persistentVolumeClaim": { "claimName": volume },
        }]);
    }
    pod_spec["containers"] = json!([container]);

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "labels": labels,
            "annotations": annotations,
        },
        "spec": pod_spec,
    })
}

/// ClusterIP service exposing the remote-display ports of a desktop pod.
pub fn desktop_service_manifest(spec: &WorkloadSpec) -> Value {
    let ports: Vec<Value> = [PortRole::Vnc, PortRole::Web]
        .iter()
        .map(|role| {
            json!({
                "name": role.to_string(),
                "port": role.guest_port(),
                "targetPort": role.guest_port(),
            })
        })
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": spec.name,
            "labels": { LABEL_MANAGED: "true" },
        },
        "spec": {
            "selector": { LABEL_SESSION: label_value(&spec.session_id) },
            "ports": ports,
        },
    })
}

fn claim_manifest(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
            "labels": { LABEL_MANAGED: "true" },
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": HOME_CLAIM_SIZE } },
        },
    })
}

fn pod_phase(pod: &Value) -> Option<&str> {
    pod.pointer("/status/phase").and_then(Value::as_str)
}

fn pod_is_terminating(pod: &Value) -> bool {
    pod.pointer("/metadata/deletionTimestamp").is_some()
}

fn all_containers_ready(pod: &Value) -> bool {
    match pod
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
    {
        Some(statuses) if !statuses.is_empty() => statuses
            .iter()
            .all(|s| s.get("ready").and_then(Value::as_bool) == Some(true)),
        _ => false,
    }
}

/// [`BackendDriver`] for Kubernetes pods in a dedicated namespace.
#[derive(Clone)]
pub struct PodDriver {
    api: Arc<dyn PodApi>,
    namespace: String,
    kubectl_binary: String,
    /// Resolved terminal transport; never `Auto`.
    transport: TransportChoice,
}

impl PodDriver {
    pub fn new(
        api: Arc<dyn PodApi>,
        namespace: impl Into<String>,
        kubectl_binary: impl Into<String>,
        transport: TransportChoice,
    ) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            kubectl_binary: kubectl_binary.into(),
            transport,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn namespace_of<'a>(&'a self, handle: &'a ResourceHandle) -> &'a str {
        handle.namespace.as_deref().unwrap_or(&self.namespace)
    }

    fn handle_for(&self, name: &str, pod: Option<&Value>) -> ResourceHandle {
        let id = pod
            .and_then(|p| p.pointer("/metadata/uid"))
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string();
        ResourceHandle {
            backend: BackendKind::Pod,
            id,
            name: name.to_string(),
            namespace: Some(self.namespace.clone()),
            network: None,
            pid_file: None,
        }
    }

    /// Wait for the pod object to disappear.
    async fn wait_gone(&self, namespace: &str, name: &str, limit: Duration) -> BackendResult<bool> {
        let start = tokio::time::Instant::now();
        loop {
            if self.api.get_pod(namespace, name).await?.is_none() {
                return Ok(true);
            }
            if start.elapsed() >= limit {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[async_trait]
impl BackendDriver for PodDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Pod
    }

    async fn start(&self, spec: &WorkloadSpec) -> BackendResult<ResourceHandle> {
        validate_unit_name(&spec.name)?;
        validate_image_name(&spec.image)?;
        for key in spec.env.keys() {
            validate_env_key(key)?;
        }

        if let Some(ref volume) = spec.volume {
            self.api
                .create_claim(&self.namespace, &claim_manifest(volume))
                .await?;
        }

        let pod = match self
            .api
            .create_pod(&self.namespace, &pod_manifest(spec))
            .await
        {
            Ok(pod) => Some(pod),
            Err(e) if e.is_already_exists() => {
                info!("Pod {} already exists, adopting", spec.name);
                self.api.get_pod(&self.namespace, &spec.name).await?
            }
            Err(e) => return Err(e),
        };

        if spec.desktop
            && let Err(e) = self
                .api
                .create_service(&self.namespace, &desktop_service_manifest(spec))
                .await
        {
            warn!("Failed to create desktop service for {}: {}", spec.name, e);
            let _ = self.api.delete_pod(&self.namespace, &spec.name, 0).await;
            return Err(e);
        }

        info!(
            "Created pod {}/{} for session {}",
            self.namespace, spec.name, spec.session_id
        );
        Ok(self.handle_for(&spec.name, pod.as_ref()))
    }

    async fn status(&self, handle: &ResourceHandle) -> BackendResult<UnitStatus> {
        let Some(pod) = self
            .api
            .get_pod(self.namespace_of(handle), &handle.name)
            .await?
        else {
            return Ok(UnitStatus::Stopped);
        };
        if pod_is_terminating(&pod) {
            return Ok(UnitStatus::Stopped);
        }
        Ok(match pod_phase(&pod) {
            Some("Running") => UnitStatus::Running,
            Some("Succeeded") | Some("Failed") => UnitStatus::Stopped,
            _ => UnitStatus::Unknown,
        })
    }

    async fn is_ready(&self, handle: &ResourceHandle) -> BackendResult<bool> {
        let pod = self
            .api
            .get_pod(self.namespace_of(handle), &handle.name)
            .await?;
        Ok(pod.is_some_and(|p| {
            !pod_is_terminating(&p) && pod_phase(&p) == Some("Running") && all_containers_ready(&p)
        }))
    }

    async fn stop(&self, handle: &ResourceHandle, grace: Duration) -> BackendResult<()> {
        let namespace = self.namespace_of(handle).to_string();

        if let Err(e) = self.api.delete_service(&namespace, &handle.name).await {
            debug!("Delete service {} failed: {}", handle.name, e);
        }

        self.api
            .delete_pod(&namespace, &handle.name, grace.as_secs())
            .await?;

        let limit = grace + Duration::from_secs(10);
        if !self.wait_gone(&namespace, &handle.name, limit).await? {
            warn!(
                "Pod {}/{} still present after {:?}, forcing deletion",
                namespace, handle.name, limit
            );
            self.api.delete_pod(&namespace, &handle.name, 0).await?;
        }

        info!("Deleted pod {}/{}", namespace, handle.name);
        Ok(())
    }

    async fn exec(&self, handle: &ResourceHandle, argv: &[String]) -> BackendResult<ExecOutput> {
        self.api
            .exec(self.namespace_of(handle), &handle.name, LAB_CONTAINER, argv)
            .await
    }

    fn attach_target(&self, handle: &ResourceHandle, shell: &str) -> AttachTarget {
        let namespace = self.namespace_of(handle).to_string();
        match self.transport {
            TransportChoice::Subprocess => AttachTarget::Command {
                program: self.kubectl_binary.clone(),
                args: vec![
                    "exec".to_string(),
                    "-it".to_string(),
                    "-n".to_string(),
                    namespace,
                    handle.name.clone(),
                    "-c".to_string(),
                    LAB_CONTAINER.to_string(),
                    "--".to_string(),
                    shell.to_string(),
                ],
            },
            TransportChoice::Stream | TransportChoice::Auto => AttachTarget::PodExec {
                namespace,
                pod: handle.name.clone(),
                container: LAB_CONTAINER.to_string(),
                command: vec![shell.to_string()],
            },
        }
    }

    async fn open_exec_stream(&self, target: &AttachTarget) -> BackendResult<ExecStream> {
        match target {
            AttachTarget::PodExec {
                namespace,
                pod,
                container,
                command,
            } => self.api.open_exec(namespace, pod, container, command).await,
            AttachTarget::Command { .. } => Err(BackendError::InvalidInput(
                "subprocess target passed to streaming attach".to_string(),
            )),
        }
    }

    async fn list_owned(&self) -> BackendResult<Vec<OwnedUnit>> {
        let pods = self
            .api
            .list_pods(&self.namespace, &format!("{}=true", LABEL_MANAGED))
            .await?;
        Ok(pods
            .iter()
            .filter_map(|pod| {
                let name = pod.pointer("/metadata/name").and_then(Value::as_str)?;
                let session_id = pod
                    .pointer("/metadata/annotations")
                    .and_then(|a| a.get(LABEL_SESSION))
                    .or_else(|| {
                        pod.pointer("/metadata/labels")
                            .and_then(|l| l.get(LABEL_SESSION))
                    })
                    .and_then(Value::as_str)?;
                Some(OwnedUnit {
                    session_id: session_id.to_string(),
                    handle: self.handle_for(name, Some(pod)),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeApi {
        pods: Mutex<BTreeMap<String, Value>>,
        services: Mutex<Vec<String>>,
        claims: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PodApi for FakeApi {
        async fn create_pod(&self, _namespace: &str, manifest: &Value) -> BackendResult<Value> {
            let name = manifest["metadata"]["name"].as_str().unwrap().to_string();
            let mut pods = self.pods.lock().unwrap();
            if pods.contains_key(&name) {
                return Err(BackendError::Http {
                    status: 409,
                    message: "AlreadyExists".into(),
                });
            }
            let mut pod = manifest.clone();
            pod["metadata"]["uid"] = json!(format!("uid-{name}"));
            pod["status"] = json!({ "phase": "Pending" });
            pods.insert(name, pod.clone());
            Ok(pod)
        }

        async fn get_pod(&self, _namespace: &str, name: &str) -> BackendResult<Option<Value>> {
            Ok(self.pods.lock().unwrap().get(name).cloned())
        }

        async fn delete_pod(&self, _namespace: &str, name: &str, _grace: u64) -> BackendResult<()> {
            self.pods.lock().unwrap().remove(name);
            Ok(())
        }

        async fn list_pods(&self, _namespace: &str, _selector: &str) -> BackendResult<Vec<Value>> {
            Ok(self.pods.lock().unwrap().values().cloned().collect())
        }

        async fn create_service(&self, _namespace: &str, manifest: &Value) -> BackendResult<()> {
            let name = manifest["metadata"]["name"].as_str().unwrap().to_string();
            self.services.lock().unwrap().push(name);
            Ok(())
        }

        async fn delete_service(&self, _namespace: &str, name: &str) -> BackendResult<()> {
            self.services.lock().unwrap().retain(|s| s != name);
            Ok(())
        }

        async fn create_claim(&self, _namespace: &str, manifest: &Value) -> BackendResult<()> {
            let name = manifest["metadata"]["name"].as_str().unwrap().to_string();
            let mut claims = self.claims.lock().unwrap();
            if !claims.contains(&name) {
                claims.push(name);
            }
            Ok(())
        }

        async fn exec(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: &str,
            _argv: &[String],
        ) -> BackendResult<ExecOutput> {
            Ok(ExecOutput::default())
        }

        async fn open_exec(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: &str,
            _argv: &[String],
        ) -> BackendResult<ExecStream> {
            Err(BackendError::Unavailable("no api server in tests".into()))
        }
    }

    fn spec(desktop: bool) -> WorkloadSpec {
        let mut ports = BTreeMap::new();
        ports.insert(PortRole::Ssh, 10022);
        if desktop {
            ports.insert(PortRole::Vnc, 11001);
        }
        let mut env = BTreeMap::new();
        env.insert("LAB_PASSWORD".to_string(), "pw".to_string());
        WorkloadSpec {
            session_id: "sess-1".into(),
            user_id: "alice@example.com".into(),
            name: "lab-sess-1".into(),
            image: "labvisor/desktop:latest".into(),
            command: Vec::new(),
            env,
            memory_mb: 1024,
            cpus: 1.5,
            ports,
            volume: Some("labvisor-home-abc".into()),
            network: None,
            home_dir: "/home/student".into(),
            labels: WorkloadSpec::ownership_labels("sess-1", "alice@example.com"),
            desktop,
        }
    }

    fn driver(api: Arc<FakeApi>, transport: TransportChoice) -> PodDriver {
        PodDriver::new(api, "labs", "kubectl", transport)
    }

    #[test]
    fn manifest_shapes_resources_ports_and_volume() {
        let manifest = pod_manifest(&spec(true));
        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["resources"]["limits"]["cpu"], "1500m");
        assert_eq!(container["resources"]["limits"]["memory"], "1024Mi");
        assert_eq!(container["ports"][0]["containerPort"], 22);
        assert_eq!(container["ports"][0]["hostPort"], 10022);
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/home/student");
        assert_eq!(
            manifest["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"],
            "labvisor-home-abc"
        );
        // Label values are sanitised, annotations keep the raw ID.
        assert_eq!(manifest["metadata"]["labels"]["labvisor.user"], "alice-example.com");
        assert_eq!(
            manifest["metadata"]["annotations"]["labvisor.user"],
            "alice@example.com"
        );
    }

    #[tokio::test]
    async fn start_is_idempotent_on_conflict() {
        let api = Arc::new(FakeApi::default());
        let driver = driver(api.clone(), TransportChoice::Stream);
        let first = driver.start(&spec(false)).await.unwrap();
        let second = driver.start(&spec(false)).await.unwrap();
        assert_eq!(first.id, "uid-lab-sess-1");
        assert_eq!(first, second);
        assert_eq!(api.pods.lock().unwrap().len(), 1);
        assert_eq!(api.claims.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn desktop_pods_get_a_service() {
        let api = Arc::new(FakeApi::default());
        let driver = driver(api.clone(), TransportChoice::Stream);
        let handle = driver.start(&spec(true)).await.unwrap();
        assert_eq!(api.services.lock().unwrap().len(), 1);
        driver.stop(&handle, Duration::from_secs(0)).await.unwrap();
        assert!(api.services.lock().unwrap().is_empty());
        assert!(api.pods.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn readiness_requires_every_container_ready() {
        let api = Arc::new(FakeApi::default());
        let driver = driver(api.clone(), TransportChoice::Stream);
        let handle = driver.start(&spec(false)).await.unwrap();
        assert_eq!(driver.status(&handle).await.unwrap(), UnitStatus::Unknown);
        assert!(!driver.is_ready(&handle).await.unwrap());

        api.pods.lock().unwrap().get_mut("lab-sess-1").unwrap()["status"] = json!({
            "phase": "Running",
            "containerStatuses": [{ "name": "lab", "ready": false }],
        });
        assert_eq!(driver.status(&handle).await.unwrap(), UnitStatus::Running);
        assert!(!driver.is_ready(&handle).await.unwrap());

        api.pods.lock().unwrap().get_mut("lab-sess-1").unwrap()["status"]["containerStatuses"]
            [0]["ready"] = json!(true);
        assert!(driver.is_ready(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn vanished_pod_reads_as_stopped() {
        let api = Arc::new(FakeApi::default());
        let driver = driver(api.clone(), TransportChoice::Stream);
        let handle = driver.start(&spec(false)).await.unwrap();
        api.pods.lock().unwrap().clear();
        assert_eq!(driver.status(&handle).await.unwrap(), UnitStatus::Stopped);
        driver.stop(&handle, Duration::from_secs(0)).await.unwrap();
    }

    #[tokio::test]
    async fn attach_target_follows_transport() {
        let api = Arc::new(FakeApi::default());
        let stream = driver(api.clone(), TransportChoice::Stream);
        let handle = stream.start(&spec(false)).await.unwrap();
        assert!(matches!(
            stream.attach_target(&handle, "/bin/sh"),
            AttachTarget::PodExec { .. }
        ));

        let sub = driver(api, TransportChoice::Subprocess);
        match sub.attach_target(&handle, "/bin/sh") {
            AttachTarget::Command { program, args } => {
                assert_eq!(program, "kubectl");
                assert!(args.contains(&"labs".to_string()));
                assert_eq!(args.last().map(String::as_str), Some("/bin/sh"));
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_owned_uses_annotation_ids() {
        let api = Arc::new(FakeApi::default());
        let driver = driver(api, TransportChoice::Stream);
        driver.start(&spec(false)).await.unwrap();
        let owned = driver.list_owned().await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].session_id, "sess-1");
        assert_eq!(owned[0].handle.namespace.as_deref(), Some("labs"));
    }
}
