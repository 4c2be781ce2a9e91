use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use gpu_pod_exporter::app::Exporter;
use gpu_pod_exporter::config::ExporterArgs;
use gpu_pod_exporter::correlation::CorrelationError;
use gpu_pod_exporter::metrics::MetricFamily;
use gpu_pod_exporter::testing::snapshot;
use gpu_pod_exporter::testing::FakeAccelerator;
use gpu_pod_exporter::testing::FakeContainerRuntime;
use gpu_pod_exporter::testing::FakePodResources;
use gpu_pod_exporter::testing::FakeProcessTable;
use gpu_pod_exporter::types::GpuProcess;
use gpu_pod_exporter::types::PodIdentity;
use gpu_pod_exporter::types::ProcessKey;
use gpu_pod_exporter::types::ProcessKind;
use similar_asserts::assert_eq;
use tempfile::TempDir;

const GPU: &str = "nvidia.com/gpu";

fn args(dir: &Path) -> ExporterArgs {
    ExporterArgs {
        source_metrics_file: dir.join("dcgm.prom"),
        output_dir: dir.to_path_buf(),
        kubelet_socket_path: dir.join("kubelet.sock"),
        docker_socket_path: dir.join("docker.sock"),
        resource_name: GPU.to_string(),
        id_label: "uuid".to_string(),
        ancestry_floor_pid: 1,
        node_name: None,
        cycle_timeout_secs: 30,
    }
}

fn process(pid: u32, name: &str, memory: u64) -> GpuProcess {
    GpuProcess {
        pid,
        name: Some(name.to_string()),
        kind: ProcessKind::Compute,
        used_memory_bytes: memory,
    }
}

struct Fixture {
    dir: TempDir,
    pod_resources: Arc<FakePodResources>,
    exporter: Exporter,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let owner = PodIdentity::new("p1", "default", "c1");

    let accelerator = FakeAccelerator::with_devices(["GPU-abc", "GPU-def"]).with_processes(
        0,
        vec![process(4000, "python", 1024), process(5000, "sidecar", 64)],
    );
    // 4000 runs inside c1 (init 3990); 5000 belongs to another container
    let processes = FakeProcessTable::with_parents([(4000, 3990), (3990, 1), (5000, 4990), (4990, 1)]);
    let runtime = FakeContainerRuntime::default()
        .with_init_pid((&owner).into(), 3990)
        .with_hostname("node-1");
    let pod_resources = Arc::new(FakePodResources::new(snapshot([(
        "p1",
        "default",
        "c1",
        GPU,
        &["GPU-abc"][..],
    )])));

    let exporter = Exporter::new(
        &args(dir.path()),
        Arc::new(accelerator),
        pod_resources.clone(),
        Arc::new(runtime),
        Arc::new(processes),
    );
    Fixture {
        dir,
        pod_resources,
        exporter,
    }
}

fn read(dir: &Path, family: MetricFamily) -> String {
    fs::read_to_string(dir.join(family.file_name())).unwrap()
}

#[test_log::test(tokio::test)]
async fn process_map_attributes_container_descendants_only() {
    let fixture = fixture();
    let snapshot = snapshot([("p1", "default", "c1", GPU, &["GPU-abc"][..])]);

    let correlation = fixture.exporter.engine().correlate(&snapshot, "node-1").await;

    assert_eq!(
        correlation.processes.keys().cloned().collect::<Vec<_>>(),
        vec![ProcessKey::new(0, "GPU-abc", 4000)]
    );
    assert_eq!(
        correlation.devices.get("GPU-abc"),
        Some(&PodIdentity::new("p1", "default", "c1"))
    );
    assert_eq!(correlation.usage.bit_string(), "1,0");
    assert_eq!(correlation.usage.packed(), 2);
}

#[test_log::test(tokio::test)]
async fn cycle_publishes_all_families() {
    let fixture = fixture();
    let dir = fixture.dir.path();
    fs::write(
        dir.join("dcgm.prom"),
        "# HELP dcgm_fb_used Framebuffer memory used (in MiB).\n\
         # TYPE dcgm_fb_used gauge\n\
         dcgm_fb_used{gpu=\"0\",uuid=\"GPU-abc\"} 1024\n\
         dcgm_fb_used{gpu=\"1\",uuid=\"GPU-def\"} 0\n",
    )
    .unwrap();

    let summary = fixture.exporter.run_cycle().await.unwrap();
    assert_eq!(summary.pods, 1);
    assert_eq!(summary.devices, 1);
    assert_eq!(summary.processes, 1);
    assert_eq!(summary.allocated, 1);
    assert!(summary.failed.is_empty());

    assert_eq!(
        read(dir, MetricFamily::Device),
        "# HELP dcgm_fb_used Framebuffer memory used (in MiB).\n\
         # TYPE dcgm_fb_used gauge\n\
         dcgm_fb_used{gpu=\"0\",uuid=\"GPU-abc\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\"} 1024\n\
         dcgm_fb_used{gpu=\"1\",uuid=\"GPU-def\"} 0\n"
    );
    assert!(read(dir, MetricFamily::Process).contains(
        "dcgm_process_mem_used{gpu=\"0\",uuid=\"GPU-abc\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\",process_name=\"python\",process_pid=\"4000\",process_type=\"compute\"} 1024\n"
    ));
    let usage = read(dir, MetricFamily::Usage);
    assert!(usage.contains("dcgm_gpu_allocated{hostname=\"node-1\",gpu=\"0\",uuid=\"GPU-abc\"} 1\n"));
    assert!(usage.contains("dcgm_gpu_allocation_bitmap{hostname=\"node-1\",bitmap=\"1,0\"} 2\n"));
}

#[test_log::test(tokio::test)]
async fn virtual_grant_labels_physical_device_lines() {
    let fixture = fixture();
    let dir = fixture.dir.path();
    fixture
        .pod_resources
        .set_snapshot(snapshot([("p1", "default", "c1", GPU, &["GPU-abc::1"][..])]));
    fs::write(
        dir.join("dcgm.prom"),
        "dcgm_fb_used{gpu=\"0\",uuid=\"GPU-abc\"} 1024\n",
    )
    .unwrap();

    let summary = fixture.exporter.run_cycle().await.unwrap();
    assert_eq!(summary.devices, 1);
    assert_eq!(
        read(dir, MetricFamily::Device),
        "dcgm_fb_used{gpu=\"0\",uuid=\"GPU-abc\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\"} 1024\n"
    );
    assert!(read(dir, MetricFamily::Usage)
        .contains("dcgm_gpu_allocated{hostname=\"node-1\",gpu=\"0\",uuid=\"GPU-abc\"} 1\n"));
}

#[test_log::test(tokio::test)]
async fn foreign_process_on_granted_device_stays_unlabelled() {
    let fixture = fixture();
    let dir = fixture.dir.path();
    fs::write(
        dir.join("dcgm.prom"),
        "dcgm_process_mem{uuid=\"GPU-abc\",pid=\"4000\"} 1024\n\
         dcgm_process_mem{uuid=\"GPU-abc\",pid=\"5000\"} 999\n",
    )
    .unwrap();

    fixture.exporter.run_cycle().await.unwrap();
    assert_eq!(
        read(dir, MetricFamily::Device),
        "dcgm_process_mem{uuid=\"GPU-abc\",pid=\"4000\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\",process_pid=\"4000\"} 1024\n\
         dcgm_process_mem{uuid=\"GPU-abc\",pid=\"5000\"} 999\n"
    );
}

#[test_log::test(tokio::test)]
async fn stalled_accelerator_cannot_outlive_the_cycle_timeout() {
    let dir = TempDir::new().unwrap();
    let mut args = args(dir.path());
    args.cycle_timeout_secs = 1;
    let accelerator =
        FakeAccelerator::with_devices(["GPU-abc"]).with_enumeration_stall(Duration::from_secs(3));
    let exporter = Exporter::new(
        &args,
        Arc::new(accelerator),
        Arc::new(FakePodResources::new(snapshot([(
            "p1",
            "default",
            "c1",
            GPU,
            &["GPU-abc"][..],
        )]))),
        Arc::new(FakeContainerRuntime::default().with_hostname("node-1")),
        Arc::new(FakeProcessTable::default()),
    );

    let started = Instant::now();
    let err = exporter.run_cycle().await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        CorrelationError::TimedOut { seconds: 1 }
    ));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!dir.path().join(MetricFamily::Usage.file_name()).exists());
}

#[test_log::test(tokio::test)]
async fn missing_source_still_publishes_synthesized_families() {
    let fixture = fixture();
    let dir = fixture.dir.path();

    let summary = fixture.exporter.run_cycle().await.unwrap();
    assert_eq!(summary.failed, vec![MetricFamily::Device]);
    assert!(!dir.join(MetricFamily::Device.file_name()).exists());
    assert!(dir.join(MetricFamily::Process.file_name()).exists());
    assert!(dir.join(MetricFamily::Usage.file_name()).exists());
}

#[test_log::test(tokio::test)]
async fn snapshot_failure_publishes_nothing() {
    let fixture = fixture();
    let dir = fixture.dir.path();
    fs::write(dir.join("dcgm.prom"), "dcgm_fb_used{uuid=\"GPU-abc\"} 1\n").unwrap();
    fixture.exporter.run_cycle().await.unwrap();
    let published = read(dir, MetricFamily::Device);

    fixture.pod_resources.set_failing(true);
    fs::write(dir.join("dcgm.prom"), "dcgm_fb_used{uuid=\"GPU-abc\"} 2\n").unwrap();
    let err = fixture.exporter.run_cycle().await.unwrap_err();
    assert!(matches!(err.current_context(), CorrelationError::Snapshot));
    assert_eq!(read(dir, MetricFamily::Device), published);
    assert_eq!(fixture.pod_resources.calls(), 2);
}

#[test_log::test(tokio::test)]
async fn released_device_loses_its_labels() {
    let fixture = fixture();
    let dir = fixture.dir.path();
    fs::write(dir.join("dcgm.prom"), "dcgm_fb_used{uuid=\"GPU-abc\"} 1\n").unwrap();
    fixture.exporter.run_cycle().await.unwrap();

    fixture.pod_resources.set_snapshot(Default::default());
    fixture.exporter.run_cycle().await.unwrap();

    assert_eq!(read(dir, MetricFamily::Device), "dcgm_fb_used{uuid=\"GPU-abc\"} 1\n");
    assert!(read(dir, MetricFamily::Usage).contains("bitmap=\"0,0\"} 0\n"));
}

#[test_log::test(tokio::test)]
async fn node_name_overrides_runtime_host_identity() {
    let dir = TempDir::new().unwrap();
    let mut args = args(dir.path());
    args.node_name = Some("node-override".to_string());
    let exporter = Exporter::new(
        &args,
        Arc::new(FakeAccelerator::with_devices(["GPU-abc"])),
        Arc::new(FakePodResources::default()),
        Arc::new(FakeContainerRuntime::default().failing()),
        Arc::new(FakeProcessTable::default()),
    );

    assert_eq!(exporter.hostname().await, "node-override");
}

#[test_log::test(tokio::test)]
async fn unreachable_runtime_falls_back_to_unknown_host() {
    let dir = TempDir::new().unwrap();
    let exporter = Exporter::new(
        &args(dir.path()),
        Arc::new(FakeAccelerator::with_devices(["GPU-abc"])),
        Arc::new(FakePodResources::default()),
        Arc::new(FakeContainerRuntime::default().failing()),
        Arc::new(FakeProcessTable::default()),
    );

    assert_eq!(exporter.hostname().await, "unknown");
}
