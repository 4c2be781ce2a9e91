//! Produces the published metric files.
//!
//! Device metrics are rewritten line by line from the exporter's source file,
//! process and usage metrics are synthesized from the correlation maps. Every
//! file is written to a temp file next to its destination and renamed into
//! place, so readers see either the previous or the new content.

use std::collections::HashMap;
use std::fmt::Display;
use std::fs::File;
use std::fs::Permissions;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::exposition::escape_label_value;
use super::exposition::Line;
use super::exposition::Sample;
use super::MetricFamily;
use super::CONTAINER_NAME;
use super::DEFAULT_ID_LABEL;
use super::DEFAULT_PID_LABEL;
use super::POD_NAME;
use super::POD_NAMESPACE;
use super::PROCESS_PID;
use crate::correlation::Correlation;
use crate::correlation::DeviceMap;
use crate::correlation::ProcessMap;
use crate::correlation::UsageBitmap;
use crate::types::DeviceId;
use crate::types::PodIdentity;
use crate::types::ProcessRecord;

const PROCESS_MEMORY_METRIC: &str = "dcgm_process_mem_used";
const DEVICE_ALLOCATED_METRIC: &str = "dcgm_gpu_allocated";
const ALLOCATION_BITMAP_METRIC: &str = "dcgm_gpu_allocation_bitmap";

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("Failed to open source metrics {}", path.display())]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read source metrics")]
    SourceRead(#[source] io::Error),
    #[error("Failed to create temporary file in {}", dir.display())]
    TempFile {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write metrics")]
    Write(#[source] io::Error),
    #[error("Failed to publish metrics to {}", path.display())]
    Publish {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Picks the labels to add to a source sample, if any.
pub trait LabelSource {
    fn labels_for(&self, sample: &Sample<'_>) -> Option<Vec<(&'static str, String)>>;
}

fn owner_labels(owner: &PodIdentity) -> Vec<(&'static str, String)> {
    vec![
        (POD_NAME, owner.name.clone()),
        (POD_NAMESPACE, owner.namespace.clone()),
        (CONTAINER_NAME, owner.container_name.clone()),
    ]
}

/// Owner of the device named by the sample's id label.
pub struct DeviceLabels<'a> {
    devices: &'a DeviceMap,
    id_label: &'a str,
}

impl<'a> DeviceLabels<'a> {
    pub fn new(devices: &'a DeviceMap, id_label: &'a str) -> Self {
        Self { devices, id_label }
    }
}

impl LabelSource for DeviceLabels<'_> {
    fn labels_for(&self, sample: &Sample<'_>) -> Option<Vec<(&'static str, String)>> {
        let device_id = DeviceId::new(sample.label(self.id_label)?).normalized();
        self.devices.get(&device_id).map(owner_labels)
    }
}

/// Owner and pid of the process named by the sample's `(id, pid)` labels.
pub struct ProcessLabels<'a> {
    processes: HashMap<(DeviceId, u32), &'a ProcessRecord>,
    id_label: &'a str,
    pid_label: &'a str,
}

impl<'a> ProcessLabels<'a> {
    pub fn new(processes: &'a ProcessMap, id_label: &'a str, pid_label: &'a str) -> Self {
        let processes = processes
            .values()
            .map(|record| ((record.device_id.clone(), record.pid), record))
            .collect();
        Self {
            processes,
            id_label,
            pid_label,
        }
    }
}

impl ProcessLabels<'_> {
    fn pid(&self, sample: &Sample<'_>) -> Option<u32> {
        sample.label(self.pid_label)?.parse().ok()
    }
}

impl LabelSource for ProcessLabels<'_> {
    fn labels_for(&self, sample: &Sample<'_>) -> Option<Vec<(&'static str, String)>> {
        let pid = self.pid(sample)?;
        let device_id = DeviceId::new(sample.label(self.id_label)?).normalized();
        let record = self.processes.get(&(device_id, pid))?;
        let mut labels = owner_labels(&record.owner);
        labels.push((PROCESS_PID, record.pid.to_string()));
        Some(labels)
    }
}

/// Process-scoped labels for samples that carry a pid, device owner otherwise.
///
/// A sample whose pid is not attributed to a container stays unlabelled even
/// when its device is granted: the process may belong to someone else.
pub struct CorrelationLabels<'a> {
    process: ProcessLabels<'a>,
    device: DeviceLabels<'a>,
}

impl<'a> CorrelationLabels<'a> {
    pub fn new(correlation: &'a Correlation, id_label: &'a str, pid_label: &'a str) -> Self {
        Self {
            process: ProcessLabels::new(&correlation.processes, id_label, pid_label),
            device: DeviceLabels::new(&correlation.devices, id_label),
        }
    }
}

impl LabelSource for CorrelationLabels<'_> {
    fn labels_for(&self, sample: &Sample<'_>) -> Option<Vec<(&'static str, String)>> {
        match self.process.pid(sample) {
            Some(_) => self.process.labels_for(sample),
            None => self.device.labels_for(sample),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectionStats {
    pub lines: usize,
    pub injected: usize,
}

/// Copies `source` to `out`, inserting labels into every sample `labels`
/// knows about. Other lines are copied unchanged.
pub fn inject_labels<R: BufRead, W: Write + ?Sized>(
    mut source: R,
    out: &mut W,
    labels: &dyn LabelSource,
) -> Result<InjectionStats, RewriteError> {
    let mut stats = InjectionStats::default();
    let mut buf = String::new();
    loop {
        buf.clear();
        if source
            .read_line(&mut buf)
            .map_err(RewriteError::SourceRead)?
            == 0
        {
            break;
        }
        stats.lines += 1;

        let content = buf.trim_end_matches(['\n', '\r']);
        let ending = match &buf[content.len()..] {
            "" => "\n",
            ending => ending,
        };

        let rewritten = match Line::parse(content) {
            Line::Sample(sample) => labels
                .labels_for(&sample)
                .map(|extra| sample.with_labels(&extra)),
            _ => None,
        };
        let written = match &rewritten {
            Some(line) => {
                stats.injected += 1;
                line.as_str()
            }
            None => content,
        };
        out.write_all(written.as_bytes())
            .and_then(|()| out.write_all(ending.as_bytes()))
            .map_err(RewriteError::Write)?;
    }
    Ok(stats)
}

/// Runs `write` against a temp file in `destination`'s directory, then
/// renames it over `destination`. On error the temp file is removed and
/// `destination` is left as it was.
pub fn publish_atomically<T>(
    destination: &Path,
    temp_prefix: &str,
    write: impl FnOnce(&mut dyn Write) -> Result<T, RewriteError>,
) -> Result<T, RewriteError> {
    let dir = match destination.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut temp = tempfile::Builder::new()
        .prefix(temp_prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|source| RewriteError::TempFile {
            dir: dir.to_path_buf(),
            source,
        })?;

    let output = {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let output = write(&mut writer)?;
        writer.flush().map_err(RewriteError::Write)?;
        output
    };
    temp.as_file()
        .set_permissions(Permissions::from_mode(0o644))
        .and_then(|()| temp.as_file().sync_all())
        .map_err(RewriteError::Write)?;

    temp.persist(destination)
        .map_err(|e| RewriteError::Publish {
            path: destination.to_path_buf(),
            source: e.error,
        })?;
    Ok(output)
}

fn write_header(out: &mut dyn Write, name: &str, help: &str) -> io::Result<()> {
    writeln!(out, "# HELP {name} {help}")?;
    writeln!(out, "# TYPE {name} gauge")
}

fn write_sample(
    out: &mut dyn Write,
    name: &str,
    labels: &[(&str, &str)],
    value: impl Display,
) -> io::Result<()> {
    write!(out, "{name}{{")?;
    for (i, (label, label_value)) in labels.iter().enumerate() {
        if i > 0 {
            out.write_all(b",")?;
        }
        write!(out, "{label}=\"{}\"", escape_label_value(label_value))?;
    }
    writeln!(out, "}} {value}")
}

/// One `dcgm_process_mem_used` sample per attributed process, in key order.
pub fn render_processes(processes: &ProcessMap, out: &mut dyn Write) -> io::Result<usize> {
    write_header(
        out,
        PROCESS_MEMORY_METRIC,
        "GPU memory used by a container process (in bytes).",
    )?;
    for record in processes.values() {
        let gpu = record.device_index.to_string();
        let pid = record.pid.to_string();
        let kind = record.kind.to_string();
        write_sample(
            out,
            PROCESS_MEMORY_METRIC,
            &[
                ("gpu", &gpu),
                (DEFAULT_ID_LABEL, record.device_id.as_str()),
                (POD_NAME, &record.owner.name),
                (POD_NAMESPACE, &record.owner.namespace),
                (CONTAINER_NAME, &record.owner.container_name),
                ("process_name", &record.process_name),
                (PROCESS_PID, &pid),
                ("process_type", &kind),
            ],
            record.used_memory_bytes,
        )?;
    }
    Ok(processes.len())
}

/// Per-device allocation plus the packed bitmap for the host.
pub fn render_usage(usage: &UsageBitmap, hostname: &str, out: &mut dyn Write) -> io::Result<usize> {
    write_header(
        out,
        DEVICE_ALLOCATED_METRIC,
        "Whether the GPU is granted to a container (1) or not (0).",
    )?;
    for record in &usage.records {
        let gpu = record.device_index.to_string();
        write_sample(
            out,
            DEVICE_ALLOCATED_METRIC,
            &[
                ("hostname", &record.hostname),
                ("gpu", &gpu),
                (DEFAULT_ID_LABEL, record.device_id.as_str()),
            ],
            u8::from(record.allocated),
        )?;
    }

    write_header(
        out,
        ALLOCATION_BITMAP_METRIC,
        "GPU allocation bitmap of the host, GPU 0 as the most significant bit.",
    )?;
    let bitmap = usage.bit_string();
    write_sample(
        out,
        ALLOCATION_BITMAP_METRIC,
        &[("hostname", hostname), ("bitmap", &bitmap)],
        usage.packed(),
    )?;
    Ok(usage.records.len())
}

/// Outcome of one family publish.
pub type FamilyResult = (MetricFamily, Result<usize, RewriteError>);

/// Writes the metric families into one output directory.
#[derive(Debug, Clone)]
pub struct MetricsRewriter {
    output_dir: PathBuf,
    id_label: String,
    pid_label: String,
}

impl MetricsRewriter {
    pub fn new(output_dir: impl Into<PathBuf>, id_label: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            id_label: id_label.into(),
            pid_label: DEFAULT_PID_LABEL.to_string(),
        }
    }

    pub fn with_pid_label(mut self, pid_label: impl Into<String>) -> Self {
        self.pid_label = pid_label.into();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn destination(&self, family: MetricFamily) -> PathBuf {
        family.destination(&self.output_dir)
    }

    /// Rewrites the device family from `source`. Returns the number of
    /// samples that gained labels.
    pub fn rewrite_devices(
        &self,
        source: impl BufRead,
        correlation: &Correlation,
    ) -> Result<usize, RewriteError> {
        let labels = CorrelationLabels::new(correlation, &self.id_label, &self.pid_label);
        let family = MetricFamily::Device;
        let stats = publish_atomically(&self.destination(family), family.temp_prefix(), |out| {
            inject_labels(source, out, &labels)
        })?;
        debug!(lines = stats.lines, injected = stats.injected, "Rewrote device metrics");
        Ok(stats.injected)
    }

    pub fn rewrite_device_file(
        &self,
        source_path: &Path,
        correlation: &Correlation,
    ) -> Result<usize, RewriteError> {
        let file = File::open(source_path).map_err(|source| RewriteError::SourceOpen {
            path: source_path.to_path_buf(),
            source,
        })?;
        self.rewrite_devices(BufReader::new(file), correlation)
    }

    pub fn write_processes(&self, processes: &ProcessMap) -> Result<usize, RewriteError> {
        let family = MetricFamily::Process;
        publish_atomically(&self.destination(family), family.temp_prefix(), |out| {
            render_processes(processes, out).map_err(RewriteError::Write)
        })
    }

    pub fn write_usage(&self, usage: &UsageBitmap, hostname: &str) -> Result<usize, RewriteError> {
        let family = MetricFamily::Usage;
        publish_atomically(&self.destination(family), family.temp_prefix(), |out| {
            render_usage(usage, hostname, out).map_err(RewriteError::Write)
        })
    }

    /// Publishes every family. A failure in one family does not stop the
    /// others.
    pub fn rewrite(
        &self,
        source_path: &Path,
        correlation: &Correlation,
        hostname: &str,
    ) -> Vec<FamilyResult> {
        let results = vec![
            (
                MetricFamily::Device,
                self.rewrite_device_file(source_path, correlation),
            ),
            (
                MetricFamily::Process,
                self.write_processes(&correlation.processes),
            ),
            (
                MetricFamily::Usage,
                self.write_usage(&correlation.usage, hostname),
            ),
        ];
        for (family, result) in &results {
            match result {
                Ok(count) => info!(%family, count, "Published metrics"),
                Err(e) => warn!(%family, error = %e, "Failed to publish metrics"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::io::Read;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::types::ProcessKind;
    use crate::types::UsageRecord;

    fn correlation() -> Correlation {
        let owner = PodIdentity::new("p1", "default", "c1");
        let mut correlation = Correlation::default();
        correlation
            .devices
            .insert(DeviceId::new("GPU-abc"), owner.clone());
        let record = ProcessRecord {
            owner,
            device_index: 0,
            device_id: DeviceId::new("GPU-abc"),
            pid: 4000,
            process_name: "python".to_string(),
            kind: ProcessKind::Compute,
            used_memory_bytes: 1024,
        };
        correlation.processes.insert(record.key(), record);
        correlation.usage = UsageBitmap {
            records: vec![
                UsageRecord {
                    hostname: "node-1".to_string(),
                    device_index: 0,
                    device_id: DeviceId::new("GPU-abc"),
                    allocated: true,
                },
                UsageRecord {
                    hostname: "node-1".to_string(),
                    device_index: 1,
                    device_id: DeviceId::new("GPU-def"),
                    allocated: false,
                },
            ],
        };
        correlation
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn injects_owner_labels_on_hits_only() {
        let source = "\
# HELP dcgm_fb_used Framebuffer memory used (in MiB).
# TYPE dcgm_fb_used gauge
dcgm_fb_used{gpu=\"0\",uuid=\"GPU-abc\"} 1024

dcgm_fb_used{gpu=\"1\",uuid=\"GPU-def\"} 0
not a sample
";
        let correlation = correlation();
        let labels = DeviceLabels::new(&correlation.devices, DEFAULT_ID_LABEL);
        let mut out = Vec::new();
        let stats = inject_labels(Cursor::new(source), &mut out, &labels).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "\
# HELP dcgm_fb_used Framebuffer memory used (in MiB).
# TYPE dcgm_fb_used gauge
dcgm_fb_used{gpu=\"0\",uuid=\"GPU-abc\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\"} 1024

dcgm_fb_used{gpu=\"1\",uuid=\"GPU-def\"} 0
not a sample
"
        );
        assert_eq!(stats, InjectionStats { lines: 6, injected: 1 });
    }

    #[test]
    fn id_label_is_found_by_name() {
        let correlation = correlation();
        let labels = DeviceLabels::new(&correlation.devices, "UUID");
        let mut out = Vec::new();
        inject_labels(
            Cursor::new("m{UUID=\"GPU-abc\",gpu=\"0\"} 1\r\nm{uuid=\"GPU-abc\"} 2"),
            &mut out,
            &labels,
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "m{UUID=\"GPU-abc\",gpu=\"0\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\"} 1\r\nm{uuid=\"GPU-abc\"} 2\n"
        );
    }

    #[test]
    fn attributed_process_samples_gain_process_pid() {
        let correlation = correlation();
        let labels = CorrelationLabels::new(&correlation, DEFAULT_ID_LABEL, DEFAULT_PID_LABEL);
        let mut out = Vec::new();
        inject_labels(
            Cursor::new(
                "dcgm_process_util{uuid=\"GPU-abc\",pid=\"4000\"} 9\n\
                 dcgm_process_util{uuid=\"GPU-abc\",pid=\"4001\"} 3\n",
            ),
            &mut out,
            &labels,
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "dcgm_process_util{uuid=\"GPU-abc\",pid=\"4000\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\",process_pid=\"4000\"} 9\n\
             dcgm_process_util{uuid=\"GPU-abc\",pid=\"4001\"} 3\n"
        );
    }

    #[test]
    fn samples_without_a_numeric_pid_use_device_owner() {
        let correlation = correlation();
        let labels = CorrelationLabels::new(&correlation, DEFAULT_ID_LABEL, DEFAULT_PID_LABEL);
        let mut out = Vec::new();
        inject_labels(
            Cursor::new(
                "dcgm_fb_used{uuid=\"GPU-abc\"} 7\n\
                 dcgm_process_util{uuid=\"GPU-abc\",pid=\"n/a\"} 1\n",
            ),
            &mut out,
            &labels,
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "dcgm_fb_used{uuid=\"GPU-abc\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\"} 7\n\
             dcgm_process_util{uuid=\"GPU-abc\",pid=\"n/a\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\"} 1\n"
        );
    }

    #[test]
    fn renders_process_metrics() {
        let mut out = Vec::new();
        assert_eq!(render_processes(&correlation().processes, &mut out).unwrap(), 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "\
# HELP dcgm_process_mem_used GPU memory used by a container process (in bytes).
# TYPE dcgm_process_mem_used gauge
dcgm_process_mem_used{gpu=\"0\",uuid=\"GPU-abc\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\",process_name=\"python\",process_pid=\"4000\",process_type=\"compute\"} 1024
"
        );
    }

    #[test]
    fn renders_usage_metrics() {
        let mut out = Vec::new();
        render_usage(&correlation().usage, "node-1", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("dcgm_gpu_allocated{hostname=\"node-1\",gpu=\"0\",uuid=\"GPU-abc\"} 1\n"));
        assert!(text.contains("dcgm_gpu_allocated{hostname=\"node-1\",gpu=\"1\",uuid=\"GPU-def\"} 0\n"));
        assert!(text.ends_with("dcgm_gpu_allocation_bitmap{hostname=\"node-1\",bitmap=\"1,0\"} 2\n"));
    }

    #[test]
    fn rewrite_publishes_every_family() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("dcgm.prom");
        fs::write(&source, "dcgm_fb_used{gpu=\"0\",uuid=\"GPU-abc\"} 1024\n").unwrap();
        let rewriter = MetricsRewriter::new(dir.path(), DEFAULT_ID_LABEL);

        let results = rewriter.rewrite(&source, &correlation(), "node-1");
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(
            dir_entries(dir.path()),
            vec!["dcgm-pod.prom", "dcgm-process.prom", "dcgm-usage.prom", "dcgm.prom"]
        );
        let pod = fs::read_to_string(rewriter.destination(MetricFamily::Device)).unwrap();
        assert_eq!(
            pod,
            "dcgm_fb_used{gpu=\"0\",uuid=\"GPU-abc\",pod_name=\"p1\",pod_namespace=\"default\",container_name=\"c1\"} 1024\n"
        );
    }

    #[test]
    fn missing_source_fails_device_family_only() {
        let dir = TempDir::new().unwrap();
        let rewriter = MetricsRewriter::new(dir.path(), DEFAULT_ID_LABEL);

        let results = rewriter.rewrite(&dir.path().join("absent.prom"), &correlation(), "node-1");
        assert!(matches!(
            results[0],
            (MetricFamily::Device, Err(RewriteError::SourceOpen { .. }))
        ));
        assert!(results[1].1.is_ok());
        assert!(results[2].1.is_ok());
        assert_eq!(dir_entries(dir.path()), vec!["dcgm-process.prom", "dcgm-usage.prom"]);
    }

    struct FailingReader {
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::other("device went away"));
            }
            self.served = true;
            let line = b"dcgm_fb_used{gpu=\"0\",uuid=\"GPU-abc\"} 1\n";
            buf[..line.len()].copy_from_slice(line);
            Ok(line.len())
        }
    }

    #[test]
    fn source_read_error_leaves_destination_untouched() {
        let dir = TempDir::new().unwrap();
        let rewriter = MetricsRewriter::new(dir.path(), DEFAULT_ID_LABEL);
        let destination = rewriter.destination(MetricFamily::Device);
        fs::write(&destination, "previous\n").unwrap();

        let result = rewriter.rewrite_devices(
            BufReader::new(FailingReader { served: false }),
            &correlation(),
        );
        assert!(matches!(result, Err(RewriteError::SourceRead(_))));
        assert_eq!(fs::read_to_string(&destination).unwrap(), "previous\n");
        assert_eq!(dir_entries(dir.path()), vec!["dcgm-pod.prom"]);
    }

    #[test]
    fn published_files_are_world_readable() {
        let dir = TempDir::new().unwrap();
        let rewriter = MetricsRewriter::new(dir.path(), DEFAULT_ID_LABEL);
        rewriter.write_processes(&ProcessMap::new()).unwrap();

        let mode = fs::metadata(rewriter.destination(MetricFamily::Process))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
