//! Scripted samplers for driving the meter and the enforcer in tests.
//!
//! `ScriptedSource` is a cloneable handle: keep one clone in the test and
//! hand the other to the meter, then change the values between updates.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collector::source::{
    CollectError, CpuSample, DiskSample, MemorySample, MetricsSource, NetworkSample,
    ProcessDetails, ProcessInspector, ProcessSample,
};

#[derive(Debug, Default)]
struct Script {
    cpu: CpuSample,
    memory: MemorySample,
    disk: DiskSample,
    network: NetworkSample,
    failing: Option<&'static str>,
    samples: usize,
}

/// `MetricsSource` returning values set by the test.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        let source = Self::default();
        {
            let mut s = source.script.lock();
            s.cpu.cores = 2;
            s.cpu.per_core = vec![0.0, 0.0];
            s.memory.total = 16 * 1024 * 1024 * 1024;
        }
        source
    }

    pub fn set_cpu_percent(&self, percent: f64) {
        let mut s = self.script.lock();
        s.cpu.process_percent = percent;
        s.cpu.system_percent = percent / s.cpu.cores.max(1) as f64;
        s.cpu.per_core = vec![percent; s.cpu.cores];
    }

    /// Sets the process RSS in bytes.
    pub fn set_memory(&self, rss: u64) {
        let mut s = self.script.lock();
        s.memory.rss = rss;
        s.memory.percent = if s.memory.total > 0 {
            rss as f64 / s.memory.total as f64 * 100.0
        } else {
            0.0
        };
    }

    pub fn set_disk(&self, used: u64, total: u64) {
        let mut s = self.script.lock();
        s.disk.used = used;
        s.disk.total = total;
        s.disk.free = total.saturating_sub(used);
    }

    pub fn set_network(&self, sent: u64, recv: u64) {
        let mut s = self.script.lock();
        s.network.bytes_sent = sent;
        s.network.bytes_recv = recv;
    }

    /// Makes the named sampler (`cpu`, `memory`, `disk` or `network`) fail
    /// until [`ScriptedSource::recover`] is called.
    pub fn fail(&self, sampler: &'static str) {
        self.script.lock().failing = Some(sampler);
    }

    pub fn recover(&self) {
        self.script.lock().failing = None;
    }

    /// Number of successful CPU samples taken, one per meter update.
    pub fn samples(&self) -> usize {
        self.script.lock().samples
    }

    fn check(&self, sampler: &'static str) -> Result<(), CollectError> {
        match self.script.lock().failing {
            Some(failing) if failing == sampler => Err(CollectError::Unsupported(format!(
                "scripted {} failure",
                sampler
            ))),
            _ => Ok(()),
        }
    }
}

impl MetricsSource for ScriptedSource {
    fn sample_cpu(&mut self) -> Result<CpuSample, CollectError> {
        self.check("cpu")?;
        let mut s = self.script.lock();
        s.samples += 1;
        Ok(s.cpu.clone())
    }

    fn sample_memory(&mut self) -> Result<MemorySample, CollectError> {
        self.check("memory")?;
        Ok(self.script.lock().memory.clone())
    }

    fn sample_disk(&mut self, _paths: &[PathBuf]) -> Result<DiskSample, CollectError> {
        self.check("disk")?;
        Ok(self.script.lock().disk.clone())
    }

    fn sample_network(&mut self, _interfaces: &[String]) -> Result<NetworkSample, CollectError> {
        self.check("network")?;
        Ok(self.script.lock().network.clone())
    }
}

/// `ProcessInspector` describing one fixed process.
#[derive(Debug, Clone)]
pub struct StaticInspector {
    sample: ProcessSample,
}

impl StaticInspector {
    pub fn new(pid: u32, name: &str) -> Self {
        Self {
            sample: ProcessSample {
                pid,
                name: name.to_string(),
                status: "running".to_string(),
                create_time: 1_700_000_000_000,
                threads: 4,
                descriptors: 8,
                children: Vec::new(),
            },
        }
    }
}

impl ProcessInspector for StaticInspector {
    fn inspect(&self, pid: u32) -> Result<ProcessSample, CollectError> {
        if pid != self.sample.pid {
            return Err(CollectError::ProcessGone(pid));
        }
        Ok(self.sample.clone())
    }

    fn details(&self, pid: u32) -> Result<ProcessDetails, CollectError> {
        let sample = self.inspect(pid)?;
        Ok(ProcessDetails {
            pid,
            ppid: 1,
            name: sample.name,
            cmdline: Vec::new(),
            status: sample.status,
            create_time: sample.create_time,
            threads: sample.threads,
            descriptors: sample.descriptors,
            children: sample.children,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_values_shared_between_clones() {
        let script = ScriptedSource::new();
        let mut source = script.clone();

        script.set_memory(150);
        assert_eq!(source.sample_memory().unwrap().rss, 150);

        script.set_cpu_percent(42.0);
        assert_eq!(source.sample_cpu().unwrap().process_percent, 42.0);
        assert_eq!(script.samples(), 1);
    }

    #[test]
    fn test_scripted_failure() {
        let script = ScriptedSource::new();
        let mut source = script.clone();

        script.fail("disk");
        assert!(source.sample_cpu().is_ok());
        assert!(matches!(
            source.sample_disk(&[]),
            Err(CollectError::Unsupported(_))
        ));

        script.recover();
        assert!(source.sample_disk(&[]).is_ok());
    }

    #[test]
    fn test_static_inspector() {
        let inspector = StaticInspector::new(7, "agent");
        assert_eq!(inspector.inspect(7).unwrap().name, "agent");
        assert!(inspector.inspect(8).is_err());
        assert_eq!(inspector.details(7).unwrap().ppid, 1);
    }
}
