//! PID-file-backed process lifecycle for running the node as a background
//! daemon (`pulsemesh-node start`/`stop`/`status`). Grounded on the teacher's
//! `DaemonManager`: same PID file + `sysinfo` liveness check, same stale-PID
//! cleanup behaviour.

use crate::config::pulsemesh_data_dir;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use sysinfo::{Pid, System};
use tracing::info;

pub struct DaemonManager;

impl DaemonManager {
    pub fn pid_file() -> PathBuf {
        pulsemesh_data_dir().join("node.pid")
    }

    pub fn state_file() -> PathBuf {
        pulsemesh_data_dir().join("node.state")
    }

    pub fn start() -> anyhow::Result<()> {
        let pid_file = Self::pid_file();

        if let Ok(content) = fs::read_to_string(&pid_file) {
            if let Ok(pid_val) = content.trim().parse::<usize>() {
                let system = System::new_all();
                if system.process(Pid::from(pid_val)).is_some() {
                    anyhow::bail!("daemon already running with pid {pid_val}");
                }
            }
        }

        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .arg("run")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        fs::write(&pid_file, child.id().to_string())?;
        info!(pid = child.id(), "node daemon started");
        Ok(())
    }

    pub fn stop() -> anyhow::Result<()> {
        let pid_file = Self::pid_file();
        let content = fs::read_to_string(&pid_file)
            .map_err(|_| anyhow::anyhow!("no active daemon found (missing pid file)"))?;
        let pid_val: usize = content
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid pid file content"))?;

        let system = System::new_all();
        if let Some(process) = system.process(Pid::from(pid_val)) {
            process.kill();
            info!(pid = pid_val, "node daemon stopped");
            let _ = fs::remove_file(pid_file);
            Ok(())
        } else {
            let _ = fs::remove_file(pid_file);
            anyhow::bail!("process {pid_val} not found, removed stale pid file");
        }
    }

    pub fn status() {
        let pid_file = Self::pid_file();
        let state_file = Self::state_file();

        let mut running = false;
        match fs::read_to_string(&pid_file) {
            Ok(content) => match content.trim().parse::<usize>() {
                Ok(pid_val) => {
                    let system = System::new_all();
                    if system.process(Pid::from(pid_val)).is_some() {
                        info!(status = "RUNNING", pid = pid_val, "node status");
                        running = true;
                    } else {
                        info!(status = "CRASHED_OR_STOPPED", reason = "stale pid file", "node status");
                    }
                }
                Err(_) => info!(status = "UNKNOWN", reason = "corrupt pid file", "node status"),
            },
            Err(_) => info!(status = "STOPPED", "node status"),
        }

        if running {
            match fs::read_to_string(&state_file) {
                Ok(json) => match serde_json::from_str::<serde_json::Value>(&json) {
                    Ok(metrics) => info!(metrics = %metrics, "node metrics"),
                    Err(_) => info!(raw_metrics = json, "node metrics (raw)"),
                },
                Err(_) => info!("waiting for first metrics report"),
            }
        }
    }
}
