use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::engine::security::SecurityError;

const CONTROLLERS: &str = "+memory +cpu +pids";

/// Numeric ceilings written into one box's control group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupLimits {
    pub memory_bytes: u64,
    pub cpu_quota_us: u64,
    pub cpu_period_us: u64,
    pub pids_max: u64,
}

/// cgroup v2 hierarchy rooted at `<root>/<parent>`, one child group per slot.
#[derive(Debug, Clone)]
pub struct CgroupController {
    root: PathBuf,
    parent: String,
    device_allow: Vec<String>,
}

impl CgroupController {
    pub fn new(root: PathBuf, parent: String, device_allow: Vec<String>) -> Self {
        Self {
            root,
            parent,
            device_allow,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_path(&self, slot: u32) -> PathBuf {
        self.root.join(&self.parent).join(format!("box-{slot}"))
    }

    pub async fn create(&self, slot: u32, limits: &CgroupLimits) -> Result<PathBuf, SecurityError> {
        let parent = self.root.join(&self.parent);
        if !parent.exists() {
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| cgroup_error(&parent, e))?;
        }
        // Controllers must be delegated at every level before the child can use them.
        for level in [&self.root, &parent] {
            let control = level.join("cgroup.subtree_control");
            if let Err(err) = tokio::fs::write(&control, CONTROLLERS).await {
                warn!(path = %control.display(), error = %err, "could not delegate cgroup controllers");
            }
        }

        let path = self.slot_path(slot);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| cgroup_error(&path, e))?;

        write_knob(&path, "memory.max", limits.memory_bytes.to_string()).await?;
        // Hosts without swap accounting do not expose the knob.
        if let Err(err) = tokio::fs::write(path.join("memory.swap.max"), "0").await {
            debug!(slot, error = %err, "memory.swap.max not written");
        }
        write_knob(
            &path,
            "cpu.max",
            format!("{} {}", limits.cpu_quota_us, limits.cpu_period_us),
        )
        .await?;
        write_knob(&path, "pids.max", limits.pids_max.to_string()).await?;
        self.restrict_devices(&path).await?;

        debug!(slot, path = %path.display(), ?limits, "cgroup created");
        Ok(path)
    }

    /// v1-style device lists: deny everything, then re-allow the essentials.
    async fn restrict_devices(&self, path: &Path) -> Result<(), SecurityError> {
        let deny = path.join("devices.deny");
        if !deny.exists() {
            return Ok(());
        }
        write_knob(path, "devices.deny", "a".to_string()).await?;
        for rule in &self.device_allow {
            write_knob(path, "devices.allow", rule.clone()).await?;
        }
        Ok(())
    }

    /// Kills leftovers and removes the group. A group that is already gone is fine.
    pub async fn remove(&self, slot: u32) -> Result<bool, SecurityError> {
        let path = self.slot_path(slot);
        let kill = path.join("cgroup.kill");
        if kill.exists() {
            let _ = tokio::fs::write(&kill, "1").await;
        }

        match tokio::fs::remove_dir(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            // Only a real cgroupfs lets rmdir drop the knob files; plain directories need a walk.
            Err(_) => match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
                Err(err) => Err(cgroup_error(&path, err)),
            },
        }
    }
}

async fn write_knob(dir: &Path, knob: &str, value: String) -> Result<(), SecurityError> {
    let path = dir.join(knob);
    tokio::fs::write(&path, value)
        .await
        .map_err(|e| cgroup_error(&path, e))
}

fn cgroup_error(path: &Path, err: std::io::Error) -> SecurityError {
    SecurityError::Cgroup(format!("{}: {err}", path.display()))
}
