use std::{path::PathBuf, process::Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::engine::security::SecurityError;

/// Per-slot disk quota, applied with the `setquota` tool to uid `base_uid + slot`.
#[derive(Debug, Clone)]
pub struct QuotaManager {
    setquota: PathBuf,
    filesystem: String,
    base_uid: u32,
    block_kb: u64,
    inodes: u64,
}

impl QuotaManager {
    pub fn new(
        setquota: PathBuf,
        filesystem: String,
        base_uid: u32,
        block_kb: u64,
        inodes: u64,
    ) -> Self {
        Self {
            setquota,
            filesystem,
            base_uid,
            block_kb,
            inodes,
        }
    }

    pub fn uid_for(&self, slot: u32) -> u32 {
        self.base_uid.saturating_add(slot)
    }

    pub async fn assign(&self, slot: u32) -> Result<u32, SecurityError> {
        let uid = self.uid_for(slot);
        self.set(uid, self.block_kb, self.inodes).await?;
        debug!(slot, uid, block_kb = self.block_kb, inodes = self.inodes, "disk quota assigned");
        Ok(uid)
    }

    /// Zero means unlimited to `setquota`, which is the state before assignment.
    pub async fn reset(&self, slot: u32) -> Result<(), SecurityError> {
        self.set(self.uid_for(slot), 0, 0).await
    }

    fn args(&self, uid: u32, block_kb: u64, inodes: u64) -> Vec<String> {
        vec![
            "-u".to_string(),
            uid.to_string(),
            block_kb.to_string(),
            block_kb.to_string(),
            inodes.to_string(),
            inodes.to_string(),
            self.filesystem.clone(),
        ]
    }

    async fn set(&self, uid: u32, block_kb: u64, inodes: u64) -> Result<(), SecurityError> {
        let output = Command::new(&self.setquota)
            .args(self.args(uid, block_kb, inodes))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SecurityError::Quota(format!("{}: {e}", self.setquota.display())))?;
        if !output.status.success() {
            return Err(SecurityError::Quota(format!(
                "setquota for uid {uid} on {} failed: {}",
                self.filesystem,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(tool: &str) -> QuotaManager {
        QuotaManager::new(PathBuf::from(tool), "/var/lib/judge".to_string(), 60_000, 65_536, 256)
    }

    #[test]
    fn builds_setquota_arguments() {
        let quota = manager("setquota");
        assert_eq!(quota.uid_for(3), 60_003);
        assert_eq!(
            quota.args(60_003, 65_536, 256),
            vec!["-u", "60003", "65536", "65536", "256", "256", "/var/lib/judge"]
        );
    }

    #[tokio::test]
    async fn reports_tool_failures() {
        assert_eq!(manager("/bin/true").assign(1).await.unwrap(), 60_001);
        manager("/bin/true").reset(1).await.unwrap();
        assert!(matches!(
            manager("/bin/false").assign(1).await,
            Err(SecurityError::Quota(_))
        ));
        assert!(manager("/nonexistent/setquota").reset(1).await.is_err());
    }
}
