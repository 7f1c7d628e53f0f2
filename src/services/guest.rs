//! Guest domain control over the `virsh` CLI: quiesce (fsfreeze/fsthaw via
//! the in-guest agent) and power lifecycle for restores.

use anyhow::{anyhow, Result};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::GuestConfig;
use crate::constants::timeouts;
use crate::services::commands;

const VIRSH: &str = "virsh";
const GUEST_PING: &str = r#"{"execute":"guest-ping"}"#;

#[derive(Debug, Clone)]
pub struct GuestClient {
    uri: String,
}

impl GuestClient {
    pub fn new(guest: &GuestConfig) -> Self {
        Self {
            uri: guest.libvirt_uri.clone(),
        }
    }

    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut full_args = vec!["-c", self.uri.as_str()];
        full_args.extend_from_slice(args);
        commands::run(VIRSH, &full_args).await
    }

    pub async fn is_active(&self, domain: &str) -> Result<bool> {
        let state = self.virsh(&["domstate", domain]).await?;
        Ok(state.trim() == "running")
    }

    /// True only if the in-guest agent answers a ping within its budget.
    /// Any channel error means "not available", never a hard failure.
    pub async fn agent_available(&self, domain: &str) -> bool {
        let timeout = timeouts::AGENT_PING_SECS.to_string();
        let result = self
            .virsh(&[
                "qemu-agent-command",
                domain,
                GUEST_PING,
                "--timeout",
                &timeout,
            ])
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                debug!("Guest agent ping failed for {}: {}", domain, e);
                false
            }
        }
    }

    /// Freeze guest filesystems. Errors propagate so the coordinator can
    /// fall back to crash-consistent snapshots.
    pub async fn freeze(&self, domain: &str) -> Result<()> {
        self.virsh(&["domfsfreeze", domain]).await?;
        Ok(())
    }

    pub async fn thaw(&self, domain: &str) -> Result<()> {
        self.virsh(&["domfsthaw", domain]).await?;
        Ok(())
    }

    /// Request a shutdown and poll until the domain reports shut off.
    pub async fn power_off(&self, domain: &str) -> Result<()> {
        if !self.is_active(domain).await? {
            info!("Instance {} is already powered off", domain);
            return Ok(());
        }

        info!("Powering off instance {}", domain);
        self.virsh(&["shutdown", domain]).await?;

        for _ in 0..timeouts::POWER_OFF_POLL_LIMIT {
            sleep(timeouts::POWER_OFF_POLL).await;
            if !self.is_active(domain).await? {
                info!("Instance {} powered off", domain);
                return Ok(());
            }
        }

        Err(anyhow!(
            "Instance {} did not power off within the polling window",
            domain
        ))
    }

    pub async fn power_on(&self, domain: &str) -> Result<()> {
        info!("Starting instance {}", domain);
        match self.virsh(&["start", domain]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // "domain is already active" is fine after a partial restore
                let msg = e.to_string();
                if msg.contains("already active") {
                    warn!("Instance {} was already running", domain);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}
