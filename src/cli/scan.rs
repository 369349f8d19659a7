use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::device;

#[derive(clap::Args, Debug)]
pub struct ScanCommand {}

impl ScanCommand {
    pub async fn run(self, config: &Config) -> Result<()> {
        let local_ip = device::local_ip(&config.network.interface).with_context(|| {
            format!("resolving local IP on {:?}", config.network.interface)
        })?;

        let devices = device::discover(local_ip, config.network.timeout())
            .await
            .context("scanning for devices")?;

        if devices.is_empty() {
            info!("no devices found");
            return Ok(());
        }

        info!(count = devices.len(), "scan complete");
        for device in devices {
            info!(
                name = device.name,
                kind = %device.kind,
                address = device.address,
                "device found"
            );
        }
        Ok(())
    }
}
