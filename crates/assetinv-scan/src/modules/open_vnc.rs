//! Unauthenticated VNC check via `vnc-info`, plus best-effort screenshots.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use assetinv_core::Inventory;

use super::nmap_script::{Nmap, ScriptScan};
use super::{
    find_program, pending_hosts, print_affected, record_verdicts, Module, ModuleContext,
};
use crate::config::OpenVncConfig;
use crate::error::Result;
use crate::nmap_xml::NmapRun;

pub const FIELD: &str = "Open VNC";
const SCRIPT: &str = "vnc-info";
const PORTS: [u16; 2] = [5900, 5902];

pub struct OpenVnc {
    nmap: Nmap,
    config: OpenVncConfig,
}

impl OpenVnc {
    pub fn new(nmap: Nmap, config: OpenVncConfig) -> Self {
        Self {
            nmap,
            config,
        }
    }

    async fn screenshot(&self, ctx: &ModuleContext, ip: Ipv4Addr, port: u16) {
        let file = ctx
            .artifact_dir
            .join(format!("vnc_{ip}_{port}_screenshot.jpg"));
        let mut command = Command::new(&self.config.vncsnapshot_path);
        command
            .args(["-allowblank", "-cursor", "-quality", "75"])
            .arg(format!("{ip}::{port}"))
            .arg(&file)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let limit = Duration::from_secs(self.config.screenshot_timeout_secs);
        match tokio::time::timeout(limit, command.status()).await {
            Err(_) => tracing::warn!(%ip, port, "VNC screenshot timed out"),
            Ok(Err(e)) => tracing::warn!(%ip, port, error = %e, "VNC screenshot failed"),
            Ok(Ok(_)) if file.is_file() => {
                tracing::info!(%ip, port, path = %file.display(), "Screenshot saved")
            }
            Ok(Ok(_)) => tracing::debug!(%ip, port, "No screenshot produced"),
        }
    }
}

/// Ports on which `vnc-info` reported no authentication.
pub fn open_ports(run: &NmapRun) -> Vec<(Ipv4Addr, u16)> {
    let mut open = Vec::new();
    for host in &run.hosts {
        let Some(ip) = host.ipv4() else { continue };
        for (port, output) in host.port_script_outputs(SCRIPT) {
            if output.contains("does not require auth") {
                open.push((ip, port));
            }
        }
    }
    open
}

#[async_trait]
impl Module for OpenVnc {
    fn name(&self) -> &'static str {
        "open-vnc"
    }

    fn csv_headers(&self) -> Vec<String> {
        vec![FIELD.to_string()]
    }

    fn required_ports(&self) -> Vec<u16> {
        PORTS.to_vec()
    }

    fn required_programs(&self) -> Vec<String> {
        vec![self.nmap.path.clone()]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<()> {
        let mut vulnerable: BTreeMap<Ipv4Addr, Vec<u16>> = BTreeMap::new();

        // Targets are fixed up front: a "No" from the first port must not
        // hide a host from the second.
        let batches: Vec<(u16, Vec<Ipv4Addr>)> = PORTS
            .iter()
            .map(|&port| {
                let hosts = pending_hosts(&ctx.inventory, FIELD, |h| h.open_ports.contains(&port));
                (port, hosts)
            })
            .collect();

        for (port, targets) in batches {
            if targets.is_empty() {
                tracing::info!(port, "No systems to scan for open VNC");
                continue;
            }
            let label = format!("open_vnc_{port}");
            let ports = [port];
            let scan = ScriptScan {
                label: &label,
                script: SCRIPT,
                ports: &ports,
            };
            let run = match scan.run(&self.nmap, &ctx.artifact_dir, &targets).await {
                Ok(run) => run,
                Err(e) => {
                    tracing::warn!(port, error = %e, "VNC scan failed");
                    continue;
                }
            };
            let open = open_ports(&run);
            let verdicts = run
                .hosts
                .iter()
                .filter_map(|h| h.ipv4())
                .map(|ip| (ip, open.contains(&(ip, port))));
            record_verdicts(&ctx.inventory, FIELD, verdicts);
            for (ip, open_port) in open {
                vulnerable.entry(ip).or_default().push(open_port);
            }
        }

        tracing::info!(module = self.name(), vulnerable = vulnerable.len(), "VNC scan complete");

        if vulnerable.is_empty() || !self.config.screenshots {
            return Ok(());
        }
        if find_program(&self.config.vncsnapshot_path).is_none() {
            tracing::warn!(
                program = %self.config.vncsnapshot_path,
                "Screenshot program not found, skipping VNC screenshots"
            );
            return Ok(());
        }
        for (ip, ports) in &vulnerable {
            for port in ports {
                self.screenshot(ctx, *ip, *port).await;
            }
        }
        Ok(())
    }

    fn report(&self, inventory: &Inventory) {
        print_affected(inventory, FIELD, "open VNC");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmap_xml::parse_nmap_xml;

    #[test]
    fn test_open_ports() {
        let xml = r#"<?xml version="1.0"?>
<nmaprun>
  <host>
    <address addr="10.0.0.7" addrtype="ipv4"/>
    <ports>
      <port protocol="tcp" portid="5900">
        <state state="open"/>
        <script id="vnc-info" output="&#xa;  Protocol version: 3.8&#xa;  Security types: &#xa;    None (1)&#xa;  WARNING: Server does not require authentication"/>
      </port>
    </ports>
  </host>
  <host>
    <address addr="10.0.0.8" addrtype="ipv4"/>
    <ports>
      <port protocol="tcp" portid="5900">
        <state state="open"/>
        <script id="vnc-info" output="Security types: VNC Authentication (2)"/>
      </port>
    </ports>
  </host>
</nmaprun>"#;
        let run = parse_nmap_xml(xml.as_bytes()).unwrap();
        assert_eq!(open_ports(&run), vec![(Ipv4Addr::new(10, 0, 0, 7), 5900)]);
    }

    #[test]
    fn test_declared_contract() {
        let module = OpenVnc::new(
            Nmap::new("nmap", Duration::from_secs(60)),
            OpenVncConfig::default(),
        );
        assert_eq!(module.required_ports(), vec![5900, 5902]);
        assert_eq!(module.csv_headers(), vec![FIELD.to_string()]);
    }
}
