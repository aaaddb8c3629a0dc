//! MS17-010 (EternalBlue) check via `smb-vuln-ms17-010`.

use async_trait::async_trait;

use assetinv_core::Inventory;

use super::nmap_script::{Nmap, ScriptScan};
use super::{pending_hosts, print_affected, record_verdicts, Module, ModuleContext};
use crate::error::Result;
use crate::nmap_xml::NmapRun;

pub const FIELD: &str = "Vulnerable to EternalBlue";
const SCRIPT: &str = "smb-vuln-ms17-010";
const PORTS: [u16; 1] = [445];

pub struct EternalBlue {
    nmap: Nmap,
}

impl EternalBlue {
    pub fn new(nmap: Nmap) -> Self {
        Self { nmap }
    }
}

/// Every host in the run gets a verdict; a host is vulnerable when the
/// script reports `VULNERABLE`.
pub fn verdicts(run: &NmapRun) -> Vec<(std::net::Ipv4Addr, bool)> {
    run.hosts
        .iter()
        .filter_map(|host| {
            let ip = host.ipv4()?;
            let vulnerable = host
                .host_script_outputs(SCRIPT)
                .chain(host.port_script_outputs(SCRIPT).map(|(_, out)| out))
                .any(|out| out.contains("VULNERABLE"));
            Some((ip, vulnerable))
        })
        .collect()
}

#[async_trait]
impl Module for EternalBlue {
    fn name(&self) -> &'static str {
        "eternalblue"
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
        let targets = pending_hosts(&ctx.inventory, FIELD, |h| h.open_ports.contains(&445));
        if targets.is_empty() {
            tracing::info!(module = self.name(), "No valid targets for EternalBlue scan");
            return Ok(());
        }

        let scan = ScriptScan {
            label: "eternalblue",
            script: SCRIPT,
            ports: &PORTS,
        };
        let run = scan.run(&self.nmap, &ctx.artifact_dir, &targets).await?;
        let vulnerable = record_verdicts(&ctx.inventory, FIELD, verdicts(&run));

        tracing::info!(
            module = self.name(),
            scanned = targets.len(),
            vulnerable,
            "EternalBlue scan complete"
        );
        Ok(())
    }

    fn report(&self, inventory: &Inventory) {
        print_affected(inventory, FIELD, "EternalBlue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmap_xml::parse_nmap_xml;
    use std::net::Ipv4Addr;

    #[test]
    fn test_verdicts() {
        let xml = r#"<?xml version="1.0"?>
<nmaprun>
  <host>
    <status state="up"/>
    <address addr="10.0.0.5" addrtype="ipv4"/>
    <hostscript>
      <script id="smb-vuln-ms17-010" output="VULNERABLE:&#xa;  Remote Code Execution vulnerability"/>
    </hostscript>
  </host>
  <host>
    <status state="up"/>
    <address addr="10.0.0.6" addrtype="ipv4"/>
  </host>
</nmaprun>"#;
        let run = parse_nmap_xml(xml.as_bytes()).unwrap();
        assert_eq!(
            verdicts(&run),
            vec![
                (Ipv4Addr::new(10, 0, 0, 5), true),
                (Ipv4Addr::new(10, 0, 0, 6), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_targets_is_noop() {
        let inventory = std::sync::Arc::new(Inventory::new());
        inventory.add_open_port(Ipv4Addr::new(10, 0, 0, 1), 22);
        let dir = tempfile::tempdir().unwrap();
        let ctx = ModuleContext {
            inventory: inventory.clone(),
            artifact_dir: dir.path().to_path_buf(),
        };
        // No host has 445 open, so nmap is never launched.
        EternalBlue::new(Nmap::new("/nonexistent/nmap", std::time::Duration::from_secs(5))).run(&ctx).await.unwrap();
        assert_eq!(inventory.get(&Ipv4Addr::new(10, 0, 0, 1)).unwrap().field(FIELD), None);
    }
}
