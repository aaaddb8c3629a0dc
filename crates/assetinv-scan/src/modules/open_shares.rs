//! Anonymous FTP and world-readable NFS exports.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use assetinv_core::Inventory;

use super::nmap_script::{Nmap, ScriptScan};
use super::{pending_hosts, print_affected, record_verdicts, Module, ModuleContext};
use crate::error::Result;
use crate::nmap_xml::NmapRun;

pub const FTP_FIELD: &str = "Open FTP";
pub const NFS_FIELD: &str = "Open NFS";

const FTP_PORT: u16 = 21;
const RPCBIND_PORT: u16 = 111;
/// Printers answer on 21 with anonymous access by default.
const JETDIRECT_PORT: u16 = 9100;

pub struct OpenShares {
    nmap: Nmap,
}

impl OpenShares {
    pub fn new(nmap: Nmap) -> Self {
        Self { nmap }
    }

    async fn check(
        &self,
        ctx: &ModuleContext,
        field: &str,
        scan: ScriptScan<'_>,
        targets: Vec<Ipv4Addr>,
        is_open: fn(&str) -> bool,
    ) {
        if targets.is_empty() {
            tracing::info!(script = scan.script, "No valid targets");
            return;
        }
        match scan.run(&self.nmap, &ctx.artifact_dir, &targets).await {
            Ok(run) => {
                let open = record_verdicts(
                    &ctx.inventory,
                    field,
                    script_verdicts(&run, scan.script, is_open),
                );
                tracing::info!(field, scanned = targets.len(), open, "Share scan complete");
            }
            Err(e) => tracing::warn!(script = scan.script, error = %e, "Share scan failed"),
        }
    }
}

/// One verdict per host in the run: true if any port-level result for
/// `script` satisfies `is_open`.
pub fn script_verdicts(run: &NmapRun, script: &str, is_open: fn(&str) -> bool) -> Vec<(Ipv4Addr, bool)> {
    run.hosts
        .iter()
        .filter_map(|host| {
            let ip = host.ipv4()?;
            let open = host.port_script_outputs(script).any(|(_, out)| is_open(out));
            Some((ip, open))
        })
        .collect()
}

fn ftp_open(output: &str) -> bool {
    output.contains("Anonymous FTP login allowed")
}

fn nfs_open(output: &str) -> bool {
    output.contains('/')
}

#[async_trait]
impl Module for OpenShares {
    fn name(&self) -> &'static str {
        "open-shares"
    }

    fn csv_headers(&self) -> Vec<String> {
        vec![FTP_FIELD.to_string(), NFS_FIELD.to_string()]
    }

    fn required_ports(&self) -> Vec<u16> {
        vec![FTP_PORT, RPCBIND_PORT, JETDIRECT_PORT]
    }

    fn required_programs(&self) -> Vec<String> {
        vec![self.nmap.path.clone()]
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<()> {
        let ftp_targets = pending_hosts(&ctx.inventory, FTP_FIELD, |h| {
            h.open_ports.contains(&FTP_PORT) && !h.open_ports.contains(&JETDIRECT_PORT)
        });
        let ftp = ScriptScan {
            label: "ftp",
            script: "ftp-anon",
            ports: &[FTP_PORT],
        };
        self.check(ctx, FTP_FIELD, ftp, ftp_targets, ftp_open).await;

        let nfs_targets =
            pending_hosts(&ctx.inventory, NFS_FIELD, |h| h.open_ports.contains(&RPCBIND_PORT));
        let nfs = ScriptScan {
            label: "nfs",
            script: "nfs-showmount",
            ports: &[RPCBIND_PORT],
        };
        self.check(ctx, NFS_FIELD, nfs, nfs_targets, nfs_open).await;

        Ok(())
    }

    fn report(&self, inventory: &Inventory) {
        print_affected(inventory, NFS_FIELD, "open NFS shares");
        print_affected(inventory, FTP_FIELD, "open FTP");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmap_xml::parse_nmap_xml;

    const NFS_XML: &str = r#"<?xml version="1.0"?>
<nmaprun>
  <host>
    <address addr="10.0.3.10" addrtype="ipv4"/>
    <ports>
      <port protocol="tcp" portid="111">
        <state state="open"/>
        <script id="nfs-showmount" output="&#xa;  /srv/exports 10.0.0.0/255.0.0.0&#xa;"/>
      </port>
    </ports>
  </host>
  <host>
    <address addr="10.0.3.11" addrtype="ipv4"/>
    <ports>
      <port protocol="tcp" portid="111">
        <state state="open"/>
      </port>
    </ports>
  </host>
</nmaprun>"#;

    #[test]
    fn test_nfs_verdicts() {
        let run = parse_nmap_xml(NFS_XML.as_bytes()).unwrap();
        assert_eq!(
            script_verdicts(&run, "nfs-showmount", nfs_open),
            vec![
                (Ipv4Addr::new(10, 0, 3, 10), true),
                (Ipv4Addr::new(10, 0, 3, 11), false),
            ]
        );
    }

    #[test]
    fn test_ftp_marker() {
        assert!(ftp_open("Anonymous FTP login allowed (FTP code 230)"));
        assert!(!ftp_open("ERROR: Script execution failed"));
    }

    #[tokio::test]
    async fn test_printers_excluded_from_ftp() {
        let inventory = std::sync::Arc::new(Inventory::new());
        let printer = Ipv4Addr::new(10, 0, 3, 50);
        inventory.add_open_port(printer, FTP_PORT);
        inventory.add_open_port(printer, JETDIRECT_PORT);

        let pending = pending_hosts(&inventory, FTP_FIELD, |h| {
            h.open_ports.contains(&FTP_PORT) && !h.open_ports.contains(&JETDIRECT_PORT)
        });
        assert!(pending.is_empty());

        let dir = tempfile::tempdir().unwrap();
        let ctx = ModuleContext {
            inventory: inventory.clone(),
            artifact_dir: dir.path().to_path_buf(),
        };
        // Nothing to scan, so the missing nmap binary is never touched.
        OpenShares::new(Nmap::new("/nonexistent/nmap", std::time::Duration::from_secs(5))).run(&ctx).await.unwrap();
        assert_eq!(inventory.get(&printer).unwrap().field(FTP_FIELD), None);
    }
}
