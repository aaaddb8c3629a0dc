//! Reverse DNS for discovered hosts.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use assetinv_core::Inventory;

/// Hostname lookup seam, so scans can run against fakes.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// `None` when the address has no usable PTR record.
    async fn reverse(&self, ip: Ipv4Addr) -> Option<String>;
}

/// System resolver via `getnameinfo`.
pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn reverse(&self, ip: Ipv4Addr) -> Option<String> {
        let addr = IpAddr::V4(ip);
        let name = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr))
            .await
            .ok()?
            .ok()?;
        // getnameinfo hands back the numeric form when there is no PTR.
        if name.is_empty() || name == ip.to_string() {
            None
        } else {
            Some(name)
        }
    }
}

/// Used with `--no-dns`; never resolves anything.
pub struct NoResolver;

#[async_trait]
impl HostResolver for NoResolver {
    async fn reverse(&self, _ip: Ipv4Addr) -> Option<String> {
        None
    }
}

/// Resolve `ips` with at most `concurrency` lookups in flight and store the
/// result on each host. A failed lookup is stored as an empty hostname so
/// the host is not retried. Returns the number of names found.
pub async fn resolve_hosts(
    inventory: &Arc<Inventory>,
    resolver: Arc<dyn HostResolver>,
    ips: Vec<Ipv4Addr>,
    concurrency: usize,
) -> usize {
    if ips.is_empty() {
        return 0;
    }
    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for ip in ips {
        let resolver = resolver.clone();
        let limit = limit.clone();
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await.ok()?;
            Some((ip, resolver.reverse(ip).await))
        });
    }

    let mut resolved = 0;
    while let Some(joined) = tasks.join_next().await {
        let Ok(Some((ip, name))) = joined else {
            tracing::warn!("Hostname lookup task did not complete");
            continue;
        };
        if name.is_some() {
            resolved += 1;
        }
        inventory.update(&ip, |host| {
            host.hostname = Some(name.unwrap_or_default());
        });
    }

    tracing::debug!(resolved, "Reverse DNS complete");
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetinv_core::HostRecord;
    use std::collections::HashMap;

    struct StaticResolver(HashMap<Ipv4Addr, String>);

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn reverse(&self, ip: Ipv4Addr) -> Option<String> {
            self.0.get(&ip).cloned()
        }
    }

    #[tokio::test]
    async fn test_resolve_hosts_marks_failures() {
        let inventory = Arc::new(Inventory::new());
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);
        inventory.upsert(HostRecord::new(a));
        inventory.upsert(HostRecord::new(b));

        let resolver = StaticResolver([(a, "dc01.corp.local".to_string())].into());
        let found = resolve_hosts(&inventory, Arc::new(resolver), vec![a, b], 4).await;

        assert_eq!(found, 1);
        assert_eq!(inventory.get(&a).unwrap().hostname(), "dc01.corp.local");
        let failed = inventory.get(&b).unwrap();
        assert_eq!(failed.hostname.as_deref(), Some(""));
        assert!(!failed.needs_resolution());
    }

    #[tokio::test]
    async fn test_no_resolver() {
        assert_eq!(NoResolver.reverse(Ipv4Addr::LOCALHOST).await, None);
        let inventory = Arc::new(Inventory::new());
        assert_eq!(resolve_hosts(&inventory, Arc::new(NoResolver), vec![], 0).await, 0);
    }
}
