use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use crate::error::{EchError, Result};

/// Where the range lists are fetched from when the local copies are
/// missing or empty.
pub const DEFAULT_V4_URL: &str =
    "https://raw.githubusercontent.com/mayaxcn/china-ip-list/master/chn_ip.txt";
pub const DEFAULT_V6_URL: &str =
    "https://raw.githubusercontent.com/mayaxcn/china-ip-list/master/chn_ip_v6.txt";

pub const V4_FILE: &str = "chn_ip.txt";
pub const V6_FILE: &str = "chn_ip_v6.txt";

/// Sorted, disjoint inclusive ranges; membership is a binary search.
#[derive(Debug, Default)]
pub struct CnIpTables {
    v4: Vec<(u32, u32)>,
    v6: Vec<([u8; 16], [u8; 16])>,
}

impl CnIpTables {
    /// Parse `start-ip end-ip` lines; `#` comments and blank lines are
    /// skipped, inverted or unparsable ranges dropped.
    pub fn parse(v4_text: &str, v6_text: &str) -> Self {
        let mut v4 = Vec::new();
        for line in v4_text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(a), Some(b)) = (parts.next(), parts.next()) else {
                continue;
            };
            let (Ok(start), Ok(end)) = (a.parse::<Ipv4Addr>(), b.parse::<Ipv4Addr>()) else {
                debug!(line, "skipping unparsable IPv4 range");
                continue;
            };
            let (start, end) = (u32::from(start), u32::from(end));
            if start > end {
                debug!(line, "skipping inverted IPv4 range");
                continue;
            }
            v4.push((start, end));
        }
        v4.sort_unstable_by_key(|r| r.0);

        let mut v6 = Vec::new();
        for line in v6_text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(a), Some(b)) = (parts.next(), parts.next()) else {
                continue;
            };
            let (Ok(start), Ok(end)) = (a.parse::<Ipv6Addr>(), b.parse::<Ipv6Addr>()) else {
                debug!(line, "skipping unparsable IPv6 range");
                continue;
            };
            let (start, end) = (start.octets(), end.octets());
            if start > end {
                debug!(line, "skipping inverted IPv6 range");
                continue;
            }
            v6.push((start, end));
        }
        v6.sort_unstable_by_key(|r| r.0);

        Self { v4, v6 }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                let ip = u32::from(v4);
                let idx = self.v4.partition_point(|r| r.0 <= ip);
                idx > 0 && self.v4[idx - 1].1 >= ip
            }
            IpAddr::V6(v6) => {
                let ip = v6.octets();
                let idx = self.v6.partition_point(|r| r.0 <= ip);
                idx > 0 && self.v6[idx - 1].1 >= ip
            }
        }
    }
}

/// Reloadable CN IP membership database backed by two range files under
/// the store directory.
pub struct CnIpDatabase {
    tables: ArcSwap<CnIpTables>,
    v4_path: PathBuf,
    v6_path: PathBuf,
}

impl CnIpDatabase {
    pub fn empty() -> Self {
        Self {
            tables: ArcSwap::from_pointee(CnIpTables::default()),
            v4_path: PathBuf::new(),
            v6_path: PathBuf::new(),
        }
    }

    /// Load the range files, downloading them first when missing or
    /// zero-size. Download failures leave the affected family empty.
    pub async fn load(store_dir: &Path, client: &reqwest::Client) -> Result<Self> {
        let v4_path = store_dir.join(V4_FILE);
        let v6_path = store_dir.join(V6_FILE);

        ensure_file(client, &v4_path, DEFAULT_V4_URL).await;
        ensure_file(client, &v6_path, DEFAULT_V6_URL).await;

        let db = Self { tables: ArcSwap::from_pointee(CnIpTables::default()), v4_path, v6_path };
        db.reload().await?;
        Ok(db)
    }

    /// Re-parse the on-disk files and swap the tables atomically.
    pub async fn reload(&self) -> Result<()> {
        let v4_text = tokio::fs::read_to_string(&self.v4_path).await.unwrap_or_default();
        let v6_text = tokio::fs::read_to_string(&self.v6_path).await.unwrap_or_default();
        if v4_text.is_empty() && v6_text.is_empty() {
            return Err(EchError::Persistence(format!(
                "no CN-IP data at {} / {}",
                self.v4_path.display(),
                self.v6_path.display()
            )));
        }
        let tables = CnIpTables::parse(&v4_text, &v6_text);
        info!(ranges = tables.len(), "CN-IP tables loaded");
        self.tables.store(Arc::new(tables));
        Ok(())
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.tables.load().contains(ip)
    }

    #[cfg(test)]
    pub fn from_tables(tables: CnIpTables) -> Self {
        Self {
            tables: ArcSwap::from_pointee(tables),
            v4_path: PathBuf::new(),
            v6_path: PathBuf::new(),
        }
    }
}

async fn ensure_file(client: &reqwest::Client, path: &Path, url: &str) {
    let present = tokio::fs::metadata(path).await.map(|m| m.len() > 0).unwrap_or(false);
    if present {
        return;
    }
    info!(path = %path.display(), url, "CN-IP list missing, downloading");
    match download(client, url).await {
        Ok(body) => {
            if let Err(e) = tokio::fs::write(path, &body).await {
                warn!(path = %path.display(), error = %e, "failed to write CN-IP list");
            }
        }
        Err(e) => warn!(url, error = %e, "CN-IP list download failed"),
    }
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| EchError::Persistence(format!("download {url}: {e}")))?;
    if !resp.status().is_success() {
        return Err(EchError::Persistence(format!("download {url}: status {}", resp.status())));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| EchError::Persistence(format!("download {url}: {e}")))?;
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(v4: &str, v6: &str) -> CnIpTables {
        CnIpTables::parse(v4, v6)
    }

    #[test]
    fn v4_membership_boundaries() {
        let t = table("10.0.0.0 10.0.0.255\n", "");
        assert!(t.contains("10.0.0.0".parse().unwrap()));
        assert!(t.contains("10.0.0.128".parse().unwrap()));
        assert!(t.contains("10.0.0.255".parse().unwrap()));
        assert!(!t.contains("9.255.255.255".parse().unwrap()));
        assert!(!t.contains("10.0.1.0".parse().unwrap()));
    }

    #[test]
    fn v6_membership_boundaries() {
        let t = table("", "2001:db8:: 2001:db8::ff\n");
        assert!(t.contains("2001:db8::".parse().unwrap()));
        assert!(t.contains("2001:db8::7f".parse().unwrap()));
        assert!(t.contains("2001:db8::ff".parse().unwrap()));
        assert!(!t.contains("2001:db7:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap()));
        assert!(!t.contains("2001:db8::100".parse().unwrap()));
    }

    #[test]
    fn comments_blanks_and_inverted_ranges_are_skipped() {
        let t = table(
            "# header\n\n1.0.0.0 1.255.255.255\n4.0.0.0 3.0.0.0\nbogus line\n",
            "",
        );
        assert!(t.contains("1.2.3.4".parse().unwrap()));
        assert!(!t.contains("4.0.0.0".parse().unwrap()));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn unsorted_input_is_sorted_before_search() {
        let t = table("100.0.0.0 100.0.0.255\n1.0.0.0 1.0.0.255\n50.0.0.0 50.0.0.255\n", "");
        assert!(t.contains("1.0.0.10".parse().unwrap()));
        assert!(t.contains("50.0.0.10".parse().unwrap()));
        assert!(t.contains("100.0.0.10".parse().unwrap()));
        assert!(!t.contains("60.0.0.1".parse().unwrap()));
    }
}
