/// The upstream full node the Prefetcher pulls raw blocks from. The trait
/// is the only contract the core pipeline depends on; `RpcDaemon` is a
/// thin JSON-RPC client sufficient to drive it against a real Bitcoin-style
/// daemon, grounded in the teacher's `reqwest`-based RPC dependency (the
/// teacher's own RPC surface lives in its now-removed API layer, out of
/// scope here).
use crate::error::{IndexError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

#[async_trait]
pub trait Daemon: Send + Sync {
    /// The daemon's current best-chain height.
    async fn height(&self) -> Result<i32>;
    /// A height the caller has already confirmed via `height()`; kept
    /// distinct so a Prefetcher can avoid re-querying every loop iteration.
    async fn cached_height(&self) -> i32;
    /// Hex-encoded block hashes for `[start, start + count)`.
    async fn block_hex_hashes(&self, start: i32, count: u32) -> Result<Vec<String>>;
    /// Raw serialized blocks for the given hex hashes, in the same order.
    async fn raw_blocks(&self, hashes: &[String]) -> Result<Vec<Vec<u8>>>;
}

pub struct RpcDaemon {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    last_height: std::sync::atomic::AtomicI32,
}

impl RpcDaemon {
    pub fn new(url: String, user: Option<String>, password: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            user,
            password,
            last_height: std::sync::atomic::AtomicI32::new(-1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({ "jsonrpc": "1.0", "id": "addrindex", "method": method, "params": params });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|e| IndexError::Daemon(format!("{method}: {e}")))?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| IndexError::Daemon(format!("{method}: bad response: {e}")))?;
        if let Some(err) = parsed.get("error") {
            if !err.is_null() {
                return Err(IndexError::Daemon(format!("{method}: rpc error {err}")));
            }
        }
        parsed
            .get("result")
            .cloned()
            .ok_or_else(|| IndexError::Daemon(format!("{method}: missing result field")))
    }
}

#[async_trait]
impl Daemon for RpcDaemon {
    async fn height(&self) -> Result<i32> {
        let result = self.call("getblockcount", json!([])).await?;
        let height = result
            .as_i64()
            .ok_or_else(|| IndexError::Daemon("getblockcount: non-integer result".into()))? as i32;
        self.last_height.store(height, std::sync::atomic::Ordering::Relaxed);
        Ok(height)
    }

    async fn cached_height(&self) -> i32 {
        self.last_height.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn block_hex_hashes(&self, start: i32, count: u32) -> Result<Vec<String>> {
        let mut hashes = Vec::with_capacity(count as usize);
        for height in start..start + count as i32 {
            let result = self.call("getblockhash", json!([height])).await?;
            let hash = result
                .as_str()
                .ok_or_else(|| IndexError::Daemon("getblockhash: non-string result".into()))?;
            hashes.push(hash.to_string());
        }
        Ok(hashes)
    }

    async fn raw_blocks(&self, hashes: &[String]) -> Result<Vec<Vec<u8>>> {
        let mut blocks = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let result = self.call("getblock", json!([hash, 0])).await?;
            let hex_str = result
                .as_str()
                .ok_or_else(|| IndexError::Daemon("getblock: non-string result".into()))?;
            let raw = hex::decode(hex_str).map_err(|e| IndexError::Daemon(format!("getblock: bad hex: {e}")))?;
            blocks.push(raw);
        }
        Ok(blocks)
    }
}

/// Deterministic in-memory daemon for tests: serves a fixed chain of raw
/// blocks without any network I/O.
pub struct MockDaemon {
    pub blocks: Vec<Vec<u8>>,
    pub hashes: Vec<String>,
}

#[async_trait]
impl Daemon for MockDaemon {
    async fn height(&self) -> Result<i32> {
        Ok(self.blocks.len() as i32 - 1)
    }

    async fn cached_height(&self) -> i32 {
        self.blocks.len() as i32 - 1
    }

    async fn block_hex_hashes(&self, start: i32, count: u32) -> Result<Vec<String>> {
        let start = start as usize;
        let end = (start + count as usize).min(self.hashes.len());
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self.hashes[start..end].to_vec())
    }

    async fn raw_blocks(&self, hashes: &[String]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let idx = self
                .hashes
                .iter()
                .position(|h| h == hash)
                .ok_or_else(|| IndexError::Daemon(format!("unknown hash {hash}")))?;
            out.push(self.blocks[idx].clone());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_daemon_serves_blocks_by_hash() {
        let daemon = MockDaemon {
            blocks: vec![vec![1, 2, 3], vec![4, 5, 6]],
            hashes: vec!["aa".to_string(), "bb".to_string()],
        };
        assert_eq!(daemon.height().await.unwrap(), 1);
        let hashes = daemon.block_hex_hashes(0, 2).await.unwrap();
        assert_eq!(hashes, vec!["aa", "bb"]);
        let blocks = daemon.raw_blocks(&hashes).await.unwrap();
        assert_eq!(blocks, vec![vec![1, 2, 3], vec![4, 5, 6]]);
    }

    #[tokio::test]
    async fn mock_daemon_errors_on_unknown_hash() {
        let daemon = MockDaemon { blocks: vec![], hashes: vec![] };
        let err = daemon.raw_blocks(&["zz".to_string()]).await.unwrap_err();
        assert!(matches!(err, IndexError::Daemon(_)));
    }
}
