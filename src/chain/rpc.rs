//! Minimal EVM JSON-RPC client over reqwest
//!
//! Used for the handful of reads where a plain JSON shape is enough: head
//! height, block hashes, receipts and transaction lookups. Each call tries the
//! configured URLs in order and returns the first answer.

use std::time::Duration;

use alloy::primitives::B256;
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::types::TxStatus;

/// EVM RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// EVM RPC error
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Fields of a transaction receipt the relayer needs
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionReceipt {
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    hash: Option<String>,
}

/// Parse a 0x-prefixed hex quantity
pub fn parse_quantity(hex: &str) -> Result<u64> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .wrap_err_with(|| format!("Invalid hex quantity: {}", hex))
}

fn quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    client: Client,
    urls: Vec<String>,
}

impl JsonRpcClient {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self> {
        if urls.is_empty() {
            return Err(eyre!("At least one RPC URL is required"));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build HTTP client")?;
        Ok(Self { client, urls })
    }

    /// Call `method` on the first URL that answers
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let mut last_error = None;
        for url in &self.urls {
            match self.call_url(url, method, &params).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(url = %url, method, error = %e, "RPC call failed, trying next endpoint");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| eyre!("No RPC endpoint answered {}", method)))
    }

    async fn call_url<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<Option<T>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .wrap_err_with(|| format!("{} request failed", method))?
            .json::<RpcResponse<T>>()
            .await
            .wrap_err_with(|| format!("{} returned an invalid response", method))?;

        if let Some(error) = response.error {
            return Err(eyre!("RPC error: {} - {}", error.code, error.message));
        }

        Ok(response.result)
    }

    /// Get current block number from RPC
    pub async fn block_number(&self) -> Result<u64> {
        let hex: String = self
            .call("eth_blockNumber", serde_json::json!([]))
            .await?
            .ok_or_else(|| eyre!("No block number returned"))?;
        parse_quantity(&hex)
    }

    pub async fn block_hash(&self, height: u64) -> Result<Option<B256>> {
        let header: Option<BlockHeader> = self
            .call(
                "eth_getBlockByNumber",
                serde_json::json!([quantity(height), false]),
            )
            .await?;

        header
            .and_then(|h| h.hash)
            .map(|hash| {
                hash.parse::<B256>()
                    .wrap_err_with(|| format!("Invalid block hash: {}", hash))
            })
            .transpose()
    }

    pub async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TransactionReceipt>> {
        self.call(
            "eth_getTransactionReceipt",
            serde_json::json!([format!("{:#x}", tx_hash)]),
        )
        .await
    }

    pub async fn transaction_known(&self, tx_hash: B256) -> Result<bool> {
        let tx: Option<serde_json::Value> = self
            .call(
                "eth_getTransactionByHash",
                serde_json::json!([format!("{:#x}", tx_hash)]),
            )
            .await?;
        Ok(tx.is_some())
    }

    /// Classify a transaction from its receipt, falling back to a mempool lookup
    pub async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus> {
        if let Some(receipt) = self.transaction_receipt(tx_hash).await? {
            return receipt_status(&receipt);
        }
        if self.transaction_known(tx_hash).await? {
            Ok(TxStatus::Pending)
        } else {
            Ok(TxStatus::NotFound)
        }
    }
}

/// Map a receipt to a transaction status
pub fn receipt_status(receipt: &TransactionReceipt) -> Result<TxStatus> {
    let Some(block) = receipt.block_number.as_deref() else {
        return Ok(TxStatus::Pending);
    };
    let block = parse_quantity(block)?;
    if receipt.status.as_deref() == Some("0x0") {
        Ok(TxStatus::Reverted { block })
    } else {
        Ok(TxStatus::Included { block })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x10").unwrap(), 16);
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert!(parse_quantity("0xzz").is_err());
        assert_eq!(quantity(255), "0xff");
    }

    #[test]
    fn test_receipt_status() {
        let ok = TransactionReceipt {
            block_number: Some("0x64".into()),
            status: Some("0x1".into()),
        };
        assert_eq!(receipt_status(&ok).unwrap(), TxStatus::Included { block: 100 });

        let reverted = TransactionReceipt {
            block_number: Some("0x64".into()),
            status: Some("0x0".into()),
        };
        assert_eq!(
            receipt_status(&reverted).unwrap(),
            TxStatus::Reverted { block: 100 }
        );

        let pending = TransactionReceipt {
            block_number: None,
            status: None,
        };
        assert_eq!(receipt_status(&pending).unwrap(), TxStatus::Pending);
    }

    #[test]
    fn test_response_deserialization() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":{"blockNumber":"0x1b4","status":"0x1","transactionHash":"0xab"}}"#;
        let response: RpcResponse<TransactionReceipt> = serde_json::from_str(json).unwrap();
        let receipt = response.result.unwrap();
        assert_eq!(receipt.block_number.as_deref(), Some("0x1b4"));

        let json = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#;
        let response: RpcResponse<BlockHeader> = serde_json::from_str(json).unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, -32000);
    }

    #[test]
    fn test_empty_urls_rejected() {
        assert!(JsonRpcClient::new(vec![], Duration::from_secs(1)).is_err());
    }
}
