use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info, warn};

use super::contract::BridgeContract;
use super::rpc::JsonRpcClient;
use super::{descending_ranges, ChainClient};
use crate::config::ChainConfig;
use crate::types::{BridgeEvent, ChainSide, EventKey, EventType, RelayAction, RelayKind, TxStatus};

/// Bridge chain reached over EVM JSON-RPC
pub struct EvmChain {
    side: ChainSide,
    name: String,
    bridge_address: Address,
    /// Log queries go through alloy, one provider per configured URL
    providers: Vec<RootProvider<Http<Client>>>,
    rpc: JsonRpcClient,
    submit_url: reqwest::Url,
    signer: PrivateKeySigner,
    /// Lower bound for relay lookups on this chain
    start_block: u64,
    /// Widest block span a single log query may cover
    max_block_range: u64,
    rpc_timeout: Duration,
}

impl EvmChain {
    pub fn new(config: &ChainConfig, rpc_timeout: Duration) -> Result<Self> {
        let urls = config.all_rpc_urls();
        let providers = urls
            .iter()
            .map(|url| {
                let parsed = url
                    .parse()
                    .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
                Ok(ProviderBuilder::new().on_http(parsed))
            })
            .collect::<Result<Vec<_>>>()?;

        let submit_url = config
            .rpc_url
            .parse()
            .wrap_err_with(|| format!("Invalid RPC URL: {}", config.rpc_url))?;

        let bridge_address =
            Address::from_str(&config.bridge_address).wrap_err("Invalid bridge address")?;

        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .wrap_err("Invalid private key")?;

        info!(
            chain = %config.name,
            chain_id = config.chain_id,
            bridge = %bridge_address,
            relayer = %signer.address(),
            rpc_endpoints = urls.len(),
            "EVM chain client initialized"
        );

        Ok(Self {
            side: config.side,
            name: config.name.clone(),
            bridge_address,
            providers,
            rpc: JsonRpcClient::new(urls, rpc_timeout)?,
            submit_url,
            signer,
            start_block: config.start_block,
            max_block_range: config.max_block_range,
            rpc_timeout,
        })
    }

    async fn with_timeout<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.rpc_timeout, fut)
            .await
            .map_err(|_| eyre!("{} timed out after {:?}", what, self.rpc_timeout))?
    }

    /// Run a log query against each provider until one answers
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        let mut last_error = None;
        for (index, provider) in self.providers.iter().enumerate() {
            match self
                .with_timeout("eth_getLogs", async {
                    provider
                        .get_logs(filter)
                        .await
                        .map_err(|e| eyre!("eth_getLogs failed: {}", e))
                })
                .await
            {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!(chain = %self.name, endpoint = index, error = %e, "Log query failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| eyre!("No RPC provider configured")))
    }

    /// Ask the bridge contract whether the proof for a source event was used
    async fn is_relayed(&self, key: &EventKey, source_chain_id: u64) -> Result<bool> {
        let mut last_error = None;
        for (index, provider) in self.providers.iter().enumerate() {
            let contract = BridgeContract::new(self.bridge_address, provider);
            match self
                .with_timeout("isRelayed", async {
                    contract
                        .isRelayed(source_chain_id, key.event_type.as_u8(), key.nonce)
                        .call()
                        .await
                        .map_err(|e| eyre!("isRelayed call failed: {}", e))
                })
                .await
            {
                Ok(result) => return Ok(result.relayed),
                Err(e) => {
                    warn!(
                        chain = %self.name,
                        endpoint = index,
                        error = %e,
                        "Relay status query failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| eyre!("No RPC provider configured")))
    }

    fn parse_bridge_log(&self, log: &Log) -> Result<Option<BridgeEvent>> {
        let Some(topic0) = log.topics().first() else {
            return Ok(None);
        };

        let (event_type, nonce, sender, recipient, amount) =
            if *topic0 == BridgeContract::Locked::SIGNATURE_HASH {
                let decoded = log
                    .log_decode::<BridgeContract::Locked>()
                    .wrap_err("Failed to decode Locked event")?;
                let data = decoded.inner.data;
                (EventType::Lock, data.nonce, data.sender, data.recipient, data.amount)
            } else if *topic0 == BridgeContract::Burned::SIGNATURE_HASH {
                let decoded = log
                    .log_decode::<BridgeContract::Burned>()
                    .wrap_err("Failed to decode Burned event")?;
                let data = decoded.inner.data;
                (EventType::Burn, data.nonce, data.sender, data.recipient, data.amount)
            } else {
                return Ok(None);
            };

        let source_tx_hash = log
            .transaction_hash
            .ok_or_else(|| eyre!("Bridge log without transaction hash"))?;
        let source_block_height = log
            .block_number
            .ok_or_else(|| eyre!("Bridge log without block number"))?;

        Ok(Some(BridgeEvent {
            source_chain: self.side,
            event_type,
            nonce,
            sender: sender.into_word(),
            recipient,
            amount,
            source_tx_hash,
            source_block_height,
            observed_at: Utc::now(),
        }))
    }
}

#[async_trait]
impl ChainClient for EvmChain {
    fn side(&self) -> ChainSide {
        self.side
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self) -> Result<u64> {
        self.with_timeout("eth_blockNumber", self.rpc.block_number())
            .await
    }

    async fn block_hash(&self, height: u64) -> Result<Option<B256>> {
        self.with_timeout("eth_getBlockByNumber", self.rpc.block_hash(height))
            .await
    }

    async fn bridge_events(&self, from: u64, to: u64) -> Result<Vec<BridgeEvent>> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(vec![
                BridgeContract::Locked::SIGNATURE_HASH,
                BridgeContract::Burned::SIGNATURE_HASH,
            ])
            .from_block(from)
            .to_block(to);

        let logs = self.get_logs(&filter).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            if log.removed {
                continue;
            }
            if let Some(event) = self.parse_bridge_log(log)? {
                events.push(event);
            }
        }

        debug!(
            chain = %self.name,
            from_block = from,
            to_block = to,
            logs = logs.len(),
            events = events.len(),
            "Fetched bridge events"
        );
        Ok(events)
    }

    async fn submit(&self, action: &RelayAction) -> Result<B256> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.submit_url.clone());
        let contract = BridgeContract::new(self.bridge_address, &provider);

        let send = async {
            let pending = match action.kind {
                RelayKind::Mint => {
                    contract
                        .mint(
                            action.source_chain_id,
                            action.key.nonce,
                            action.sender,
                            action.recipient,
                            action.amount,
                            action.source_tx_hash,
                            action.proof.clone(),
                        )
                        .send()
                        .await
                }
                RelayKind::Release => {
                    contract
                        .release(
                            action.source_chain_id,
                            action.key.nonce,
                            action.sender,
                            action.recipient,
                            action.amount,
                            action.source_tx_hash,
                            action.proof.clone(),
                        )
                        .send()
                        .await
                }
            }
            .map_err(|e| eyre!("Failed to send {} transaction: {}", action.kind, e))?;
            Ok::<_, eyre::Report>(*pending.tx_hash())
        };
        let tx_hash = self.with_timeout("relay submission", send).await?;

        info!(
            chain = %self.name,
            key = %action.key,
            kind = %action.kind,
            tx_hash = %tx_hash,
            "Relay transaction broadcast"
        );
        Ok(tx_hash)
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus> {
        self.with_timeout("transaction status", self.rpc.transaction_status(tx_hash))
            .await
    }

    async fn find_completed(&self, key: &EventKey, source_chain_id: u64) -> Result<Option<B256>> {
        if !self.is_relayed(key, source_chain_id).await? {
            return Ok(None);
        }

        // Relays are usually recent, so search backwards from the head
        let head = self.head().await?;
        for (from, to) in descending_ranges(self.start_block, head, self.max_block_range) {
            let filter = Filter::new()
                .address(self.bridge_address)
                .event_signature(BridgeContract::Relayed::SIGNATURE_HASH)
                .topic1(B256::from(U256::from(source_chain_id)))
                .topic2(B256::from(U256::from(key.nonce)))
                .topic3(B256::from(U256::from(key.event_type.as_u8())))
                .from_block(from)
                .to_block(to);

            let logs = self.get_logs(&filter).await?;
            if let Some(tx_hash) = logs
                .iter()
                .filter(|log| !log.removed)
                .find_map(|log| log.transaction_hash)
            {
                debug!(
                    chain = %self.name,
                    key = %key,
                    tx_hash = %tx_hash,
                    "Found relay transaction"
                );
                return Ok(Some(tx_hash));
            }
        }

        Err(eyre!(
            "relay for {} is marked done on {} but no Relayed log was found since block {}",
            key,
            self.name,
            self.start_block
        ))
    }
}
