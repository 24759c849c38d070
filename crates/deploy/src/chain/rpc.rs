//! Ethereum JSON-RPC chain client.

use std::time::Duration;

use alloy_core::primitives::{Address, Bytes, TxHash, U64};
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value as Json, json};
use url::Url;

use super::{Call, ChainClient, DeployRequest, TxReceipt, abi};
use crate::{
    error::ChainError,
    node::{ContractHandle, Value, ValueKind},
};

/// Default timeout for a single RPC request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounds of the receipt polling backoff.
const RECEIPT_MIN_DELAY: Duration = Duration::from_millis(500);
const RECEIPT_MAX_DELAY: Duration = Duration::from_secs(5);
const RECEIPT_MAX_POLLS: usize = 60;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: TxHash,
    status: Option<U64>,
    contract_address: Option<Address>,
    block_number: Option<U64>,
}

/// [`ChainClient`] over an Ethereum JSON-RPC endpoint.
///
/// Transactions are sent with `eth_sendTransaction`, so the endpoint must manage the signer's
/// key (anvil, a local node or a signing proxy).
#[derive(Debug, Clone)]
pub struct RpcChain {
    client: reqwest::Client,
    url: Url,
}

impl RpcChain {
    pub fn new(url: Url) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Json>,
    ) -> Result<T, ChainError> {
        let response: Json = self
            .client
            .post(self.url.clone())
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Json::as_str)
                .unwrap_or("unknown");
            return Err(ChainError::Rpc(format!("{method}: {message}")));
        }

        let result = response
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("{method}: no result in response")))?;

        serde_json::from_value(result)
            .map_err(|err| ChainError::Decode(format!("{method}: {err}")))
    }

    async fn send_transaction(
        &self,
        from: Address,
        to: Option<Address>,
        data: Vec<u8>,
    ) -> Result<RawReceipt, ChainError> {
        let mut transaction = json!({
            "from": from,
            "data": Bytes::from(data),
        });
        if let Some(to) = to {
            transaction["to"] = json!(to);
        }

        let hash: TxHash = self
            .request("eth_sendTransaction", vec![transaction])
            .await?;
        tracing::debug!(tx = %hash, "Transaction submitted, waiting for receipt");

        let receipt = self.wait_for_receipt(hash).await?;
        if receipt.status.is_some_and(|status| status.is_zero()) {
            return Err(ChainError::Reverted(format!("transaction {hash} failed")));
        }

        Ok(receipt)
    }

    async fn poll_receipt(&self, hash: TxHash) -> Result<RawReceipt, ChainError> {
        let receipt: Option<RawReceipt> = self
            .request("eth_getTransactionReceipt", vec![json!(hash)])
            .await?;
        receipt.ok_or_else(|| ChainError::Timeout(format!("receipt of {hash}")))
    }

    async fn wait_for_receipt(&self, hash: TxHash) -> Result<RawReceipt, ChainError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(RECEIPT_MIN_DELAY)
            .with_max_delay(RECEIPT_MAX_DELAY)
            .with_max_times(RECEIPT_MAX_POLLS);

        (|| self.poll_receipt(hash))
            .retry(backoff)
            .when(|err| matches!(err, ChainError::Timeout(_)))
            .await
    }
}

/// Parse hex creation bytecode, with or without a `0x` prefix.
fn parse_bytecode(content: &str) -> Result<Vec<u8>, String> {
    let content = content.trim();
    let content = content.strip_prefix("0x").unwrap_or(content);
    if content.is_empty() {
        return Err("artifact is empty".to_string());
    }
    hex::decode(content).map_err(|err| err.to_string())
}

impl ChainClient for RpcChain {
    async fn deploy(&self, request: DeployRequest) -> Result<ContractHandle, ChainError> {
        let artifact_error = |reason: String| ChainError::Artifact {
            path: request.artifact.clone(),
            reason,
        };

        let content = tokio::fs::read_to_string(&request.artifact)
            .await
            .map_err(|err| artifact_error(err.to_string()))?;
        let mut data = parse_bytecode(&content).map_err(artifact_error)?;
        data.extend(abi::encode_args(&request.args));

        let receipt = self.send_transaction(request.signer, None, data).await?;
        let address = receipt.contract_address.ok_or_else(|| {
            ChainError::Decode(format!(
                "receipt of {} has no contract address",
                receipt.transaction_hash
            ))
        })?;

        Ok(ContractHandle {
            address,
            transaction: Some(receipt.transaction_hash),
        })
    }

    async fn call(
        &self,
        target: Address,
        call: &Call,
        signer: Address,
    ) -> Result<TxReceipt, ChainError> {
        let receipt = self
            .send_transaction(signer, Some(target), abi::encode_call(call))
            .await?;

        Ok(TxReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|block| block.to::<u64>()),
        })
    }

    async fn read(
        &self,
        target: Address,
        call: &Call,
        returns: ValueKind,
    ) -> Result<Value, ChainError> {
        let output: Bytes = self
            .request(
                "eth_call",
                vec![
                    json!({ "to": target, "data": Bytes::from(abi::encode_call(call)) }),
                    json!("latest"),
                ],
            )
            .await?;

        abi::decode_word(returns, &output)
    }
}
