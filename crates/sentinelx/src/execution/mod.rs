//! Signs, broadcasts and confirms guarded on-chain calls.
//!
//! Chain writes are never retried here: a failed broadcast surfaces to the
//! intent service, which returns the intent to `approved` for an operator to
//! decide on.

pub mod signer;
pub mod tx;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethereum_types::{Address, H256, U256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::abi::{format_address, format_hash};
use crate::error::RpcError;
use crate::rpc::{EthRpcClient, ReceiptStatus};

pub use signer::{LocalSigner, SignerError};
pub use tx::{LegacyTransaction, Signature};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("no signer is configured")]
    NoSigner,
    #[error("transaction refused before broadcast: {0}")]
    Rejected(String),
    #[error("transaction {} reverted", format_hash(.tx_hash))]
    Reverted { tx_hash: H256 },
    #[error("no receipt for {} before the deadline", format_hash(.tx_hash))]
    ReceiptTimeout { tx_hash: H256 },
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::NoSigner => "no_signer",
            ExecutionError::Rejected(_) => "rejected",
            ExecutionError::Reverted { .. } => "reverted",
            ExecutionError::ReceiptTimeout { .. } => "receipt_timeout",
            ExecutionError::Rpc(_) => "rpc",
        }
    }

    pub fn tx_hash(&self) -> Option<H256> {
        match self {
            ExecutionError::Reverted { tx_hash } | ExecutionError::ReceiptTimeout { tx_hash } => {
                Some(*tx_hash)
            }
            _ => None,
        }
    }
}

/// Confirmed execution of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
}

/// Anything that can put a call on chain and report on it later.
#[async_trait]
pub trait ChainWriter: Send + Sync {
    /// Sign and broadcast a call; returns once the node accepted it.
    async fn send_transaction(&self, to: Address, calldata: &[u8]) -> Result<H256, ExecutionError>;
    /// `None` while the transaction is unknown or not yet mined.
    async fn receipt_status(&self, tx_hash: H256) -> Result<Option<ReceiptStatus>, ExecutionError>;
}

#[derive(Debug, Clone)]
pub struct RpcWriterConfig {
    /// Fixed chain id; read from the node once when unset.
    pub chain_id: Option<u64>,
    /// Gas limit headroom over the node's estimate, in percent.
    pub gas_headroom_percent: u64,
}

impl Default for RpcWriterConfig {
    fn default() -> Self {
        Self {
            chain_id: None,
            gas_headroom_percent: 20,
        }
    }
}

/// [`ChainWriter`] signing EIP-155 legacy transactions with a local key.
pub struct RpcChainWriter {
    rpc: Arc<EthRpcClient>,
    signer: LocalSigner,
    config: RpcWriterConfig,
    chain_id: tokio::sync::OnceCell<u64>,
    /// Nonce allocation and broadcast happen under this lock.
    send_lock: Mutex<()>,
}

impl RpcChainWriter {
    pub fn new(rpc: Arc<EthRpcClient>, signer: LocalSigner, config: RpcWriterConfig) -> Self {
        Self {
            rpc,
            signer,
            config,
            chain_id: tokio::sync::OnceCell::new(),
            send_lock: Mutex::new(()),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        if let Some(chain_id) = self.config.chain_id {
            return Ok(chain_id);
        }
        self.chain_id
            .get_or_try_init(|| self.rpc.eth_chain_id())
            .await
            .copied()
    }
}

#[async_trait]
impl ChainWriter for RpcChainWriter {
    async fn send_transaction(&self, to: Address, calldata: &[u8]) -> Result<H256, ExecutionError> {
        let from = self.signer.address();
        let chain_id = self.chain_id().await?;
        let _guard = self.send_lock.lock().await;

        let nonce = self.rpc.eth_get_transaction_count(from).await?;
        let gas_price = self.rpc.eth_gas_price().await?;
        let estimate = self
            .rpc
            .eth_estimate_gas(from, to, calldata)
            .await
            .map_err(|error| match error {
                RpcError::JsonRpcError { message, .. } => ExecutionError::Rejected(message),
                other => ExecutionError::Rpc(other),
            })?;
        let gas_limit = estimate.saturating_add(estimate.saturating_mul(self.config.gas_headroom_percent) / 100);

        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to,
            value: U256::zero(),
            data: calldata.to_vec(),
        };
        let signature = self.signer.sign_digest(tx.signing_hash(chain_id));
        let raw = tx.encode_signed(chain_id, &signature);

        debug!(
            from = %format_address(&from),
            to = %format_address(&to),
            nonce,
            gas_limit,
            "broadcasting transaction"
        );
        self.rpc
            .eth_send_raw_transaction(&raw)
            .await
            .map_err(|error| match error {
                RpcError::JsonRpcError { message, .. } => ExecutionError::Rejected(message),
                other => ExecutionError::Rpc(other),
            })
    }

    async fn receipt_status(&self, tx_hash: H256) -> Result<Option<ReceiptStatus>, ExecutionError> {
        Ok(self.rpc.eth_get_transaction_receipt(tx_hash).await?)
    }
}

pub struct ExecutionGateway {
    writer: Option<Arc<dyn ChainWriter>>,
    receipt_timeout: Duration,
    poll_interval: Duration,
}

impl ExecutionGateway {
    pub fn new(
        writer: Option<Arc<dyn ChainWriter>>,
        receipt_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            writer,
            receipt_timeout,
            poll_interval,
        }
    }

    pub fn has_signer(&self) -> bool {
        self.writer.is_some()
    }

    fn writer(&self) -> Result<&Arc<dyn ChainWriter>, ExecutionError> {
        self.writer.as_ref().ok_or(ExecutionError::NoSigner)
    }

    /// Broadcast only. The hash is returned as soon as the node accepts it.
    pub async fn broadcast(&self, target: Address, calldata: &[u8]) -> Result<H256, ExecutionError> {
        let tx_hash = self.writer()?.send_transaction(target, calldata).await?;
        info!(tx_hash = %format_hash(&tx_hash), target = %format_address(&target), "transaction broadcast");
        Ok(tx_hash)
    }

    /// Broadcast and wait for a successful receipt.
    pub async fn execute(&self, target: Address, calldata: &[u8]) -> Result<ExecutionReceipt, ExecutionError> {
        let tx_hash = self.broadcast(target, calldata).await?;
        self.wait_for_receipt(tx_hash).await
    }

    /// Poll until the receipt arrives or the deadline passes. Polling errors
    /// are tolerated until the deadline, and a slow poll is cut off by it.
    pub async fn wait_for_receipt(&self, tx_hash: H256) -> Result<ExecutionReceipt, ExecutionError> {
        let writer = self.writer()?;
        let deadline = tokio::time::Instant::now() + self.receipt_timeout;

        loop {
            match tokio::time::timeout_at(deadline, writer.receipt_status(tx_hash)).await {
                Ok(Ok(Some(status))) => return receipt_outcome(tx_hash, status),
                Ok(Ok(None)) => {}
                Ok(Err(error)) => {
                    warn!(tx_hash = %format_hash(&tx_hash), error = %error, "receipt poll failed");
                }
                Err(_) => return Err(ExecutionError::ReceiptTimeout { tx_hash }),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ExecutionError::ReceiptTimeout { tx_hash });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// One receipt lookup. `Ok(None)` means still unknown.
    pub async fn check_receipt(&self, tx_hash: H256) -> Result<Option<ExecutionReceipt>, ExecutionError> {
        match self.writer()?.receipt_status(tx_hash).await? {
            Some(status) => receipt_outcome(tx_hash, status).map(Some),
            None => Ok(None),
        }
    }
}

fn receipt_outcome(tx_hash: H256, status: ReceiptStatus) -> Result<ExecutionReceipt, ExecutionError> {
    if status.success {
        Ok(ExecutionReceipt {
            tx_hash,
            block_number: status.block_number,
        })
    } else {
        Err(ExecutionError::Reverted { tx_hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedWriter {
        sends: AtomicUsize,
        receipts: StdMutex<VecDeque<Option<ReceiptStatus>>>,
    }

    impl ScriptedWriter {
        fn new(receipts: Vec<Option<ReceiptStatus>>) -> Self {
            Self {
                sends: AtomicUsize::new(0),
                receipts: StdMutex::new(receipts.into()),
            }
        }
    }

    #[async_trait]
    impl ChainWriter for ScriptedWriter {
        async fn send_transaction(&self, _to: Address, _calldata: &[u8]) -> Result<H256, ExecutionError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(H256::repeat_byte(0xab))
        }

        async fn receipt_status(&self, _tx_hash: H256) -> Result<Option<ReceiptStatus>, ExecutionError> {
            let mut receipts = self.receipts.lock().map_err(|_| ExecutionError::NoSigner)?;
            Ok(receipts.pop_front().flatten())
        }
    }

    fn mined(success: bool) -> Option<ReceiptStatus> {
        Some(ReceiptStatus {
            success,
            block_number: Some(7),
        })
    }

    fn gateway(writer: Arc<ScriptedWriter>) -> ExecutionGateway {
        ExecutionGateway::new(Some(writer), Duration::from_secs(5), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn missing_signer_is_reported_without_io() {
        let gateway = ExecutionGateway::new(None, Duration::from_secs(1), Duration::from_millis(10));
        let result = gateway.execute(Address::repeat_byte(1), &[0x84]).await;
        assert!(matches!(result, Err(ExecutionError::NoSigner)));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_through_pending_polls() -> Result<(), ExecutionError> {
        let writer = Arc::new(ScriptedWriter::new(vec![None, None, mined(true)]));
        let receipt = gateway(writer.clone()).execute(Address::repeat_byte(1), &[0x84]).await?;
        assert_eq!(receipt.block_number, Some(7));
        assert_eq!(writer.sends.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reverted_receipt_is_its_own_kind() {
        let writer = Arc::new(ScriptedWriter::new(vec![mined(false)]));
        let error = gateway(writer).execute(Address::repeat_byte(1), &[0x84]).await.err();
        assert_eq!(error.as_ref().map(ExecutionError::kind), Some("reverted"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_receipt_timeout_with_hash() {
        let writer = Arc::new(ScriptedWriter::new(vec![]));
        let error = gateway(writer).execute(Address::repeat_byte(1), &[0x84]).await.err();
        assert_eq!(error.as_ref().map(ExecutionError::kind), Some("receipt_timeout"));
        assert_eq!(
            error.and_then(|error| error.tx_hash()),
            Some(H256::repeat_byte(0xab))
        );
    }

    struct StalledWriter;

    #[async_trait]
    impl ChainWriter for StalledWriter {
        async fn send_transaction(&self, _to: Address, _calldata: &[u8]) -> Result<H256, ExecutionError> {
            Ok(H256::repeat_byte(0xcd))
        }

        async fn receipt_status(&self, _tx_hash: H256) -> Result<Option<ReceiptStatus>, ExecutionError> {
            // One lookup spending every retry of a slow node.
            tokio::time::sleep(Duration::from_secs(31)).await;
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_receipt_lookup_is_cut_off_at_the_deadline() {
        let gateway = ExecutionGateway::new(
            Some(Arc::new(StalledWriter)),
            Duration::from_secs(5),
            Duration::from_millis(500),
        );
        let started = tokio::time::Instant::now();
        let error = gateway.wait_for_receipt(H256::repeat_byte(0xcd)).await.err();

        assert_eq!(error.as_ref().map(ExecutionError::kind), Some("receipt_timeout"));
        assert_eq!(error.and_then(|error| error.tx_hash()), Some(H256::repeat_byte(0xcd)));
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn check_receipt_is_a_single_lookup() -> Result<(), ExecutionError> {
        let writer = Arc::new(ScriptedWriter::new(vec![None, mined(true)]));
        let gateway = gateway(writer);
        assert_eq!(gateway.check_receipt(H256::zero()).await?, None);
        assert!(gateway.check_receipt(H256::zero()).await?.is_some());
        Ok(())
    }
}
