//! Ethereum JSON-RPC chain provider
//!
//! Event topics and view selectors are Keccak-256 hashes of the ledger
//! contract's signatures. Every event field is a 32-byte ABI word; indexed
//! fields come from the topics, the rest from the data section, with trailing
//! `uint256[]` fields located through their head offset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use tracing::{debug, warn};

use super::{ChainProvider, LedgerEvent, LedgerLog, TxReceipt};
use crate::config::ChainConfig;
use crate::error::{Error, Result};
use crate::types::{BlockNumber, Bytes32, Epoch, EpochKey};

pub const USER_SIGNED_UP_SIG: &str = "UserSignedUp(uint256,uint256,uint256,uint256)";
pub const ATTESTATION_SUBMITTED_SIG: &str =
    "AttestationSubmitted(uint256,uint256,uint256,uint256,uint256,uint256,uint256[])";
pub const EPOCH_ENDED_SIG: &str = "EpochEnded(uint256)";
pub const USER_STATE_TRANSITIONED_SIG: &str = "UserStateTransitioned(uint256,uint256,uint256[])";

pub fn keccak(input: &[u8]) -> Bytes32 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(input));
    out
}

/// First four bytes of the Keccak hash of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

#[derive(Debug, Clone, Copy)]
struct EventTopics {
    user_signed_up: Bytes32,
    attestation_submitted: Bytes32,
    epoch_ended: Bytes32,
    user_state_transitioned: Bytes32,
}

impl EventTopics {
    fn new() -> Self {
        Self {
            user_signed_up: keccak(USER_SIGNED_UP_SIG.as_bytes()),
            attestation_submitted: keccak(ATTESTATION_SUBMITTED_SIG.as_bytes()),
            epoch_ended: keccak(EPOCH_ENDED_SIG.as_bytes()),
            user_state_transitioned: keccak(USER_STATE_TRANSITIONED_SIG.as_bytes()),
        }
    }

    fn as_hex(&self) -> Vec<String> {
        [
            self.user_signed_up,
            self.attestation_submitted,
            self.epoch_ended,
            self.user_state_transitioned,
        ]
        .iter()
        .map(|t| format!("0x{}", hex::encode(t)))
        .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub log_index: String,
    pub transaction_hash: String,
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    block_number: String,
    status: Option<String>,
    transaction_hash: String,
}

pub struct HttpChainProvider {
    client: Client,
    url: String,
    ledger_address: String,
    social_address: String,
    confirmations: u64,
    tx_timeout: Duration,
    receipt_poll: Duration,
    topics: EventTopics,
    request_id: AtomicU64,
}

impl HttpChainProvider {
    pub fn new(config: &ChainConfig) -> Result<Self> {
        if config.ledger_address.is_empty() {
            return Err(Error::Configuration("chain.ledger_address is not set".into()));
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            url: config.rpc_url.clone(),
            ledger_address: config.ledger_address.clone(),
            social_address: config.social_address.clone(),
            confirmations: config.confirmations,
            tx_timeout: Duration::from_secs(config.tx_timeout_secs),
            receipt_poll: Duration::from_millis(config.receipt_poll_millis.max(1)),
            topics: EventTopics::new(),
            request_id: AtomicU64::new(1),
        })
    }

    async fn call_optional<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::TransientNetwork(format!("{method} failed {status} {text}")));
        }
        let parsed: RpcResponse<T> = resp.json().await?;
        if let Some(err) = parsed.error {
            return Err(Error::TransientNetwork(format!("{method}: {} ({})", err.message, err.code)));
        }
        Ok(parsed.result)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| Error::Decode(format!("{method}: empty result")))
    }

    /// `eth_call` against `to` with a selector and word arguments; returns the first word.
    async fn view(&self, to: &str, signature: &str, args: &[Bytes32]) -> Result<Bytes32> {
        if to.is_empty() {
            return Err(Error::Configuration(format!("no contract address for {signature}")));
        }
        let mut data = selector(signature).to_vec();
        for arg in args {
            data.extend_from_slice(arg);
        }
        let input = format!("0x{}", hex::encode(data));
        let out: String = self.call("eth_call", json!([{ "to": to, "data": input }, "latest"])).await?;
        let words = split_words(&decode_hex(&out)?)?;
        words.first().copied().ok_or_else(|| Error::Decode(format!("{signature}: empty return")))
    }

    async fn raw_block_number(&self) -> Result<BlockNumber> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&raw)
    }

    /// Polls until the receipt exists and its block is past the confirmation depth.
    async fn poll_receipt(&self, transaction_id: &str) -> Result<TxReceipt> {
        loop {
            let receipt: Option<RawReceipt> =
                self.call_optional("eth_getTransactionReceipt", json!([transaction_id])).await?;
            if let Some(receipt) = receipt {
                let block_number = parse_quantity(&receipt.block_number)?;
                if self.get_block_number().await? >= block_number {
                    return Ok(TxReceipt {
                        transaction_id: receipt.transaction_hash,
                        block_number,
                        success: receipt.status.as_deref() != Some("0x0"),
                    });
                }
            }
            tokio::time::sleep(self.receipt_poll).await;
        }
    }

    fn decode_log(&self, raw: RawLog) -> Result<Option<LedgerLog>> {
        if raw.removed {
            warn!(tx = %raw.transaction_hash, "skipping removed log");
            return Ok(None);
        }
        let topics = raw
            .topics
            .iter()
            .map(|t| to_word(&decode_hex(t)?))
            .collect::<Result<Vec<Bytes32>>>()?;
        let Some(signature) = topics.first() else {
            return Ok(None);
        };
        let data = split_words(&decode_hex(&raw.data)?)?;
        let indexed = |i: usize| {
            topics.get(i).copied().ok_or_else(|| Error::Decode(format!("missing topic {i}")))
        };
        let word = |i: usize| data.get(i).copied().ok_or_else(|| Error::Decode(format!("missing word {i}")));

        let event = if *signature == self.topics.user_signed_up {
            LedgerEvent::UserSignedUp {
                epoch: word_to_u64(&indexed(1)?)?,
                identity_commitment: indexed(2)?,
                attester_id: word_to_u64(&word(0)?)?,
                airdrop: word_to_u64(&word(1)?)?,
            }
        } else if *signature == self.topics.attestation_submitted {
            LedgerEvent::AttestationSubmitted {
                epoch: word_to_u64(&indexed(1)?)?,
                epoch_key: EpochKey(word_to_u64(&indexed(2)?)?),
                attester_id: word_to_u64(&word(0)?)?,
                pos_rep: word_to_u64(&word(1)?)?,
                neg_rep: word_to_u64(&word(2)?)?,
                graffiti: word(3)?,
                spent_nullifiers: read_array(&data, &word(4)?)?,
            }
        } else if *signature == self.topics.epoch_ended {
            LedgerEvent::EpochEnded { epoch: word_to_u64(&indexed(1)?)? }
        } else if *signature == self.topics.user_state_transitioned {
            LedgerEvent::UserStateTransitioned {
                to_epoch: word_to_u64(&indexed(1)?)?,
                state_leaf: word(0)?,
                epoch_key_nullifiers: read_array(&data, &word(1)?)?,
            }
        } else {
            return Ok(None);
        };

        Ok(Some(LedgerLog {
            block_number: parse_quantity(&raw.block_number)?,
            log_index: parse_quantity(&raw.log_index)?,
            transaction_id: raw.transaction_hash,
            event,
        }))
    }
}

#[async_trait]
impl ChainProvider for HttpChainProvider {
    async fn get_block_number(&self) -> Result<BlockNumber> {
        Ok(self.raw_block_number().await?.saturating_sub(self.confirmations))
    }

    async fn get_logs(&self, from: BlockNumber, to: BlockNumber) -> Result<Vec<LedgerLog>> {
        let filter = json!({
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
            "address": self.ledger_address,
            "topics": [self.topics.as_hex()],
        });
        let raw: Vec<RawLog> = self.call("eth_getLogs", json!([filter])).await?;
        debug!(from, to, count = raw.len(), "fetched logs");
        let mut logs = Vec::with_capacity(raw.len());
        for entry in raw {
            if let Some(log) = self.decode_log(entry)? {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    async fn wait_for_transaction(&self, transaction_id: &str) -> Result<TxReceipt> {
        tokio::time::timeout(self.tx_timeout, self.poll_receipt(transaction_id)).await.map_err(|_| {
            Error::TransientNetwork(format!("transaction {transaction_id} not confirmed in time"))
        })?
    }

    async fn current_epoch(&self) -> Result<Epoch> {
        word_to_u64(&self.view(&self.ledger_address, "currentEpoch()", &[]).await?)
    }

    async fn epoch_length(&self) -> Result<u64> {
        word_to_u64(&self.view(&self.ledger_address, "epochLength()", &[]).await?)
    }

    async fn latest_epoch_transition_time(&self) -> Result<u64> {
        word_to_u64(&self.view(&self.ledger_address, "latestEpochTransitionTime()", &[]).await?)
    }

    async fn has_user_signed_up(&self, identity_commitment: &Bytes32) -> Result<bool> {
        let out = self
            .view(&self.ledger_address, "hasUserSignedUp(uint256)", &[*identity_commitment])
            .await?;
        Ok(out[31] != 0)
    }

    async fn is_epoch_key_airdropped(&self, epoch_key: EpochKey) -> Result<bool> {
        let out = self
            .view(&self.social_address, "isEpochKeyGotAirdrop(uint256)", &[epoch_key.to_word()])
            .await?;
        Ok(out[31] != 0)
    }
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| Error::Decode(format!("bad hex {s:?}: {e}")))
}

/// Parses a JSON-RPC quantity such as `0x1a`.
pub fn parse_quantity(s: &str) -> Result<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| Error::Decode(format!("bad quantity {s:?}: {e}")))
}

fn to_word(bytes: &[u8]) -> Result<Bytes32> {
    if bytes.len() != 32 {
        return Err(Error::Decode(format!("expected 32-byte word, got {}", bytes.len())));
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(bytes);
    Ok(word)
}

fn split_words(data: &[u8]) -> Result<Vec<Bytes32>> {
    if data.len() % 32 != 0 {
        return Err(Error::Decode(format!("data length {} is not word aligned", data.len())));
    }
    data.chunks(32).map(to_word).collect()
}

/// Reads a big-endian word that must fit in a u64.
pub fn word_to_u64(word: &Bytes32) -> Result<u64> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err(Error::Decode(format!("word 0x{} overflows u64", hex::encode(word))));
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(tail))
}

/// Dynamic `uint256[]` whose head word holds the byte offset into `data`.
fn read_array(data: &[Bytes32], offset: &Bytes32) -> Result<Vec<Bytes32>> {
    let offset = word_to_u64(offset)?;
    if offset % 32 != 0 {
        return Err(Error::Decode(format!("unaligned array offset {offset}")));
    }
    let start = (offset / 32) as usize;
    let len = data
        .get(start)
        .ok_or_else(|| Error::Decode(format!("array offset {offset} out of bounds")))?;
    let len = word_to_u64(len)? as usize;
    let end = start
        .checked_add(1)
        .and_then(|first| first.checked_add(len))
        .ok_or_else(|| Error::Decode(format!("array length {len} overflows")))?;
    data.get(start + 1..end)
        .map(|items| items.to_vec())
        .ok_or_else(|| Error::Decode(format!("array of {len} items truncated")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HttpChainProvider {
        let config = ChainConfig { ledger_address: "0x0000000000000000000000000000000000000001".into(), ..Default::default() };
        HttpChainProvider::new(&config).unwrap()
    }

    fn u64_to_word(value: u64) -> Bytes32 { EpochKey(value).to_word() }

    fn hex_word(word: &Bytes32) -> String { format!("0x{}", hex::encode(word)) }

    fn raw(topics: Vec<Bytes32>, data: Vec<Bytes32>) -> RawLog {
        RawLog {
            topics: topics.iter().map(hex_word).collect(),
            data: format!("0x{}", hex::encode(data.concat())),
            block_number: "0x10".into(),
            log_index: "0x2".into(),
            transaction_hash: "0xabc".into(),
            removed: false,
        }
    }

    #[test]
    fn test_known_selector() {
        // transfer(address,uint256)
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_word_to_u64_rejects_overflow() {
        let mut word = u64_to_word(5);
        assert_eq!(word_to_u64(&word).unwrap(), 5);
        word[0] = 1;
        assert!(matches!(word_to_u64(&word), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_attestation_with_nullifier_array() {
        let p = provider();
        let topics = vec![p.topics.attestation_submitted, u64_to_word(3), u64_to_word(0xbeef)];
        let data = vec![
            u64_to_word(1),
            u64_to_word(5),
            u64_to_word(0),
            [7u8; 32],
            u64_to_word(5 * 32),
            u64_to_word(2),
            [8u8; 32],
            [9u8; 32],
        ];
        let log = p.decode_log(raw(topics, data)).unwrap().unwrap();
        assert_eq!(log.block_number, 16);
        assert_eq!(log.log_index, 2);
        assert_eq!(
            log.event,
            LedgerEvent::AttestationSubmitted {
                epoch: 3,
                epoch_key: EpochKey(0xbeef),
                attester_id: 1,
                pos_rep: 5,
                neg_rep: 0,
                graffiti: [7u8; 32],
                spent_nullifiers: vec![[8u8; 32], [9u8; 32]],
            }
        );
    }

    #[test]
    fn test_decode_epoch_ended_and_unknown() {
        let p = provider();
        let log = p.decode_log(raw(vec![p.topics.epoch_ended, u64_to_word(4)], vec![])).unwrap().unwrap();
        assert_eq!(log.event, LedgerEvent::EpochEnded { epoch: 4 });
        assert!(p.decode_log(raw(vec![[1u8; 32]], vec![])).unwrap().is_none());
    }

    #[test]
    fn test_truncated_array_is_decode_error() {
        let p = provider();
        let topics = vec![p.topics.user_state_transitioned, u64_to_word(2)];
        let data = vec![[1u8; 32], u64_to_word(64), u64_to_word(3), [2u8; 32]];
        assert!(matches!(p.decode_log(raw(topics, data)), Err(Error::Decode(_))));
    }

    #[test]
    fn test_oversized_array_length_is_decode_error() {
        let p = provider();
        let topics = vec![p.topics.user_state_transitioned, u64_to_word(2)];
        let data = vec![[1u8; 32], u64_to_word(64), u64_to_word(u64::MAX), [2u8; 32]];
        assert!(matches!(p.decode_log(raw(topics, data)), Err(Error::Decode(_))));
    }

    #[test]
    fn test_requires_ledger_address() {
        assert!(matches!(
            HttpChainProvider::new(&ChainConfig::default()),
            Err(Error::Configuration(_))
        ));
    }
}
